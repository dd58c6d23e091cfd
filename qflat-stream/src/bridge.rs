// SPDX-License-Identifier: MIT

//! Pull/push bridge: a dedicated OS thread runs the writer's unbounded
//! "push bytes" calls; a zero-capacity `mpsc` channel turns that into the
//! consumer's "pull one fixed-size chunk" API. The rendezvous channel
//! (`sync_channel(0)`) is the suspension point: `send` blocks until the
//! consumer calls `recv` via [`Bridge::read`], which is exactly the
//! yield/resume contract a cooperative coroutine would give.

use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use crate::error::{StreamError, StreamResult};

pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Handle passed to the producer closure. Buffers pushed bytes into
/// `CHUNK_SIZE` chunks and hands each full chunk to the consumer thread
/// through the rendezvous channel. `co_write`, `co_write_zeros`, and
/// `increase_size` are this port's equivalents of the three suspension
/// points: all funnel through the same buffering logic, differing only in
/// whether bytes are supplied by the caller or synthesized as zeros.
pub struct CoWriter {
    sender: SyncSender<StreamResult<Vec<u8>>>,
    buf: Vec<u8>,
}

impl CoWriter {
    fn new(sender: SyncSender<StreamResult<Vec<u8>>>) -> Self {
        CoWriter {
            sender,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    /// Pushes caller-supplied bytes into the stream.
    pub fn co_write(&mut self, mut data: &[u8]) -> StreamResult<()> {
        while !data.is_empty() {
            let space = CHUNK_SIZE - self.buf.len();
            let take = space.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == CHUNK_SIZE {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    /// Pushes `len` zero bytes without materializing them as a caller
    /// buffer.
    pub fn co_write_zeros(&mut self, mut len: u64) -> StreamResult<()> {
        while len > 0 {
            let space = (CHUNK_SIZE - self.buf.len()) as u64;
            let take = space.min(len);
            self.buf.resize(self.buf.len() + take as usize, 0);
            len -= take;
            if self.buf.len() == CHUNK_SIZE {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    /// Reserves `len` additional output bytes as zeros. Same suspension
    /// contract as `co_write_zeros`; kept as a distinct entry point to
    /// mirror the producer's three named primitives.
    #[inline]
    pub fn increase_size(&mut self, len: u64) -> StreamResult<()> {
        self.co_write_zeros(len)
    }

    fn flush_chunk(&mut self) -> StreamResult<()> {
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.sender
            .send(Ok(chunk))
            .map_err(|_| StreamError::BridgeClosed)
    }

    fn finish(mut self) -> StreamResult<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.sender
                .send(Ok(chunk))
                .map_err(|_| StreamError::BridgeClosed)?;
        }
        Ok(())
    }
}

/// Runs `producer` on a dedicated thread and exposes its output as a pull
/// API. Dropping the bridge (or calling `close`) drops the receiver, which
/// makes any pending or future `send` in the writer thread fail, so a
/// suspended writer unwinds without an explicit cancellation flag.
pub struct Bridge {
    receiver: Option<Receiver<StreamResult<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
    eof: bool,
}

impl Bridge {
    pub fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(&mut CoWriter) -> StreamResult<()> + Send + 'static,
    {
        let (tx, rx) = sync_channel::<StreamResult<Vec<u8>>>(0);
        let handle = std::thread::spawn(move || {
            let mut writer = CoWriter::new(tx.clone());
            match producer(&mut writer) {
                Ok(()) => {
                    let _ = writer.finish();
                }
                Err(e) => {
                    if !writer.buf.is_empty() {
                        let _ = writer.flush_chunk();
                    }
                    let _ = writer.sender.send(Err(e));
                }
            }
        });
        Bridge {
            receiver: Some(rx),
            handle: Some(handle),
            eof: false,
        }
    }

    /// Pulls the next chunk. An empty vec signals end of stream. Once EOF
    /// or an error has been observed, further calls return the same
    /// terminal result without touching the channel again.
    pub fn read(&mut self) -> StreamResult<Vec<u8>> {
        if self.eof {
            return Ok(Vec::new());
        }
        let Some(rx) = self.receiver.as_ref() else {
            self.eof = true;
            return Ok(Vec::new());
        };
        match rx.recv() {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => {
                self.eof = true;
                Err(e)
            }
            Err(_) => {
                self.eof = true;
                Ok(Vec::new())
            }
        }
    }

    /// Drops the receiver (unblocking/failing the writer thread) and joins
    /// it. Idempotent.
    pub fn close(&mut self) {
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}
