// SPDX-License-Identifier: MIT

//! Output-format dispatch. One driver today (`qcow2`); the lookup-by-name
//! shape mirrors the teacher's `Output::from_path` extension dispatch so a
//! second format is a second match arm away, not a rewrite.

use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Qcow2,
}

impl Format {
    pub fn by_name(name: &str) -> StreamResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "qcow2" => Ok(Format::Qcow2),
            _ => Err(StreamError::DriverNotFound),
        }
    }
}
