// SPDX-License-Identifier: MIT

#[macro_use]
mod log;
mod progress;

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::log::LogLevel;
use qflat_stream::Stream;

#[derive(Parser)]
#[command(name = "qflat", version, about = "QCOW2 chain flattener", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header fields of a QCOW2 image
    DumpInfo {
        /// Output driver name ("qcow2" is the only one registered)
        format: String,
        /// Path to the QCOW2 image
        vdi: PathBuf,
    },
    /// Stream a flattened QCOW2 image to a file
    StreamToFile {
        /// Destination path
        output: PathBuf,
        /// Output driver name ("qcow2" is the only one registered)
        format: String,
        /// Head image in the backing-file chain
        vdi: PathBuf,
        /// Ancestor at which to stop flattening (defaults to none: flatten
        /// the whole chain)
        base: Option<PathBuf>,

        #[arg(long, short, action = clap::ArgAction::Count)]
        verbose: u8,
        #[arg(long, short)]
        quiet: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::DumpInfo { format, vdi } => dump_info(&format, &vdi),
        Commands::StreamToFile {
            output,
            format,
            vdi,
            base,
            verbose,
            quiet,
        } => {
            if quiet {
                log::set_log_level(LogLevel::Quiet);
            } else if verbose > 0 {
                log::set_log_level(LogLevel::Verbose);
            }
            stream_to_file(&output, &format, &vdi, base.as_deref())
        }
    };

    if let Err(e) = result {
        log_normal!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn dump_info(format: &str, vdi: &std::path::Path) -> anyhow::Result<()> {
    if qflat_stream::Format::by_name(format).is_err() {
        anyhow::bail!("unknown output format '{format}'");
    }
    let info = qflat_stream::dump_info(vdi)?;
    print!("{info}");
    Ok(())
}

fn stream_to_file(
    output: &std::path::Path,
    format: &str,
    vdi: &std::path::Path,
    base: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let t0 = Instant::now();
    log_info!(
        "streaming {} -> {} (format {format})",
        vdi.display(),
        output.display()
    );

    let mut stream = Stream::new();
    let res = (|| -> anyhow::Result<u64> {
        stream.open(format, vdi, base)?;
        let mut file = std::fs::File::create(output)?;
        let pb = progress::spinner("writing");
        let mut total = 0u64;
        loop {
            let chunk = stream.read()?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
            pb.set_position(total);
            log_verbose!("wrote chunk of {} bytes ({} total)", chunk.len(), total);
        }
        pb.finish_and_clear();
        Ok(total)
    })();
    stream.close();

    let dt = t0.elapsed().as_secs_f32();
    match res {
        Ok(total) => {
            log_normal!(
                "{} wrote {} ({total} bytes) in {dt:.2}s",
                "done:".green().bold(),
                output.display()
            );
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(output);
            anyhow::bail!("failed to stream {}: {e}", vdi.display())
        }
    }
}
