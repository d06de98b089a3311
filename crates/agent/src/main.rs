//! dirdiff-agent: remote side of a dirdiff sync
//!
//! Deployed to remote hosts and started over SSH. Serves one request at a
//! time from stdin and answers on stdout using the framed protocol; logs go
//! to stderr.

use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dirdiff_core::fs_ops;
use dirdiff_core::{Message, ProtocolReader, ProtocolWriter, Scanner};

#[derive(Parser)]
#[command(name = "dirdiff-agent")]
#[command(about = "Remote agent for dirdiff directory sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests from stdin until shutdown or EOF
    Daemon {
        /// Root directory of the remote tree
        #[arg(short, long)]
        root: PathBuf,
    },
    /// Print version and exit
    Version,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DIRDIFF_AGENT_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            eprintln!("dirdiff-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Daemon { root } => {
            std::fs::create_dir_all(&root)?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve(
                &root,
                BufReader::new(stdin.lock()),
                BufWriter::new(stdout.lock()),
            )?;
        }
    }

    Ok(())
}

/// Whether the loop keeps serving after a request
enum Flow {
    Continue,
    Shutdown,
}

/// Serve requests until a shutdown request or end of input
fn serve<R: std::io::Read, W: Write>(root: &Path, input: R, output: W) -> Result<()> {
    info!("dirdiff-agent {} serving {}", env!("CARGO_PKG_VERSION"), root.display());

    let mut reader = ProtocolReader::new(input);
    let mut writer = ProtocolWriter::new(output);

    loop {
        let msg = match reader.read_message() {
            Ok(msg) => msg,
            Err(e) if e.downcast_ref::<std::io::Error>().is_some() => {
                debug!("Input closed: {e}");
                break;
            }
            Err(e) => {
                // The frame was consumed whole, so the stream is still aligned
                warn!("Rejected request: {e:#}");
                writer.send_error(&format!("{e:#}"))?;
                continue;
            }
        };

        match handle_message(root, msg, &mut writer) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Shutdown) => break,
            Err(e) => {
                warn!("Request failed: {e:#}");
                writer.send_error(&format!("{e:#}"))?;
            }
        }
    }

    info!("dirdiff-agent shutting down");
    Ok(())
}

fn handle_message<W: Write>(
    root: &Path,
    msg: Message,
    writer: &mut ProtocolWriter<W>,
) -> Result<Flow> {
    match msg {
        Message::SnapshotReq(options) => {
            let outcome = Scanner::new(root).with_options(options).scan()?;
            for skipped in &outcome.skipped {
                debug!("Skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            writer.send_snapshot_resp(&outcome.snapshot)?;
        }
        Message::WriteFile { path, data, mode } => {
            fs_ops::write_file(root, &path, &data, mode)?;
            writer.send_ok()?;
        }
        Message::DeleteFile { path } => {
            fs_ops::delete_file(root, &path)?;
            writer.send_ok()?;
        }
        Message::MoveFile { src, dst } => {
            fs_ops::move_file(root, &src, &dst)?;
            writer.send_ok()?;
        }
        Message::CopyFile { src, dst } => {
            fs_ops::copy_file(root, &src, &dst)?;
            writer.send_ok()?;
        }
        Message::Shutdown => {
            writer.send_ok()?;
            return Ok(Flow::Shutdown);
        }
        other => {
            color_eyre::eyre::bail!("Unexpected request: {other:?}");
        }
    }
    Ok(Flow::Continue)
}
