//! dirdiff: revision tracking and move-aware directory sync
//!
//! - Snapshots a tree into an append-only revision history
//! - Diffs revisions, telling renames and relocations apart from edits
//! - Syncs the newest revision to a local or SSH remote, turning moves and
//!   duplicates into remote-side moves and copies instead of uploads
//! - Resumes interrupted syncs where they stopped

mod debug_log;
mod embedded_agents;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dirdiff_core::executor::ProgressFn;
use dirdiff_core::{
    DiffResult, DirdiffConfig, ExecutorOptions, MoveKind, Operation, RevisionId, RevisionStore,
    ScanOptions, ScanOutcome, Scanner, SyncOptions, SyncSession, Transport, diff,
};
use dirdiff_transport::{LocalTransport, SshTransport};

use crate::progress::{Status, SyncProgress, print_status, print_warning};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "dirdiff")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Revision tracking and move-aware directory sync")]
#[command(long_about = r#"
dirdiff keeps a revision history of a directory and syncs it to a remote
without re-sending files that were only renamed, moved or duplicated.

Examples:
  dirdiff snapshot ./project                     Record a new revision
  dirdiff log ./project                          List revisions
  dirdiff diff ./project HEAD~2 HEAD             Show what changed
  dirdiff sync ./project user@host:/srv/project  Sync over SSH
  dirdiff sync ./project /mnt/backup/project     Sync to a local directory
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory and commit it as a new revision if it changed
    Snapshot {
        /// Tree root
        dir: PathBuf,
    },

    /// List recorded revisions
    Log {
        /// Tree root
        dir: PathBuf,
    },

    /// Show the changes between two revisions
    Diff {
        /// Tree root
        dir: PathBuf,

        /// Old revision (N, rN, HEAD, HEAD~N)
        #[arg(default_value = "HEAD~1")]
        from: String,

        /// New revision
        #[arg(default_value = "HEAD")]
        to: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Summary)]
        format: OutputFormat,
    },

    /// Snapshot a directory and sync it to a remote
    Sync(SyncArgs),

    /// Scan a directory without recording a revision
    Scan {
        /// Directory to scan
        path: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Summary)]
        format: OutputFormat,
    },

    /// Show version and build info
    Version,
}

#[derive(Args)]
struct SyncArgs {
    /// Local tree root
    dir: PathBuf,

    /// Remote destination (user@host:/path, or a local directory)
    remote: String,

    /// SSH port
    #[arg(short, long, default_value = "22")]
    port: u16,

    /// Operations in flight at once (overrides .dirdiff.toml)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Discard an interrupted sync instead of resuming it
    #[arg(long)]
    fresh: bool,

    /// Print the plan without changing the remote
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Summary,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let logging = debug_log::init(cli.verbose);
    debug!("Debug log at {}", logging.log_path.display());

    match cli.command {
        Commands::Version => {
            eprintln!("dirdiff {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Snapshot { dir } => snapshot_command(&dir)?,
        Commands::Log { dir } => log_command(&dir)?,
        Commands::Diff {
            dir,
            from,
            to,
            format,
        } => diff_command(&dir, &from, &to, format)?,
        Commands::Scan { path, format } => scan_command(&path, format)?,
        Commands::Sync(args) => sync_command(args).await?,
    }

    Ok(())
}

/// A local tree with its configuration
struct Tree {
    root: PathBuf,
    config: DirdiffConfig,
    scan: ScanOptions,
}

impl Tree {
    fn open(dir: &Path) -> Result<Self> {
        let root = dir
            .canonicalize()
            .wrap_err_with(|| format!("cannot open {}", dir.display()))?;
        let config = DirdiffConfig::load(&root)?;
        let scan = ScanOptions::from_config(&config);
        Ok(Self { root, config, scan })
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(&self.root).with_options(self.scan.clone())
    }

    fn store(&self) -> Result<RevisionStore> {
        Ok(RevisionStore::open(&self.root)?)
    }
}

fn report_skipped(outcome: &ScanOutcome) {
    for skipped in &outcome.skipped {
        print_warning(
            Status::SKIPPED,
            &format!("{} ({})", skipped.path.display(), skipped.reason),
        );
    }
}

/// Commit a scan if it differs from head, reporting the result
fn commit_scan(store: &RevisionStore, outcome: &ScanOutcome) -> Result<RevisionId> {
    report_skipped(outcome);
    let (id, changed) = store.commit_if_changed(&outcome.snapshot)?;
    progress::print_committed(
        &id.to_string(),
        outcome.snapshot.len(),
        outcome.snapshot.total_size(),
        changed,
    );
    Ok(id)
}

fn snapshot_command(dir: &Path) -> Result<()> {
    let tree = Tree::open(dir)?;
    let store = tree.store()?;

    print_status(Status::SCANNING, &tree.root.display().to_string());
    let outcome = tree.scanner().scan()?;
    commit_scan(&store, &outcome)?;
    Ok(())
}

fn log_command(dir: &Path) -> Result<()> {
    let tree = Tree::open(dir)?;
    let store = tree.store()?;
    let head = store.head_id();

    let entries = store.list();
    if entries.is_empty() {
        eprintln!("No revisions yet; run `dirdiff snapshot {}`", dir.display());
        return Ok(());
    }

    for entry in entries.into_iter().rev() {
        match entry {
            Ok(info) => {
                let created = chrono::DateTime::<chrono::Local>::from(info.created);
                let marker = if Some(info.id) == head { "  (HEAD)" } else { "" };
                println!(
                    "{:<6} {}  {:>7} files  {:>11}{marker}",
                    info.id.to_string(),
                    created.format("%Y-%m-%d %H:%M:%S"),
                    info.file_count,
                    progress::format_bytes(info.total_size),
                );
            }
            Err(e) => print_warning("Unreadable", &e.to_string()),
        }
    }
    Ok(())
}

fn diff_command(dir: &Path, from: &str, to: &str, format: OutputFormat) -> Result<()> {
    let tree = Tree::open(dir)?;
    let store = tree.store()?;

    let from_id = store.resolve(from)?;
    let to_id = store.resolve(to)?;
    let result = diff(&store.get(from_id)?, &store.get(to_id)?);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Summary => print_diff(from_id, to_id, &result),
    }
    Ok(())
}

fn print_diff(from: RevisionId, to: RevisionId, result: &DiffResult) {
    if result.is_empty() {
        println!("{from}..{to}: no changes");
        return;
    }
    println!(
        "{from}..{to}: {} changes, {} unchanged",
        result.len(),
        result.unchanged.len()
    );

    let moved = console::Style::new().cyan();
    let added = console::Style::new().green();
    let removed = console::Style::new().red();
    let modified = console::Style::new().yellow();

    for pair in &result.moved {
        let label = match pair.kind() {
            MoveKind::Rename => "renamed",
            MoveKind::Relocate => "moved",
        };
        println!(
            "  {:>9} {} -> {}",
            moved.apply_to(label),
            pair.from.display(),
            pair.to.display()
        );
    }
    for record in &result.added {
        println!("  {:>9} {}", added.apply_to("added"), record.path.display());
    }
    for record in &result.removed {
        println!("  {:>9} {}", removed.apply_to("removed"), record.path.display());
    }
    for change in &result.modified {
        println!("  {:>9} {}", modified.apply_to("modified"), change.path.display());
    }
}

fn scan_command(path: &Path, format: OutputFormat) -> Result<()> {
    let tree = Tree::open(path)?;
    let outcome = tree.scanner().scan()?;
    let snapshot = &outcome.snapshot;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(snapshot)?),
        OutputFormat::Summary => {
            eprintln!("Files: {}", snapshot.len());
            eprintln!("Total size: {}", progress::format_bytes(snapshot.total_size()));

            if snapshot.len() <= 20 {
                eprintln!("\nFiles:");
                for record in snapshot.records() {
                    eprintln!(
                        "  {} ({} bytes, {})",
                        record.path.display(),
                        record.size,
                        record.fingerprint.short()
                    );
                }
            }
            report_skipped(&outcome);
        }
    }
    Ok(())
}

/// Where a sync goes
#[derive(Debug, PartialEq, Eq)]
enum Remote {
    Local(PathBuf),
    Ssh {
        user: String,
        host: String,
        path: String,
    },
}

/// Parse `user@host:/path` as an SSH remote; anything else is a local path
fn parse_remote(remote: &str) -> Result<Remote> {
    let Some((login, path)) = remote.split_once(':') else {
        return Ok(Remote::Local(PathBuf::from(remote)));
    };
    let Some((user, host)) = login.split_once('@') else {
        return Ok(Remote::Local(PathBuf::from(remote)));
    };
    if login.contains('/') {
        return Ok(Remote::Local(PathBuf::from(remote)));
    }

    if user.is_empty() || host.is_empty() {
        bail!("Invalid remote `{remote}`, expected user@host:/path");
    }
    if path.is_empty() {
        bail!("Remote `{remote}` has no path");
    }

    Ok(Remote::Ssh {
        user: user.to_string(),
        host: host.to_string(),
        path: path.to_string(),
    })
}

/// Absolute form of `path` with symlinks resolved as far as it exists
fn resolve_partially(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    for existing in absolute.ancestors() {
        if let Ok(resolved) = existing.canonicalize() {
            let rest = absolute.strip_prefix(existing)?;
            return Ok(resolved.join(rest));
        }
    }
    Ok(absolute)
}

/// A local remote must not contain the tree or lie inside it
fn check_disjoint(tree_root: &Path, remote: &Path) -> Result<()> {
    let remote = resolve_partially(remote)?;
    if remote.starts_with(tree_root) {
        bail!(
            "Remote {} is inside the tree being synced",
            remote.display()
        );
    }
    if tree_root.starts_with(&remote) {
        bail!(
            "Remote {} contains the tree being synced",
            remote.display()
        );
    }
    Ok(())
}

/// Open a transport to the remote, deploying the agent over SSH if needed
async fn connect(remote: &Remote, port: u16, tree: &Tree) -> Result<Box<dyn Transport>> {
    match remote {
        Remote::Local(path) => {
            check_disjoint(&tree.root, path)?;
            let transport = LocalTransport::new(path)
                .wrap_err_with(|| format!("cannot open {}", path.display()))?;
            Ok(Box::new(transport))
        }
        Remote::Ssh { user, host, path } => {
            print_status(Status::CONNECTING, &format!("{user}@{host}:{port}"));
            let mut ssh = SshTransport::connect(host, port, user).await?;

            let bundle = embedded_agents::agent_bundle()?;
            if bundle.has(ssh.platform()) {
                let agent = ssh.ensure_agent(&bundle).await?;
                debug!("Agent ready at {}", agent.display());
            } else {
                warn!(
                    "No bundled agent for {:?}; using dirdiff-agent from the remote PATH",
                    ssh.platform()
                );
                ssh.use_installed_agent();
            }

            Ok(Box::new(ssh.open_session(path)?))
        }
    }
}

async fn sync_command(args: SyncArgs) -> Result<()> {
    let remote = parse_remote(&args.remote)?;
    let tree = Tree::open(&args.dir)?;
    let store = tree.store()?;
    let progress = SyncProgress::new();

    print_status(Status::SCANNING, &tree.root.display().to_string());
    let scanner = tree.scanner();
    let outcome = tokio::task::spawn_blocking(move || scanner.scan()).await??;
    commit_scan(&store, &outcome)?;

    let transport = connect(&remote, args.port, &tree).await?;
    let description = transport.describe();

    let cancel = CancellationToken::new();
    let options = SyncOptions {
        executor: ExecutorOptions {
            concurrency: args
                .concurrency
                .unwrap_or(tree.config.transfer_concurrency),
            retry: tree.config.retry,
            scan: tree.scan.clone(),
            cancel: cancel.clone(),
        },
        fresh: args.fresh,
    };

    if args.dry_run {
        let (plan, preview) = SyncSession::new(&store, transport.as_ref(), options)
            .preview()
            .await?;
        if preview.resumed {
            print_status(
                Status::RESUMING,
                &format!("{} of {} operations already done", preview.already_done, plan.len()),
            );
        }
        print_status(Status::PLANNED, &progress::describe_plan(&preview.summary));
        for operation in plan.operations.iter().filter(|op| !op.is_keep()) {
            println!("  {operation}");
        }
        if let Some(limit) = transport.max_write_len() {
            for operation in plan.transfers_over(limit) {
                print_warning(
                    "Too large",
                    &format!("{operation}; {description} accepts at most {limit} bytes"),
                );
            }
        }
        transport.shutdown().await?;
        return Ok(());
    }

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, waiting for operations in flight");
                cancel.cancel();
            }
        })
    };

    let bar = progress.operation_bar();
    let on_progress: ProgressFn = {
        let bar = bar.clone();
        let sent = Arc::new(AtomicU64::new(0));
        Arc::new(move |operation: &Operation, bytes: u64| {
            let total = sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
            debug!("Done: {operation}");
            bar.inc(1);
            bar.set_prefix(progress::format_bytes(total));
        })
    };

    let result = SyncSession::new(&store, transport.as_ref(), options)
        .with_progress(on_progress)
        .run()
        .await;
    bar.finish_and_clear();
    interrupt.abort();

    if let Err(e) = transport.shutdown().await {
        warn!("Closing {description}: {e}");
    }
    let report = result?;

    let outcome = &report.outcome;
    if !outcome.remaining.is_empty() {
        progress.stopped(
            outcome.failure.as_ref(),
            outcome.cancelled,
            outcome.remaining.len(),
        );
        return Err(eyre!("Sync to {description} incomplete"));
    }

    if let Some(verification) = &outcome.verification {
        progress.verification(verification);
        if !verification.is_clean() {
            bail!("{description} does not match {}", report.revision);
        }
    }

    progress.finish(
        &report.revision.to_string(),
        &description,
        outcome.bytes_transferred,
    );
    Ok(())
}
