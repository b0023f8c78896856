//! Sapling, a lazy-loading tree explorer.
//!
//! Thin binary entry point. Opens a directory through the filesystem
//! provider, expands it to the requested depth and prints the rows. All
//! loading logic lives in `sapling-core`; row building in `sapling-view`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sapling_core::export::export_csv;
use sapling_core::fs::size::format_size;
use sapling_core::fs::FileSystemProvider;
use sapling_core::{AsyncTreeModel, EngineConfig, LoadMode, LoadState, QueuePolicy};
use sapling_view::TreeViewState;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ───────────────────────────────────────── CLI ───────────────

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), about = "Lazy-loading directory tree explorer")]
struct Cli {
    /// Directory to open (defaults to `.`).
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Expand directories down to this depth.
    #[arg(long, default_value_t = 2)]
    depth: u16,

    /// Worker threads per tree (`0` = one thread per load).
    #[arg(long)]
    threads: Option<usize>,

    /// Load children on the calling thread instead of in the background.
    #[arg(long)]
    sync: bool,

    /// Share one worker pool between all trees.
    #[arg(long)]
    shared: bool,

    /// Show hidden (dot) files.
    #[arg(long)]
    hidden: bool,

    /// Interleave directories and files instead of listing directories first.
    #[arg(long)]
    mixed: bool,

    /// Engine configuration file (JSON). Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write the loaded tree to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Give up if loading takes longer than this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(threads) = self.threads {
            config.max_threads = threads;
        }
        if self.sync {
            config.load_mode = LoadMode::Sync;
        }
        if self.shared {
            config.policy = QueuePolicy::Shared;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so the printed tree stays clean on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.engine_config()?;
    info!(
        "Sapling starting: {} (mode {:?}, threads {}, policy {:?})",
        cli.path.display(),
        config.load_mode,
        config.max_threads,
        config.policy
    );

    let queues = config.worker_queues();
    let provider = Arc::new(
        FileSystemProvider::new(&cli.path)
            .with_hidden(cli.hidden)
            .with_dirs_first(!cli.mixed),
    );
    let model = AsyncTreeModel::new(provider, queues.register(), &config);
    let mut view = TreeViewState::new(model);

    let started = Instant::now();
    expand_to_depth(&mut view, cli.depth, Duration::from_secs(cli.timeout))?;
    info!(
        "Loaded {} nodes in {:.2?}",
        view.model().len(),
        started.elapsed()
    );

    print_rows(&view)?;

    if let Some(path) = &cli.csv {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let rows = export_csv(
            view.model(),
            BufWriter::new(file),
            |e| e.path.display().to_string(),
            |e| e.name.to_string(),
        )?;
        info!("Wrote {rows} rows to {}", path.display());
    }

    queues.close();
    Ok(())
}

/// Expand every directory shallower than `depth`, pumping loads until the
/// tree stops growing.
fn expand_to_depth(
    view: &mut TreeViewState<FileSystemProvider>,
    depth: u16,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let pending: Vec<_> = view
            .visible_rows
            .iter()
            .filter(|r| r.depth < depth && !r.is_expanded)
            .map(|r| r.node)
            .collect();
        let mut expanded_any = false;
        for node in pending {
            expanded_any |= view.expand(node);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !view.model_mut().wait_until_idle(remaining) {
            bail!("loading did not finish within {timeout:?}");
        }
        view.process_messages();

        if !expanded_any {
            return Ok(());
        }
    }
}

fn print_rows(view: &TreeViewState<FileSystemProvider>) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let model = view.model();
    for row in &view.visible_rows {
        let Some(entry) = model.node(row.node) else {
            continue;
        };
        let indent = "  ".repeat(row.depth as usize);
        if entry.is_dir {
            write!(out, "{indent}{}/", entry.name)?;
            if row.state == LoadState::Failed {
                if let Some(failure) = model.failure(row.node) {
                    write!(
                        out,
                        "  [failed {}: {}]",
                        failure.at.format("%H:%M:%S"),
                        failure.error
                    )?;
                }
            }
            writeln!(out)?;
        } else {
            writeln!(out, "{indent}{}  {}", entry.name, format_size(entry.size))?;
        }
    }
    out.flush()?;
    Ok(())
}
