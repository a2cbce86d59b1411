use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

use slot_cache::benign_error::errno;
use slot_cache::config::Config;
use slot_cache::maintenance::sweep_orphan_locks;
use slot_cache::request::CgiRequest;
use slot_cache::StdoutGenerator;

/// Environment variable holding the log filter, in `EnvFilter` syntax.
const LOG_ENV: &str = "SLOT_CACHE_LOG";

/// A lock-coordinated on-disk response cache for CGI programs.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serves the current CGI request, from the cache when possible.
    ///
    /// On a miss, runs the command with its standard output captured
    /// into the cache.
    Serve {
        /// Path to the YAML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// The CGI program that renders the response.
        #[arg(required = true, last = true)]
        command: Vec<OsString>,
    },

    /// Lists the slots in a cache directory.
    Ls {
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Defaults to the configured cache root.
        dir: Option<PathBuf>,
    },

    /// Deletes orphaned lock files from a cache directory.
    Sweep {
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Only delete lock files at least this old, e.g. `30m`.
        /// Defaults to the configured `lock-stale-after`.
        #[arg(long, value_parser = humantime::parse_duration)]
        max_age: Option<Duration>,

        /// Defaults to the configured cache root.
        dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    // Diagnostics go to the web server's error log verbatim.
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::get(path).context("failed to load configuration")
}

fn serve(config: Option<&Path>, command: &[OsString]) -> Result<()> {
    let config = load_config(config)?;
    let request = CgiRequest::from_env();

    let mut cache = config.slot_cache();
    if request.bypasses_cache() {
        cache = slot_cache::SlotCache::disabled();
    }

    let (program, args) = command
        .split_first()
        .context("missing command to run")?;
    let mut generator = StdoutGenerator(|| {
        let status = Command::new(program).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} failed: {}", Path::new(program).display(), status),
            ))
        }
    });

    let key = request.cache_key();
    let ttl = config.ttl_for(&request.class());
    let mut stdout = std::io::stdout();
    cache.process(key.as_bytes(), ttl, &mut stdout, &mut generator)?;
    stdout.flush()?;
    Ok(())
}

fn ls(config: Option<&Path>, dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => load_config(config)?.cache_root,
    };

    let entries = slot_cache::list(&dir)
        .with_context(|| format!("failed to list {}", dir.display()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for entry in entries {
        writeln!(out, "{}", entry)?;
    }

    out.flush()?;
    Ok(())
}

fn sweep(config: Option<&Path>, max_age: Option<Duration>, dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let dir = dir.unwrap_or(config.cache_root);
    let max_age = max_age.unwrap_or(config.lock_stale_after);

    let removed = sweep_orphan_locks(&dir, max_age)
        .with_context(|| format!("failed to sweep {}", dir.display()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for path in removed {
        writeln!(out, "{}", path.display())?;
    }

    out.flush()?;
    Ok(())
}

/// Returns the errno behind `error`, or 1 if it isn't an I/O error.
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .map(errno)
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let ret = match &cli.command {
        Commands::Serve { config, command } => serve(config.as_deref(), command),
        Commands::Ls { config, dir } => ls(config.as_deref(), dir.clone()),
        Commands::Sweep {
            config,
            max_age,
            dir,
        } => sweep(config.as_deref(), *max_age, dir.clone()),
    };

    if let Err(e) = ret {
        let code = exit_code(&e);
        tracing::error!("Error processing page: {:#} ({})", e, code);
        std::process::exit(code);
    }
}
