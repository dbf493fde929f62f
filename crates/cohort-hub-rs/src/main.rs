mod hub;
mod metrics;
mod server;
mod watcher;

use anyhow::{bail, Context};
use clap::Parser;
use cohort_core::config::{
    env_true, flag_or_env, parse_bool_env, resolve_addr, resolve_log_dir, resolve_log_level,
    resolve_session_id, resolve_workspace,
};
use cohort_core::locks::DEFAULT_LOCK_TTL_SECS;
use cohort_core::orchestrator::{OrchestrationMode, ENV_ORCHESTRATION_MODE};
use hub::CoreSettings;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const ENV_HUB_DEBUG: &str = "COHORT_HUB_DEBUG";
const ENV_APPLY_MERGES: &str = "COHORT_APPLY_MERGES";

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub session_id: String,
    pub addr: String,
    pub workspace: PathBuf,
    pub debug: bool,
    pub log_dir: String,
    pub lock_ttl_secs: u64,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    pub expiry_interval: Duration,
    pub snapshot_interval: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub recent_changes: usize,
    pub watch: bool,
    pub apply_merges: bool,
    pub queue_capacity: usize,
    pub mode: Option<OrchestrationMode>,
}

impl Config {
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            workspace: self.workspace.clone(),
            lock_ttl_secs: self.lock_ttl_secs,
            heartbeat_timeout: self.heartbeat_timeout,
            recent_capacity: self.recent_changes,
            apply_merges: self.apply_merges,
            checksum_capacity: hub::DEFAULT_CHECKSUM_CAPACITY,
            mode: self.mode,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "cohort-hub", about = "Coordination hub for agents sharing one workspace")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    workspace: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = DEFAULT_LOCK_TTL_SECS)]
    lock_ttl: u64,
    #[arg(long, default_value_t = 120)]
    heartbeat_timeout: u64,
    #[arg(long, default_value_t = 60)]
    heartbeat_check_interval: u64,
    #[arg(long, default_value_t = 30)]
    expiry_interval: u64,
    #[arg(long, default_value_t = 60)]
    snapshot_interval: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 100)]
    recent_changes: usize,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    no_watch: bool,
    /// `true`/`false`; falls back to COHORT_APPLY_MERGES, then on.
    #[arg(long, default_value = "")]
    apply_merges: String,
    /// GCC-RT, PAR-RT or SOLO-RT; falls back to COHORT_ORCHESTRATION_MODE, then the saved mode.
    #[arg(long, default_value = "")]
    mode: String,
}

fn resolve_mode(flag: &str) -> Option<OrchestrationMode> {
    let raw = flag_or_env(flag, ENV_ORCHESTRATION_MODE)?;
    match raw.parse() {
        Ok(mode) => Some(mode),
        Err(err) => {
            eprintln!("ignoring mode: {err}");
            None
        }
    }
}

fn resolve_apply_merges(flag: &str) -> bool {
    if let Some(value) = parse_bool_env(flag) {
        return value;
    }
    std::env::var(ENV_APPLY_MERGES)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

fn load_config() -> Config {
    let args = Args::parse();
    let session_id = resolve_session_id(&args.session);
    let addr = resolve_addr(&session_id, &args.addr);
    let workspace = resolve_workspace(&args.workspace);
    let workspace = workspace.canonicalize().unwrap_or(workspace);
    let log_dir = anchor(&workspace, &resolve_log_dir(&args.log_dir));
    Config {
        session_id,
        addr,
        debug: args.debug || env_true(ENV_HUB_DEBUG),
        log_dir,
        lock_ttl_secs: args.lock_ttl.max(1),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        heartbeat_check_interval: Duration::from_secs(args.heartbeat_check_interval.max(1)),
        expiry_interval: Duration::from_secs(args.expiry_interval.max(1)),
        snapshot_interval: Duration::from_secs(args.snapshot_interval.max(1)),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        recent_changes: args.recent_changes.max(1),
        watch: !args.no_watch,
        apply_merges: resolve_apply_merges(&args.apply_merges),
        queue_capacity: args.queue_capacity.max(1),
        mode: resolve_mode(&args.mode),
        workspace,
    }
}

/// Relative log directories live under the workspace.
fn anchor(workspace: &Path, dir: &str) -> String {
    let path = Path::new(dir);
    if path.is_absolute() || dir.trim().is_empty() {
        return dir.to_string();
    }
    workspace.join(path).display().to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid hub address {}", config.addr))?;
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        bail!("hub address {} is not a loopback address", config.addr);
    }
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown_requested");
        let _ = stop_tx.send(true);
    });

    if let Err(err) = server::run(config, listener, stop_rx).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        return Err(err);
    }
    Ok(())
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = resolve_log_level(config.debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.session_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, session_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("cohort-hub-{session_id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_log_dirs_are_anchored_in_the_workspace() {
        let ws = Path::new("/srv/repo");
        assert_eq!(anchor(ws, ".cohort/logs"), "/srv/repo/.cohort/logs");
        assert_eq!(anchor(ws, "/var/log/cohort"), "/var/log/cohort");
        assert_eq!(anchor(ws, ""), "");
    }

    #[test]
    fn apply_merges_flag_wins_over_default() {
        assert!(!resolve_apply_merges("false"));
        assert!(resolve_apply_merges("yes"));
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["cohort-hub", "--no-watch", "--lock-ttl", "60"])
            .expect("parse");
        assert!(args.no_watch);
        assert_eq!(args.lock_ttl, 60);
        assert_eq!(args.expiry_interval, 30);
        assert_eq!(args.heartbeat_timeout, 120);
    }
}
