use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use cohort_agent::{resolve_hub_url, ClientConfig, Coordinator, LocalLocks, LockReply};
use cohort_core::config::{env_true, resolve_log_level, resolve_session_id, resolve_workspace};
use cohort_core::locks::{LockType, DEFAULT_LOCK_TTL_SECS};
use cohort_core::merge::{MergeEngine, MergeOutcome};
use cohort_core::regions::ParserChain;
use cohort_core::{normalize_path, Role};
use cohort_storage::lockfile::purge_quarantined;
use cohort_storage::{DiskLocker, LockFileConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENV_AGENT_DEBUG: &str = "COHORT_AGENT_DEBUG";
const EXIT_DENIED: i32 = 3;
const EXIT_CONFLICT: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "cohort-agent", about = "Agent-side locking and merge tools for a shared workspace")]
struct Args {
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    workspace: String,
    #[arg(long, default_value = "AGENT")]
    agent_type: String,
    #[arg(long, default_value = "")]
    instance: String,
    /// Skip the hub and lock through the workspace lock files only.
    #[arg(long, default_value_t = false)]
    no_hub: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Hold locks on the given paths while a command runs.
    Wrap {
        /// `path` or `path#region`; repeatable.
        #[arg(long = "lock", required = true)]
        locks: Vec<String>,
        #[arg(long, default_value = "exclusive")]
        lock_type: LockType,
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Report whether a line may be edited.
    Check {
        path: String,
        #[arg(long)]
        line: u32,
    },
    /// List the lockable regions of a source file.
    Regions { path: String },
    /// Three-way merge of two versions against their base.
    Merge {
        base: PathBuf,
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value = "A")]
        agent_a: String,
        #[arg(long, default_value = "B")]
        agent_b: String,
    },
    /// Delete quarantined lock files older than the retention window.
    PurgeStale {
        dir: PathBuf,
        #[arg(long)]
        days: Option<u64>,
    },
}

/// Splits `path#region` into its parts.
fn parse_lock_spec(raw: &str) -> (String, Option<String>) {
    match raw.split_once('#') {
        Some((path, region)) if !region.trim().is_empty() => {
            (path.to_string(), Some(region.trim().to_string()))
        }
        Some((path, _)) => (path.to_string(), None),
        None => (raw.to_string(), None),
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug || env_true(ENV_AGENT_DEBUG));

    let workspace = resolve_workspace(&args.workspace);
    let workspace = workspace.canonicalize().unwrap_or(workspace);
    let code = match &args.command {
        Cmd::Wrap {
            locks,
            lock_type,
            cmd,
        } => {
            let coordinator = coordinator(&args, &workspace).await?;
            wrap(coordinator, locks, *lock_type, cmd).await?
        }
        Cmd::Check { path, line } => {
            let coordinator = coordinator(&args, &workspace).await?;
            let report = coordinator.check_access(path, *line).await;
            let backend = coordinator.backend();
            coordinator.close().await;
            let report = report?;
            print_json(&json!({
                "file": normalize_path(&workspace, path),
                "line": line,
                "backend": backend,
                "can_access": report.can_access,
                "blocking": report.blocking,
            }))?;
            0
        }
        Cmd::Regions { path } => {
            let full = workspace.join(normalize_path(&workspace, path));
            let source = std::fs::read_to_string(&full)
                .with_context(|| format!("reading {}", full.display()))?;
            let rel = normalize_path(&workspace, &full.display().to_string());
            let regions = ParserChain::default().parse(&rel, &source);
            print_json(&json!({ "file": rel, "regions": regions }))?;
            0
        }
        Cmd::Merge {
            base,
            a,
            b,
            agent_a,
            agent_b,
        } => merge(base, a, b, agent_a, agent_b)?,
        Cmd::PurgeStale { dir, days } => {
            let days = days.unwrap_or_else(|| LockFileConfig::from_env().cleanup_days);
            let purged = purge_quarantined(dir, Duration::from_secs(days * 86_400))?;
            info!(event = "purge_stale", dir = %dir.display(), purged);
            print_json(&json!({ "dir": dir, "retention_days": days, "purged": purged }))?;
            0
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn coordinator(args: &Args, workspace: &Path) -> anyhow::Result<Coordinator> {
    let instance = if args.instance.trim().is_empty() {
        std::process::id().to_string()
    } else {
        args.instance.trim().to_string()
    };
    let disk = DiskLocker::new(LockFileConfig::from_env());
    let holder = cohort_core::agent_id(&args.agent_type, &instance);
    if args.no_hub {
        return Ok(Coordinator::local(&holder, LocalLocks::new(workspace, disk)));
    }
    let session_id = resolve_session_id(&args.session);
    let url = resolve_hub_url(&args.hub_url, &session_id, &args.addr)?;
    let mut config = ClientConfig::new(url, &args.agent_type, &instance);
    config.role = Some(Role::for_agent_type(&args.agent_type));
    Ok(Coordinator::connect_or_local(config, workspace, disk).await)
}

async fn release_all(coordinator: &mut Coordinator, held: &[(String, Option<String>)]) {
    for (path, region) in held.iter().rev() {
        if let Err(err) = coordinator.release(path, region.as_deref()).await {
            warn!(event = "wrap_release_failed", path = %path, error = %err);
        }
    }
}

async fn wrap(
    mut coordinator: Coordinator,
    specs: &[String],
    lock_type: LockType,
    cmd: &[String],
) -> anyhow::Result<i32> {
    let mut held = Vec::new();
    for raw in specs {
        let (path, region) = parse_lock_spec(raw);
        match coordinator.acquire(&path, lock_type, region.as_deref()).await {
            Ok(LockReply::Granted { .. }) => held.push((path, region)),
            Ok(LockReply::Denied(denial)) => {
                release_all(&mut coordinator, &held).await;
                coordinator.close().await;
                print_json(&json!({ "status": "denied", "denial": denial }))?;
                return Ok(EXIT_DENIED);
            }
            Err(err) => {
                release_all(&mut coordinator, &held).await;
                coordinator.close().await;
                return Err(err).with_context(|| format!("locking {raw}"));
            }
        }
    }
    info!(
        event = "wrap_locked",
        backend = coordinator.backend(),
        locks = held.len()
    );

    let code = run_child(&mut coordinator, cmd, &held, lock_type).await;
    release_all(&mut coordinator, &held).await;
    coordinator.close().await;
    info!(event = "wrap_exit", code);
    Ok(code)
}

/// Runs the command, renewing the locks at half their TTL until it exits.
async fn run_child(
    coordinator: &mut Coordinator,
    cmd: &[String],
    held: &[(String, Option<String>)],
    lock_type: LockType,
) -> i32 {
    let mut child = Command::new(&cmd[0]);
    child
        .args(&cmd[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = match child.spawn() {
        Ok(proc) => proc,
        Err(err) => {
            error!(event = "wrap_spawn_failed", cmd = %cmd[0], error = %err);
            return 1;
        }
    };

    let every = Duration::from_secs((DEFAULT_LOCK_TTL_SECS / 2).max(1));
    let mut renew = interval_at(Instant::now() + every, every);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = child.kill().await;
                break 130;
            }
            status = child.wait() => {
                break match status {
                    Ok(status) => status.code().unwrap_or(0),
                    Err(_) => 1,
                };
            }
            _ = renew.tick() => {
                for (path, region) in held {
                    match coordinator.acquire(path, lock_type, region.as_deref()).await {
                        Ok(LockReply::Granted { .. }) => {}
                        Ok(LockReply::Denied(denial)) => {
                            warn!(event = "wrap_renew_denied", path = %path, held_by = %denial.held_by);
                        }
                        Err(err) => warn!(event = "wrap_renew_failed", path = %path, error = %err),
                    }
                }
            }
        }
    }
}

fn merge(base: &Path, a: &Path, b: &Path, agent_a: &str, agent_b: &str) -> anyhow::Result<i32> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    };
    let (base_text, a_text, b_text) = (read(base)?, read(a)?, read(b)?);
    let mut engine = MergeEngine::new();
    let file = base.display().to_string();
    match engine.merge(&base_text, &a_text, &b_text, agent_a, agent_b, &file, Utc::now()) {
        MergeOutcome::Merged(content) => {
            print_json(&json!({ "status": "merged", "file": file, "content": content }))?;
            Ok(0)
        }
        MergeOutcome::Conflict(conflict) => {
            let suggestion = engine.auto_resolve(&conflict);
            print_json(&json!({
                "status": "conflict",
                "conflict": conflict,
                "auto_resolution": suggestion,
            }))?;
            Ok(EXIT_CONFLICT)
        }
    }
}

/// Logs go to stderr; stdout carries the JSON results.
fn init_logging(debug: bool) {
    let level = resolve_log_level(debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
