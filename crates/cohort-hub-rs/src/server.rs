use crate::hub::{ConnId, HubCore, Outbound};
use crate::metrics::MetricsReport;
use crate::watcher;
use crate::Config;
use anyhow::Context;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use cohort_core::protocol::{encode_frame, ChangeType, MAX_FRAME_BYTES};
use cohort_storage::SnapshotStore;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Everything that mutates hub state goes through the actor as one of these.
pub enum HubCommand {
    Connect {
        conn: ConnId,
        sender: mpsc::Sender<Message>,
    },
    Frame {
        conn: ConnId,
        text: String,
    },
    Touch {
        conn: ConnId,
    },
    Disconnect {
        conn: ConnId,
        reason: String,
    },
    FileEvent {
        path: String,
        change: ChangeType,
        checksum: Option<String>,
    },
    Metrics {
        reset: bool,
        reply: oneshot::Sender<MetricsReport>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    expiry: Duration,
    heartbeat: Duration,
    snapshot: Duration,
}

struct Actor {
    core: HubCore,
    senders: HashMap<ConnId, mpsc::Sender<Message>>,
    store: SnapshotStore,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut shutdown: watch::Receiver<bool>,
        timers: Timers,
    ) {
        let mut expiry = ticker(timers.expiry);
        let mut heartbeat = ticker(timers.heartbeat);
        let mut snapshot = ticker(timers.snapshot);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.apply(command);
                }
                _ = expiry.tick() => {
                    let out = self.core.sweep_expired(Utc::now());
                    self.dispatch(out);
                }
                _ = heartbeat.tick() => {
                    let out = self.core.check_heartbeats(Utc::now());
                    self.dispatch(out);
                }
                _ = snapshot.tick() => {}
            }
            self.persist_if_dirty().await;
        }

        self.core.mark_dirty();
        self.persist_if_dirty().await;
        for (conn, sender) in self.senders.drain() {
            let _ = sender.try_send(close_frame("shutdown"));
            debug!(event = "conn_closed_on_shutdown", conn);
        }
        info!(event = "hub_actor_stop");
    }

    fn apply(&mut self, command: HubCommand) {
        let now = Utc::now();
        let out = match command {
            HubCommand::Connect { conn, sender } => {
                self.senders.insert(conn, sender);
                self.core.connect(conn);
                Vec::new()
            }
            // Frames may read or rewrite workspace files; keep the worker's other
            // tasks moving while that happens.
            HubCommand::Frame { conn, text } => {
                tokio::task::block_in_place(|| self.core.handle_frame(conn, &text, now))
            }
            HubCommand::Touch { conn } => {
                self.core.touch(conn, now);
                Vec::new()
            }
            HubCommand::Disconnect { conn, reason } => {
                self.senders.remove(&conn);
                self.core.disconnect(conn, &reason, now)
            }
            HubCommand::FileEvent {
                path,
                change,
                checksum,
            } => self.core.file_changed(&path, change, checksum, now),
            HubCommand::Metrics { reset, reply } => {
                let _ = reply.send(self.core.metrics_report(reset));
                Vec::new()
            }
        };
        self.dispatch(out);
    }

    /// Delivers in order; a client whose queue is full or gone is dropped.
    fn dispatch(&mut self, out: Vec<Outbound>) {
        let mut pending: std::collections::VecDeque<Outbound> = out.into();
        while let Some(item) = pending.pop_front() {
            match item {
                Outbound::Send { conn, msg } => {
                    let Some(sender) = self.senders.get(&conn) else {
                        continue;
                    };
                    let text = match encode_frame(&msg, MAX_FRAME_BYTES) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "frame_encode_failed", conn, error = %err);
                            continue;
                        }
                    };
                    let reason = match sender.try_send(Message::Text(text)) {
                        Ok(()) => {
                            self.core.metrics_mut().frames_out += 1;
                            continue;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => "slow_consumer",
                        Err(mpsc::error::TrySendError::Closed(_)) => "closed",
                    };
                    warn!(event = "client_dropped", conn, reason);
                    self.core.metrics_mut().dropped_clients += 1;
                    self.senders.remove(&conn);
                    pending.extend(self.core.disconnect(conn, reason, Utc::now()));
                }
                Outbound::Close { conn, reason } => {
                    if let Some(sender) = self.senders.remove(&conn) {
                        let _ = sender.try_send(close_frame(&reason));
                    }
                }
            }
        }
    }

    async fn persist_if_dirty(&mut self) {
        if !self.core.take_dirty() {
            return;
        }
        let snapshot = self.core.snapshot(Utc::now());
        let store = self.store.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        match saved {
            Ok(Ok(())) => self.core.metrics_mut().snapshots_written += 1,
            Ok(Err(err)) => {
                warn!(event = "snapshot_write_failed", path = %self.store.path().display(), error = %err);
                self.core.metrics_mut().snapshot_errors += 1;
                self.core.mark_dirty();
            }
            Err(err) => {
                error!(event = "snapshot_task_failed", error = %err);
                self.core.metrics_mut().snapshot_errors += 1;
                self.core.mark_dirty();
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn close_frame(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: 1008,
        reason: reason.to_string().into(),
    }))
}

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<HubCommand>,
    conn_counter: Arc<AtomicU64>,
    queue_capacity: usize,
    ping_interval: Duration,
    write_timeout: Duration,
    debug: bool,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    fn next_conn_id(&self) -> ConnId {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Serves the hub on `listener` until `shutdown` flips to true.
pub async fn run(
    config: Config,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let store = SnapshotStore::for_workspace(&config.workspace);
    let loaded = store
        .load(Utc::now())
        .with_context(|| format!("loading {}", store.path().display()))?;
    let mut core = HubCore::new(config.core_settings());
    core.restore(loaded.snapshot, Utc::now());
    if !loaded.pruned.is_empty() {
        core.mark_dirty();
    }

    let (tx, rx) = mpsc::channel::<HubCommand>(config.queue_capacity.max(16) * 4);
    let actor = Actor {
        core,
        senders: HashMap::new(),
        store,
    };
    let timers = Timers {
        expiry: config.expiry_interval,
        heartbeat: config.heartbeat_check_interval,
        snapshot: config.snapshot_interval,
    };
    let actor_task = tokio::spawn(actor.run(rx, shutdown.clone(), timers));

    let _watcher = if config.watch {
        Some(
            watcher::spawn(&config.workspace, tx.clone())
                .with_context(|| format!("watching {}", config.workspace.display()))?,
        )
    } else {
        None
    };

    let state = AppState {
        commands: tx,
        conn_counter: Arc::new(AtomicU64::new(0)),
        queue_capacity: config.queue_capacity.max(1),
        ping_interval: config.ping_interval,
        write_timeout: config.write_timeout,
        debug: config.debug,
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    info!(
        event = "hub_start",
        session_id = %config.session_id,
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        workspace = %config.workspace.display(),
        snapshot = loaded.source.as_str(),
        watch = config.watch
    );

    let mut stop = shutdown;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("serving websocket hub")?;

    if let Err(err) = actor_task.await {
        error!(event = "hub_actor_failed", error = %err);
    }
    info!(event = "hub_stop", session_id = %config.session_id);
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    #[serde(default)]
    reset: bool,
}

async fn metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsReport>, StatusCode> {
    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(HubCommand::Metrics {
            reset: query.reset,
            reply,
        })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(MAX_FRAME_BYTES * 4)
        .on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn handle_socket(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let conn = state.next_conn_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.queue_capacity);
    if state
        .commands
        .send(HubCommand::Connect { conn, sender: tx })
        .await
        .is_err()
    {
        return;
    }
    info!(event = "conn_open", conn, remote = %remote);

    let write_timeout = state.write_timeout;
    let ping_interval = state.ping_interval;
    let writer_commands = state.commands.clone();
    let write_task = tokio::spawn(async move {
        let mut ping = (!ping_interval.is_zero()).then(|| ticker(ping_interval));
        loop {
            let msg = tokio::select! {
                next = rx.recv() => match next {
                    Some(msg) => msg,
                    None => return,
                },
                _ = async {
                    match ping.as_mut() {
                        Some(ping) => {
                            ping.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => Message::Ping(Vec::new()),
            };
            let closing = matches!(msg, Message::Close(_));
            let failure = match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) if closing => return,
                Ok(Ok(())) => continue,
                Ok(Err(_)) => "write_error",
                Err(_) => "write_timeout",
            };
            warn!(event = "conn_write_failed", conn, reason = failure);
            let _ = writer_commands
                .send(HubCommand::Disconnect {
                    conn,
                    reason: failure.to_string(),
                })
                .await;
            return;
        }
    });

    let mut shutdown = state.shutdown.clone();
    let reason = loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break "shutdown";
                }
                continue;
            }
            next = ws_receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(event = "conn_read_error", conn, error = %err);
                break "read_error";
            }
            None => break "disconnect",
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "frame_not_utf8", conn);
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                let _ = state.commands.send(HubCommand::Touch { conn }).await;
                continue;
            }
            Message::Close(_) => break "disconnect",
        };
        if state.debug {
            debug!(event = "frame_received", conn, raw = %text);
        }
        if state
            .commands
            .send(HubCommand::Frame { conn, text })
            .await
            .is_err()
        {
            break "hub_stopped";
        }
    };

    let _ = state
        .commands
        .send(HubCommand::Disconnect {
            conn,
            reason: reason.to_string(),
        })
        .await;
    write_task.abort();
    info!(event = "conn_closed", conn, reason);
}
