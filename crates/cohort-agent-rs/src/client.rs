//! Websocket client an agent uses to talk to the coordination hub.
//!
//! One background task owns the socket. It answers nothing on its own: it
//! forwards queued frames, sends heartbeats, folds lock and context updates into
//! the shared session state and republishes every decoded hub message on a
//! broadcast channel. Correlated requests subscribe to that channel before
//! sending and wait for their reply with a bounded timeout.

use cohort_core::config::{flag_or_env, resolve_addr, ENV_HUB_URL};
use cohort_core::locks::{resource_id, AccessReport, LockDenial, LockRecord, LockType};
use cohort_core::orchestrator::ReviewStatus;
use cohort_core::protocol::{
    decode_frame, encode_frame, ClientMsg, FrameError, RegionStatus, ServerMsg, SharedContext,
    MAX_FRAME_BYTES,
};
use cohort_core::regions::canonical_region_name;
use cohort_core::{normalize_path, Role};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;
const OUTBOUND_QUEUE: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("hub connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("hub connection closed")]
    Closed,
    #[error("hub rejected the request ({code}): {message}")]
    Hub { code: String, message: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid hub url {url}: {reason}")]
    Url { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub agent_type: String,
    pub instance_id: String,
    pub role: Option<Role>,
    pub partition: Option<String>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(url: Url, agent_type: &str, instance_id: &str) -> Self {
        Self {
            url,
            agent_type: agent_type.to_string(),
            instance_id: instance_id.to_string(),
            role: None,
            partition: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }

    fn register_msg(&self) -> ClientMsg {
        ClientMsg::Register {
            agent_type: self.agent_type.clone(),
            instance_id: self.instance_id.clone(),
            partition: self.partition.clone(),
            role: self.role,
        }
    }
}

/// Hub websocket URL: `--hub-url`, then `COHORT_HUB_URL`, then the session's hub address.
pub fn resolve_hub_url(url_flag: &str, session_id: &str, addr_flag: &str) -> Result<Url, ClientError> {
    let raw = flag_or_env(url_flag, ENV_HUB_URL)
        .unwrap_or_else(|| format!("ws://{}/ws", resolve_addr(session_id, addr_flag)));
    Url::parse(&raw).map_err(|err| ClientError::Url {
        url: raw.clone(),
        reason: err.to_string(),
    })
}

/// Answer to a lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockReply {
    Granted { lock: LockRecord, renewed: bool },
    Denied(LockDenial),
}

impl LockReply {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockReply::Granted { .. })
    }
}

#[derive(Debug, Default)]
struct SessionState {
    agent_id: String,
    workspace: String,
    held: BTreeMap<String, LockRecord>,
    subscriptions: BTreeSet<String>,
    context: Option<SharedContext>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

pub struct HubClient {
    config: ClientConfig,
    outbound: mpsc::Sender<String>,
    events: broadcast::Sender<ServerMsg>,
    state: Arc<Mutex<SessionState>>,
    requests: Mutex<()>,
    task: JoinHandle<()>,
}

impl HubClient {
    /// Connects, registers and starts the background connection task.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let state = Arc::new(Mutex::new(SessionState::default()));
        let ws = open_session(&config, &state, &events).await?;
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(connection_loop(
            config.clone(),
            ws,
            rx,
            state.clone(),
            events.clone(),
        ));
        Ok(Self {
            config,
            outbound,
            events,
            state,
            requests: Mutex::new(()),
            task,
        })
    }

    pub async fn agent_id(&self) -> String {
        self.state.lock().await.agent_id.clone()
    }

    pub async fn workspace(&self) -> String {
        self.state.lock().await.workspace.clone()
    }

    /// Every message the hub sends from now on.
    pub fn events(&self) -> broadcast::Receiver<ServerMsg> {
        self.events.subscribe()
    }

    pub async fn held_locks(&self) -> Vec<LockRecord> {
        self.state.lock().await.held.values().cloned().collect()
    }

    /// Last context the hub pushed, without a round trip.
    pub async fn context(&self) -> Option<SharedContext> {
        self.state.lock().await.context.clone()
    }

    pub async fn acquire_lock(
        &self,
        file_path: &str,
        lock_type: LockType,
        region: Option<&str>,
        ttl_secs: Option<u64>,
    ) -> Result<LockReply, ClientError> {
        let (file, rid) = self.resource(file_path, region).await;
        let me = self.agent_id().await;
        let msg = ClientMsg::AcquireLock {
            file_path: file,
            lock_type,
            ttl_secs,
            region: region.map(str::to_string),
        };
        self.request(&msg, "lock:acquired", move |reply| match reply {
            ServerMsg::LockAcquired { lock, renewed }
                if lock.resource_id == rid && lock.holder_id == me =>
            {
                Some(LockReply::Granted {
                    lock: lock.clone(),
                    renewed: *renewed,
                })
            }
            ServerMsg::LockFailed(denial)
                if denial.resource_id == rid
                    && denial.requested_by.as_deref().map_or(true, |by| by == me) =>
            {
                Some(LockReply::Denied(denial.clone()))
            }
            _ => None,
        })
        .await
    }

    pub async fn release_lock(&self, file_path: &str, region: Option<&str>) -> Result<(), ClientError> {
        let (file, rid) = self.resource(file_path, region).await;
        let me = self.agent_id().await;
        let msg = ClientMsg::ReleaseLock {
            file_path: file,
            region: region.map(str::to_string),
        };
        self.request(&msg, "lock:released", move |reply| match reply {
            ServerMsg::LockReleased {
                resource_id,
                agent_id,
                ..
            } if *resource_id == rid && *agent_id == me => Some(()),
            _ => None,
        })
        .await
    }

    pub async fn check_access(&self, file_path: &str, line: u32) -> Result<AccessReport, ClientError> {
        let (file, _) = self.resource(file_path, None).await;
        let msg = ClientMsg::CheckLock {
            file_path: file.clone(),
            line,
        };
        self.request(&msg, "lock:access", move |reply| match reply {
            ServerMsg::LockAccess {
                file_path,
                line: at,
                report,
            } if *file_path == file && *at == line => Some(report.clone()),
            _ => None,
        })
        .await
    }

    pub async fn get_regions(&self, file_path: &str) -> Result<Vec<RegionStatus>, ClientError> {
        let (file, _) = self.resource(file_path, None).await;
        let msg = ClientMsg::GetRegions {
            file_path: file.clone(),
        };
        self.request(&msg, "regions:list", move |reply| match reply {
            ServerMsg::RegionsList { file_path, regions } if *file_path == file => {
                Some(regions.clone())
            }
            _ => None,
        })
        .await
    }

    pub async fn get_context(&self) -> Result<SharedContext, ClientError> {
        self.request(&ClientMsg::GetContext, "context:sync", |reply| match reply {
            ServerMsg::ContextSync(context) => Some(context.clone()),
            _ => None,
        })
        .await
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<(), ClientError> {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(pattern.to_string());
        self.send(&ClientMsg::Subscribe {
            pattern: pattern.to_string(),
        })
        .await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), ClientError> {
        self.state.lock().await.subscriptions.remove(pattern);
        self.send(&ClientMsg::Unsubscribe {
            pattern: pattern.to_string(),
        })
        .await
    }

    pub async fn set_partition(&self, partition: Option<&str>) -> Result<(), ClientError> {
        self.send(&ClientMsg::UpdateContext {
            partition: partition.map(str::to_string),
        })
        .await
    }

    pub async fn broadcast(&self, event: &str, data: Value) -> Result<(), ClientError> {
        self.send(&ClientMsg::Broadcast {
            event: event.to_string(),
            data,
            target: None,
        })
        .await
    }

    pub async fn send_to(&self, target: &str, event: &str, data: Value) -> Result<(), ClientError> {
        self.send(&ClientMsg::Broadcast {
            event: event.to_string(),
            data,
            target: Some(target.to_string()),
        })
        .await
    }

    pub async fn propose_plan(
        &self,
        feature: &str,
        approach: &str,
        files: &[String],
        risks: &[String],
    ) -> Result<(), ClientError> {
        self.broadcast(
            "plan:proposed",
            json!({"feature": feature, "approach": approach, "files": files, "risks": risks}),
        )
        .await
    }

    pub async fn approve_plan(&self) -> Result<(), ClientError> {
        self.broadcast("plan:approved", json!({})).await
    }

    pub async fn request_review(&self, files: &[String], description: &str) -> Result<(), ClientError> {
        self.broadcast(
            "review:requested",
            json!({"files": files, "description": description}),
        )
        .await
    }

    pub async fn submit_review(
        &self,
        files: &[String],
        status: ReviewStatus,
        findings: Vec<Value>,
        comments: &str,
    ) -> Result<(), ClientError> {
        self.broadcast(
            "review:completed",
            json!({"files": files, "status": status, "findings": findings, "comments": comments}),
        )
        .await
    }

    /// Reports new content for `file`; without `base` the hub reads the workspace copy.
    pub async fn notify_code_written(
        &self,
        file: &str,
        content: &str,
        base: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut data = json!({"file": file, "content": content});
        if let Some(base) = base {
            data["base_content"] = Value::String(base.to_string());
        }
        self.broadcast("code:written", data).await
    }

    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: &str) -> Result<(), ClientError> {
        self.broadcast(
            "conflict:resolved",
            json!({"conflict_id": conflict_id, "resolution": resolution}),
        )
        .await
    }

    /// Closes the socket and waits for the connection task to finish.
    pub async fn close(self) {
        let HubClient { outbound, task, .. } = self;
        drop(outbound);
        if let Err(err) = task.await {
            debug!(event = "hub_client_join_error", error = %err);
        }
    }

    async fn resource(&self, file_path: &str, region: Option<&str>) -> (String, String) {
        let workspace = self.workspace().await;
        let file = normalize_path(Path::new(&workspace), file_path);
        let name = region.map(canonical_region_name);
        let rid = resource_id(&file, name.as_deref());
        (file, rid)
    }

    async fn send(&self, msg: &ClientMsg) -> Result<(), ClientError> {
        let text = encode_frame(msg, MAX_FRAME_BYTES)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends `msg` and waits for the first hub message `pick` accepts.
    async fn request<T>(
        &self,
        msg: &ClientMsg,
        awaiting: &'static str,
        mut pick: impl FnMut(&ServerMsg) -> Option<T>,
    ) -> Result<T, ClientError> {
        let _gate = self.requests.lock().await;
        let mut replies = self.events.subscribe();
        self.send(msg).await?;
        let wait = async move {
            loop {
                match replies.recv().await {
                    Ok(ServerMsg::Error { code, message }) => {
                        return Err(ClientError::Hub { code, message })
                    }
                    Ok(reply) => {
                        if let Some(value) = pick(&reply) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(event = "hub_events_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
                }
            }
        };
        match timeout(self.config.request_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event = "hub_request_timeout", request = msg.kind(), awaiting);
                Err(ClientError::Timeout(awaiting))
            }
        }
    }
}

async fn send_text(ws: &mut WsStream, text: String) -> Result<(), ClientError> {
    ws.send(Message::Text(text)).await?;
    Ok(())
}

async fn send_msg(ws: &mut WsStream, msg: &ClientMsg) -> Result<(), ClientError> {
    send_text(ws, encode_frame(msg, MAX_FRAME_BYTES)?).await
}

/// Connects, registers and replays subscriptions; used for the first connection and every reconnect.
async fn open_session(
    config: &ClientConfig,
    state: &Mutex<SessionState>,
    events: &broadcast::Sender<ServerMsg>,
) -> Result<WsStream, ClientError> {
    let (mut ws, _) = timeout(config.request_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| ClientError::Timeout("hub connection"))??;
    send_msg(&mut ws, &config.register_msg()).await?;

    let registered = timeout(config.request_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match decode_frame::<ServerMsg>(&text, MAX_FRAME_BYTES)? {
                    ServerMsg::Registered {
                        agent_id,
                        workspace,
                        context,
                    } => return Ok((agent_id, workspace, context)),
                    ServerMsg::Error { code, message } => return Err(ClientError::Hub { code, message }),
                    other => {
                        let _ = events.send(other);
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(ClientError::Connect(err)),
            }
        }
    })
    .await
    .map_err(|_| ClientError::Timeout("agent:registered"))??;
    let (agent_id, workspace, context) = registered;

    let patterns: Vec<String> = {
        let mut session = state.lock().await;
        if !session.held.is_empty() {
            warn!(
                event = "hub_locks_lost",
                agent_id = %agent_id,
                count = session.held.len()
            );
            session.held.clear();
        }
        session.agent_id = agent_id.clone();
        session.workspace = workspace;
        session.context = Some(context);
        session.subscriptions.iter().cloned().collect()
    };
    for pattern in patterns {
        send_msg(&mut ws, &ClientMsg::Subscribe { pattern }).await?;
    }
    info!(event = "hub_registered", agent_id = %agent_id, url = %config.url);
    Ok(ws)
}

async fn connection_loop(
    config: ClientConfig,
    mut ws: WsStream,
    mut rx: mpsc::Receiver<String>,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<ServerMsg>,
) {
    loop {
        match run_session(&config, &mut ws, &mut rx, &state, &events).await {
            SessionEnd::Shutdown => {
                let _ = ws.close(None).await;
                debug!(event = "hub_client_closed");
                return;
            }
            SessionEnd::Lost => warn!(event = "hub_connection_lost", url = %config.url),
        }

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        ws = loop {
            if attempt >= config.max_reconnect_attempts {
                error!(event = "hub_reconnect_exhausted", attempts = attempt);
                return;
            }
            attempt += 1;
            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    queued = rx.recv() => match queued {
                        Some(_) => debug!(event = "hub_send_dropped", reason = "disconnected"),
                        None => return,
                    },
                }
            }
            match open_session(&config, &state, &events).await {
                Ok(ws) => break ws,
                Err(err) => {
                    warn!(event = "hub_reconnect_failed", attempt, error = %err);
                    backoff = next_backoff(backoff);
                }
            }
        };
        info!(event = "hub_reconnected", attempts = attempt);
    }
}

async fn run_session(
    config: &ClientConfig,
    ws: &mut WsStream,
    rx: &mut mpsc::Receiver<String>,
    state: &Mutex<SessionState>,
    events: &broadcast::Sender<ServerMsg>,
) -> SessionEnd {
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => absorb(&text, state, events).await,
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(event = "hub_read_error", error = %err);
                    return SessionEnd::Lost;
                }
            },
            queued = rx.recv() => match queued {
                Some(text) => {
                    if let Err(err) = send_text(ws, text).await {
                        debug!(event = "hub_write_error", error = %err);
                        return SessionEnd::Lost;
                    }
                }
                None => return SessionEnd::Shutdown,
            },
            _ = heartbeat.tick() => {
                if send_msg(ws, &ClientMsg::Heartbeat).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

/// Folds a hub message into the session state, then republishes it.
async fn absorb(text: &str, state: &Mutex<SessionState>, events: &broadcast::Sender<ServerMsg>) {
    let msg: ServerMsg = match decode_frame(text, MAX_FRAME_BYTES) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(event = "hub_frame_invalid", error = %err);
            return;
        }
    };
    {
        let mut session = state.lock().await;
        match &msg {
            ServerMsg::LockAcquired { lock, .. } if lock.holder_id == session.agent_id => {
                session.held.insert(lock.resource_id.clone(), lock.clone());
            }
            ServerMsg::LockReleased {
                resource_id,
                agent_id,
                ..
            } if *agent_id == session.agent_id => {
                session.held.remove(resource_id);
            }
            ServerMsg::LockExpired { lock } if lock.holder_id == session.agent_id => {
                warn!(event = "hub_lock_expired", resource_id = %lock.resource_id);
                session.held.remove(&lock.resource_id);
            }
            ServerMsg::ContextSync(context) => session.context = Some(context.clone()),
            _ => {}
        }
    }
    let _ = events.send(msg);
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use cohort_core::protocol::decode_client_msg;
    use tokio::net::TcpListener;

    pub(crate) type ServerWs = WebSocketStream<TcpStream>;

    pub(crate) async fn listen() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
        (listener, url)
    }

    pub(crate) async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream).await.expect("handshake")
    }

    pub(crate) async fn recv(ws: &mut ServerWs) -> ClientMsg {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg = decode_client_msg(&text, MAX_FRAME_BYTES).expect("client frame");
                    if !matches!(msg, ClientMsg::Heartbeat) {
                        return msg;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("client went away: {other:?}"),
            }
        }
    }

    pub(crate) async fn reply(ws: &mut ServerWs, msg: &ServerMsg) {
        let text = encode_frame(msg, MAX_FRAME_BYTES).expect("encode");
        ws.send(Message::Text(text)).await.expect("send");
    }

    pub(crate) fn registered(agent_id: &str, workspace: &str) -> ServerMsg {
        ServerMsg::Registered {
            agent_id: agent_id.to_string(),
            workspace: workspace.to_string(),
            context: SharedContext {
                workspace: workspace.to_string(),
                agents: Vec::new(),
                locks: Vec::new(),
                recent_changes: Vec::new(),
                partitions: BTreeMap::new(),
                workflow: None,
                generated_at: Utc::now(),
            },
        }
    }

    /// Accepts one connection and completes the registration handshake.
    pub(crate) async fn handshake(listener: &TcpListener, agent_id: &str, workspace: &str) -> ServerWs {
        let mut ws = accept(listener).await;
        match recv(&mut ws).await {
            ClientMsg::Register { .. } => {}
            other => panic!("expected register, got {other:?}"),
        }
        reply(&mut ws, &registered(agent_id, workspace)).await;
        ws
    }

    pub(crate) fn config(url: Url) -> ClientConfig {
        let mut config = ClientConfig::new(url, "CLAUDE", "1");
        config.request_timeout = Duration::from_millis(500);
        config
    }

    fn granted(rid: &str, file: &str, holder: &str) -> ServerMsg {
        ServerMsg::LockAcquired {
            lock: LockRecord {
                resource_id: rid.to_string(),
                file_path: file.to_string(),
                holder_id: holder.to_string(),
                lock_type: LockType::Exclusive,
                acquired_at: Utc::now(),
                ttl_secs: 300,
                region: None,
            },
            renewed: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_waits_for_the_matching_reply() {
        let (listener, url) = listen().await;
        let hub = tokio::spawn(async move {
            let mut ws = handshake(&listener, "CLAUDE-1", "/work/repo").await;
            match recv(&mut ws).await {
                ClientMsg::AcquireLock {
                    file_path, region, ..
                } => {
                    assert_eq!(file_path, "src/a.py");
                    assert_eq!(region.as_deref(), Some("line:10-20"));
                }
                other => panic!("expected acquire, got {other:?}"),
            }
            // Unrelated traffic first: another agent's grant on the same resource.
            reply(&mut ws, &granted("src/a.py#lines:10-20", "src/a.py", "GEMINI-1")).await;
            reply(&mut ws, &granted("src/a.py#lines:10-20", "src/a.py", "CLAUDE-1")).await;

            match recv(&mut ws).await {
                ClientMsg::AcquireLock { file_path, .. } => assert_eq!(file_path, "src/b.py"),
                other => panic!("expected acquire, got {other:?}"),
            }
            let denial = LockDenial {
                resource_id: "src/b.py".to_string(),
                file_path: "src/b.py".to_string(),
                held_by: "GEMINI-1".to_string(),
                lock_type: LockType::Exclusive,
                expires_at: Utc::now() + ChronoDuration::seconds(300),
                blocking_resource: None,
                requested_by: Some("CODEX-1".to_string()),
            };
            // Another agent's refusal on the same resource is not our answer.
            reply(&mut ws, &ServerMsg::LockFailed(denial.clone())).await;
            let ours = LockDenial {
                requested_by: Some("CLAUDE-1".to_string()),
                ..denial
            };
            reply(&mut ws, &ServerMsg::LockFailed(ours)).await;

            match recv(&mut ws).await {
                ClientMsg::ReleaseLock { file_path, region } => {
                    assert_eq!(file_path, "src/a.py");
                    assert_eq!(region.as_deref(), Some("line:10-20"));
                }
                other => panic!("expected release, got {other:?}"),
            }
            reply(
                &mut ws,
                &ServerMsg::LockReleased {
                    resource_id: "src/a.py#lines:10-20".to_string(),
                    file_path: "src/a.py".to_string(),
                    agent_id: "CLAUDE-1".to_string(),
                },
            )
            .await;
            ws
        });

        let client = HubClient::connect(config(url)).await.expect("connect");
        assert_eq!(client.agent_id().await, "CLAUDE-1");
        assert!(client.context().await.is_some());

        let reply = client
            .acquire_lock("/work/repo/src/a.py", LockType::Exclusive, Some("line:10-20"), None)
            .await
            .expect("acquire");
        match reply {
            LockReply::Granted { lock, .. } => assert_eq!(lock.holder_id, "CLAUDE-1"),
            LockReply::Denied(denial) => panic!("unexpected denial {denial:?}"),
        }
        assert_eq!(client.held_locks().await.len(), 1);

        let denied = client
            .acquire_lock("src/b.py", LockType::Exclusive, None, None)
            .await
            .expect("acquire");
        assert!(matches!(
            denied,
            LockReply::Denied(ref d) if d.held_by == "GEMINI-1" && d.requested_by.as_deref() == Some("CLAUDE-1")
        ));

        client
            .release_lock("src/a.py", Some("line:10-20"))
            .await
            .expect("release");
        assert!(client.held_locks().await.is_empty());

        let _ws = hub.await.expect("hub task");
        client.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unanswered_requests_time_out_and_errors_surface() {
        let (listener, url) = listen().await;
        let hub = tokio::spawn(async move {
            let mut ws = handshake(&listener, "CLAUDE-1", "/work/repo").await;
            assert!(matches!(recv(&mut ws).await, ClientMsg::GetContext));
            match recv(&mut ws).await {
                ClientMsg::ReleaseLock { .. } => {}
                other => panic!("expected release, got {other:?}"),
            }
            reply(
                &mut ws,
                &ServerMsg::error("lock_not_held", "src/a.py is not locked"),
            )
            .await;
            ws
        });

        let client = HubClient::connect(config(url)).await.expect("connect");
        let err = client.get_context().await.expect_err("no reply");
        assert!(matches!(err, ClientError::Timeout("context:sync")));

        let err = client.release_lock("src/a.py", None).await.expect_err("rejected");
        match err {
            ClientError::Hub { code, .. } => assert_eq!(code, "lock_not_held"),
            other => panic!("unexpected error {other:?}"),
        }
        let _ws = hub.await.expect("hub task");
        client.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_registers_again_and_replays_subscriptions() {
        let (listener, url) = listen().await;
        let hub = tokio::spawn(async move {
            let mut first = handshake(&listener, "CLAUDE-1", "/work/repo").await;
            match recv(&mut first).await {
                ClientMsg::Subscribe { pattern } => assert_eq!(pattern, "src/**"),
                other => panic!("expected subscribe, got {other:?}"),
            }
            reply(&mut first, &granted("src/a.py", "src/a.py", "CLAUDE-1")).await;
            first.close(None).await.expect("close");
            drop(first);

            let mut second = handshake(&listener, "CLAUDE-1", "/work/repo").await;
            match recv(&mut second).await {
                ClientMsg::Subscribe { pattern } => assert_eq!(pattern, "src/**"),
                other => panic!("expected replayed subscribe, got {other:?}"),
            }
            second
        });

        let client = HubClient::connect(config(url)).await.expect("connect");
        let mut events = client.events();
        client.subscribe("src/**").await.expect("subscribe");
        loop {
            if let ServerMsg::LockAcquired { .. } = events.recv().await.expect("event") {
                break;
            }
        }
        assert_eq!(client.held_locks().await.len(), 1);

        let _second = tokio::time::timeout(Duration::from_secs(5), hub)
            .await
            .expect("reconnect in time")
            .expect("hub task");
        assert!(client.held_locks().await.is_empty());
        client.close().await;
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(8)), MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn hub_url_prefers_explicit_flag() {
        let url = resolve_hub_url("ws://127.0.0.1:42001/ws", "s", "").expect("url");
        assert_eq!(url.port(), Some(42001));
        let derived = resolve_hub_url("", "s", "127.0.0.1:43000").expect("url");
        if std::env::var(ENV_HUB_URL).is_err() {
            assert_eq!(derived.as_str(), "ws://127.0.0.1:43000/ws");
        }
        assert!(matches!(
            resolve_hub_url("not a url", "s", ""),
            Err(ClientError::Url { .. })
        ));
    }
}
