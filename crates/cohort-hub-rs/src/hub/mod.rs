//! Hub state and the rules that mutate it.
//!
//! `HubCore` is plain synchronous state: every entry point takes the current
//! time and returns the frames to deliver as [`Outbound`] values. The server
//! actor owns the only instance, so one command is applied at a time.

mod driver;

use crate::metrics::{HubMetrics, MetricsReport};
use chrono::{DateTime, Utc};
use cohort_core::locks::{
    resource_id, AcquireOutcome, LockRegion, LockRequest, ReleaseOutcome, ResourceLockTable,
};
use cohort_core::merge::MergeEngine;
use cohort_core::orchestrator::{OrchestrationMode, Roster, Workflow, WORKFLOW_EVENTS};
use cohort_core::protocol::{
    decode_client_msg, error_codes, AgentSummary, ChangeType, ClientMsg, EventFrame,
    FileChangeEvent, RegionStatus, ServerMsg, SharedContext, CONTEXT_RECENT_CHANGES,
    MAX_FRAME_BYTES,
};
use cohort_core::regions::{canonical_region_name, parse_line_range, CodeRegion, RegionIndex};
use cohort_core::{agent_id, normalize_path, Role};
use cohort_storage::HubSnapshot;
use globset::{Glob, GlobSet, GlobSetBuilder};
use lru::LruCache;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type ConnId = u64;

/// Files whose last written checksum is remembered for echo suppression.
pub const DEFAULT_CHECKSUM_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { conn: ConnId, msg: ServerMsg },
    Close { conn: ConnId, reason: String },
}

#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub workspace: PathBuf,
    pub lock_ttl_secs: u64,
    pub heartbeat_timeout: Duration,
    pub recent_capacity: usize,
    pub apply_merges: bool,
    pub checksum_capacity: usize,
    /// Overrides the mode carried over in a snapshot.
    pub mode: Option<OrchestrationMode>,
}

struct AgentEntry {
    conn: ConnId,
    agent_id: String,
    agent_type: String,
    instance_id: String,
    role: Role,
    partition: Option<String>,
    subscriptions: Vec<String>,
    matcher: GlobSet,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl AgentEntry {
    fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type.clone(),
            instance_id: self.instance_id.clone(),
            role: self.role,
            partition: self.partition.clone(),
            subscriptions: self.subscriptions.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
        }
    }

    fn rebuild_matcher(&mut self) -> Result<(), globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.subscriptions {
            builder.add(Glob::new(pattern)?);
        }
        self.matcher = builder.build()?;
        Ok(())
    }
}

/// Only plain relative paths may be read or written inside the workspace.
fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn send(out: &mut Vec<Outbound>, conn: ConnId, msg: ServerMsg) {
    out.push(Outbound::Send { conn, msg });
}

pub struct HubCore {
    settings: CoreSettings,
    connections: BTreeMap<ConnId, Option<String>>,
    agents: BTreeMap<String, AgentEntry>,
    locks: ResourceLockTable,
    regions: RegionIndex,
    recent: VecDeque<FileChangeEvent>,
    seen_checksums: LruCache<String, String>,
    partitions: BTreeMap<String, String>,
    workflow: Workflow,
    merges: MergeEngine,
    metrics: HubMetrics,
    dirty: bool,
}

impl HubCore {
    pub fn new(settings: CoreSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.checksum_capacity).unwrap_or(NonZeroUsize::MIN);
        let workflow = Workflow {
            mode: settings.mode.unwrap_or_default(),
            ..Workflow::new()
        };
        Self {
            settings,
            connections: BTreeMap::new(),
            agents: BTreeMap::new(),
            locks: ResourceLockTable::new(),
            regions: RegionIndex::default(),
            recent: VecDeque::new(),
            seen_checksums: LruCache::new(capacity),
            partitions: BTreeMap::new(),
            workflow,
            merges: MergeEngine::new(),
            metrics: HubMetrics::default(),
            dirty: false,
        }
    }

    #[cfg(test)]
    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    #[cfg(test)]
    pub fn locks(&self) -> &ResourceLockTable {
        &self.locks
    }

    #[cfg(test)]
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn metrics_mut(&mut self) -> &mut HubMetrics {
        &mut self.metrics
    }

    pub fn metrics_report(&mut self, reset: bool) -> MetricsReport {
        let counters = if reset {
            self.metrics.take()
        } else {
            self.metrics.clone()
        };
        MetricsReport {
            agents: self.agents.len(),
            locks: self.locks.len(),
            recent_changes: self.recent.len(),
            cached_parses: self.regions.cached_paths(),
            counters,
        }
    }

    /// True once since the last call if persisted state changed.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Resolved conflicts are left out; open ones are kept for the restart.
    pub fn snapshot(&self, now: DateTime<Utc>) -> HubSnapshot {
        let mut workflow = self.workflow.clone();
        workflow.conflicts.retain(|_, c| !c.resolved);
        HubSnapshot {
            locks: self.locks.locks().cloned().collect(),
            partitions: self.partitions.clone(),
            workflow,
            updated_at: Some(now),
        }
    }

    pub fn restore(&mut self, snapshot: HubSnapshot, now: DateTime<Utc>) {
        let discarded = self.locks.restore(snapshot.locks, now);
        self.partitions = snapshot.partitions;
        self.workflow = snapshot.workflow;
        if let Some(mode) = self.settings.mode {
            self.workflow.mode = mode;
        }
        self.merges.restore(self.workflow.conflicts.values().cloned());
        info!(
            event = "hub_state_restored",
            locks = self.locks.len(),
            discarded = discarded.len(),
            partitions = self.partitions.len(),
            mode = self.workflow.mode.as_str(),
            state = self.workflow.state.as_str(),
            open_conflicts = self.workflow.conflicts.len()
        );
    }

    fn roster(&self) -> Roster {
        self.agents
            .values()
            .map(|a| (a.agent_id.clone(), a.role))
            .collect()
    }

    fn normalize(&self, raw: &str) -> String {
        normalize_path(&self.settings.workspace, raw)
    }

    fn agent_of(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).cloned().flatten()
    }

    fn to_agent(&self, out: &mut Vec<Outbound>, agent_id: &str, msg: ServerMsg) {
        if let Some(agent) = self.agents.get(agent_id) {
            send(out, agent.conn, msg);
        }
    }

    fn to_all(&self, out: &mut Vec<Outbound>, msg: &ServerMsg, except: Option<&str>) {
        for agent in self.agents.values() {
            if except == Some(agent.agent_id.as_str()) {
                continue;
            }
            send(out, agent.conn, msg.clone());
        }
    }

    fn push_context(&self, out: &mut Vec<Outbound>, except: Option<&str>, now: DateTime<Utc>) {
        let msg = ServerMsg::ContextSync(self.context(now));
        self.to_all(out, &msg, except);
    }

    pub fn context(&self, now: DateTime<Utc>) -> SharedContext {
        let skip = self.recent.len().saturating_sub(CONTEXT_RECENT_CHANGES);
        SharedContext {
            workspace: self.settings.workspace.display().to_string(),
            agents: self.agents.values().map(AgentEntry::summary).collect(),
            locks: self
                .locks
                .locks()
                .filter(|r| !r.is_expired_at(now))
                .cloned()
                .collect(),
            recent_changes: self.recent.iter().skip(skip).cloned().collect(),
            partitions: self.partitions.clone(),
            workflow: Some(self.workflow.summary(&self.roster())),
            generated_at: now,
        }
    }

    pub fn connect(&mut self, conn: ConnId) {
        self.connections.insert(conn, None);
        self.metrics.connections += 1;
        debug!(event = "conn_open", conn);
    }

    pub fn disconnect(&mut self, conn: ConnId, reason: &str, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(registered) = self.connections.remove(&conn) else {
            return out;
        };
        self.metrics.disconnects += 1;
        if let Some(agent_id) = registered {
            self.teardown(&agent_id, reason, now, &mut out);
        }
        out
    }

    pub fn touch(&mut self, conn: ConnId, now: DateTime<Utc>) {
        if let Some(agent_id) = self.agent_of(conn) {
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.last_heartbeat = now;
            }
        }
    }

    pub fn handle_frame(&mut self, conn: ConnId, text: &str, now: DateTime<Utc>) -> Vec<Outbound> {
        self.metrics.frames_in += 1;
        self.touch(conn, now);
        match decode_client_msg(text, MAX_FRAME_BYTES) {
            Ok(msg) => self.handle(conn, msg, now),
            Err(err) => {
                self.metrics.frame_errors += 1;
                warn!(event = "frame_invalid", conn, error = %err);
                vec![Outbound::Send {
                    conn,
                    msg: ServerMsg::error(error_codes::INVALID_MESSAGE, err.to_string()),
                }]
            }
        }
    }

    pub fn handle(&mut self, conn: ConnId, msg: ClientMsg, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let msg = match msg {
            ClientMsg::Register {
                agent_type,
                instance_id,
                partition,
                role,
            } => {
                self.register(conn, &agent_type, &instance_id, partition, role, now, &mut out);
                return out;
            }
            ClientMsg::Ping => {
                send(&mut out, conn, ServerMsg::Pong { timestamp: now });
                return out;
            }
            other => other,
        };
        let Some(agent) = self.agent_of(conn) else {
            send(
                &mut out,
                conn,
                ServerMsg::error(
                    error_codes::NOT_REGISTERED,
                    format!("register before sending {}", msg.kind()),
                ),
            );
            return out;
        };

        match msg {
            ClientMsg::Register { .. } | ClientMsg::Ping => {}
            ClientMsg::Heartbeat => {}
            ClientMsg::Subscribe { pattern } => self.subscribe(conn, &agent, pattern, &mut out),
            ClientMsg::Unsubscribe { pattern } => {
                if let Some(entry) = self.agents.get_mut(&agent) {
                    entry.subscriptions.retain(|p| p != &pattern);
                    if let Err(err) = entry.rebuild_matcher() {
                        warn!(event = "subscription_rebuild_failed", agent_id = %agent, error = %err);
                    }
                }
            }
            ClientMsg::AcquireLock {
                file_path,
                lock_type,
                ttl_secs,
                region,
            } => {
                let file = self.normalize(&file_path);
                let ttl = ttl_secs.unwrap_or(self.settings.lock_ttl_secs);
                let mut request = LockRequest::file(&file, &agent, lock_type, ttl);
                if let Some(identifier) = region {
                    match self.resolve_region(&file, &identifier) {
                        Ok(found) => request = request.with_region(LockRegion::from(&found)),
                        Err(reply) => {
                            send(&mut out, conn, reply);
                            return out;
                        }
                    }
                }
                self.acquire(conn, &agent, request, now, &mut out);
            }
            ClientMsg::ReleaseLock { file_path, region } => {
                let file = self.normalize(&file_path);
                let name = region.as_deref().map(canonical_region_name);
                let rid = resource_id(&file, name.as_deref());
                match self.locks.release(&rid, &agent) {
                    ReleaseOutcome::Released(record) => {
                        self.metrics.locks_released += 1;
                        self.dirty = true;
                        info!(event = "lock_released", agent_id = %agent, resource_id = %rid);
                        let msg = ServerMsg::LockReleased {
                            resource_id: record.resource_id,
                            file_path: record.file_path,
                            agent_id: agent.clone(),
                        };
                        self.to_all(&mut out, &msg, None);
                        self.push_context(&mut out, None, now);
                    }
                    ReleaseOutcome::HeldByOther { held_by } => send(
                        &mut out,
                        conn,
                        ServerMsg::error(
                            error_codes::HELD_BY_OTHER,
                            format!("{rid} is held by {held_by}"),
                        ),
                    ),
                    ReleaseOutcome::NotHeld => send(
                        &mut out,
                        conn,
                        ServerMsg::error(error_codes::LOCK_NOT_HELD, format!("{rid} is not locked")),
                    ),
                }
            }
            ClientMsg::CheckLock { file_path, line } => {
                let file = self.normalize(&file_path);
                let report = self.locks.check_access(&file, line, &agent, now);
                send(
                    &mut out,
                    conn,
                    ServerMsg::LockAccess {
                        file_path: file,
                        line,
                        report,
                    },
                );
            }
            ClientMsg::GetRegions { file_path } => {
                let file = self.normalize(&file_path);
                let reply = match self.file_regions(&file) {
                    Ok(regions) => {
                        let free: HashSet<String> = self
                            .locks
                            .available_regions(&file, &regions, &agent, now)
                            .iter()
                            .map(CodeRegion::region_id)
                            .collect();
                        let regions = regions
                            .iter()
                            .map(|region| RegionStatus {
                                available: free.contains(&region.region_id()),
                                region: region.clone(),
                            })
                            .collect();
                        ServerMsg::RegionsList {
                            file_path: file,
                            regions,
                        }
                    }
                    Err(reply) => reply,
                };
                send(&mut out, conn, reply);
            }
            ClientMsg::GetContext => {
                send(&mut out, conn, ServerMsg::ContextSync(self.context(now)));
            }
            ClientMsg::UpdateContext { partition } => {
                self.set_partition(&agent, partition);
                self.push_context(&mut out, None, now);
            }
            ClientMsg::Broadcast {
                event,
                data,
                target,
            } => self.relay(conn, &agent, event, data, target, now, &mut out),
            ClientMsg::Forward { event, fields } => {
                self.relay(conn, &agent, event, Value::Object(fields), None, now, &mut out)
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        conn: ConnId,
        agent_type: &str,
        instance_id: &str,
        partition: Option<String>,
        role: Option<Role>,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
    ) {
        if agent_type.trim().is_empty() || instance_id.trim().is_empty() {
            send(
                out,
                conn,
                ServerMsg::error(
                    error_codes::INVALID_MESSAGE,
                    "agent_type and instance_id are required",
                ),
            );
            return;
        }
        let id = agent_id(agent_type, instance_id);

        match self.agent_of(conn) {
            Some(current) if current == id => {
                if partition.is_some() {
                    self.set_partition(&id, partition);
                }
                send(
                    out,
                    conn,
                    ServerMsg::Registered {
                        agent_id: id,
                        workspace: self.settings.workspace.display().to_string(),
                        context: self.context(now),
                    },
                );
                return;
            }
            Some(current) => {
                self.teardown(&current, "reregistered", now, out);
                self.connections.insert(conn, None);
            }
            None => {}
        }
        if let Some(prior) = self.agents.get(&id).map(|a| a.conn) {
            warn!(event = "agent_replaced", agent_id = %id, prior_conn = prior, conn);
            self.teardown(&id, "replaced", now, out);
            self.connections.remove(&prior);
            out.push(Outbound::Close {
                conn: prior,
                reason: "replaced".to_string(),
            });
        }

        let role = role.unwrap_or_else(|| Role::for_agent_type(agent_type));
        let partition = partition.or_else(|| self.partitions.get(&id).cloned());
        self.agents.insert(
            id.clone(),
            AgentEntry {
                conn,
                agent_id: id.clone(),
                agent_type: agent_type.trim().to_string(),
                instance_id: instance_id.trim().to_string(),
                role,
                partition: None,
                subscriptions: Vec::new(),
                matcher: GlobSet::empty(),
                connected_at: now,
                last_heartbeat: now,
            },
        );
        self.set_partition(&id, partition);
        self.connections.insert(conn, Some(id.clone()));
        self.metrics.registrations += 1;
        info!(event = "agent_registered", agent_id = %id, role = role.as_str(), conn);

        send(
            out,
            conn,
            ServerMsg::Registered {
                agent_id: id.clone(),
                workspace: self.settings.workspace.display().to_string(),
                context: self.context(now),
            },
        );
        let joined = ServerMsg::AgentJoined {
            agent_id: id.clone(),
            agent_type: agent_type.trim().to_string(),
            role,
            partition: self.agents.get(&id).and_then(|a| a.partition.clone()),
        };
        self.to_all(out, &joined, Some(id.as_str()));
        self.push_context(out, Some(id.as_str()), now);
    }

    /// Forgets an agent: its locks are released and announced, then its departure.
    fn teardown(&mut self, agent_id: &str, reason: &str, now: DateTime<Utc>, out: &mut Vec<Outbound>) {
        if self.agents.remove(agent_id).is_none() {
            return;
        }
        let released = self.locks.release_all(agent_id);
        if !released.is_empty() {
            self.dirty = true;
        }
        for record in released {
            self.metrics.locks_released += 1;
            let msg = ServerMsg::LockReleased {
                resource_id: record.resource_id,
                file_path: record.file_path,
                agent_id: agent_id.to_string(),
            };
            self.to_all(out, &msg, None);
        }
        info!(event = "agent_left", agent_id = %agent_id, reason = %reason);
        let left = ServerMsg::AgentLeft {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        };
        self.to_all(out, &left, None);
        self.push_context(out, None, now);
    }

    fn set_partition(&mut self, agent_id: &str, partition: Option<String>) {
        let partition = partition.filter(|p| !p.trim().is_empty());
        if let Some(entry) = self.agents.get_mut(agent_id) {
            entry.partition = partition.clone();
        }
        let changed = match &partition {
            Some(p) => self.partitions.insert(agent_id.to_string(), p.clone()).as_ref() != Some(p),
            None => self.partitions.remove(agent_id).is_some(),
        };
        if changed {
            self.dirty = true;
        }
    }

    fn subscribe(&mut self, conn: ConnId, agent: &str, pattern: String, out: &mut Vec<Outbound>) {
        let Some(entry) = self.agents.get_mut(agent) else {
            return;
        };
        if entry.subscriptions.contains(&pattern) {
            return;
        }
        let rejected = match Glob::new(&pattern) {
            Err(err) => Some(err),
            Ok(_) => {
                entry.subscriptions.push(pattern.clone());
                let built = entry.rebuild_matcher().err();
                if built.is_some() {
                    entry.subscriptions.retain(|p| p != &pattern);
                    if let Err(err) = entry.rebuild_matcher() {
                        warn!(event = "subscription_rebuild_failed", agent_id = %agent, error = %err);
                    }
                }
                built
            }
        };
        if let Some(err) = rejected {
            warn!(event = "subscription_rejected", agent_id = %agent, pattern = %pattern, error = %err);
            send(
                out,
                conn,
                ServerMsg::error(error_codes::INVALID_PATTERN, format!("{pattern}: {err}")),
            );
            return;
        }
        debug!(event = "subscribed", agent_id = %agent, pattern = %pattern);
    }

    fn resolve_region(&mut self, file: &str, identifier: &str) -> Result<CodeRegion, ServerMsg> {
        if parse_line_range(identifier).is_none() && !is_contained(file) {
            return Err(ServerMsg::error(
                error_codes::FILE_UNREADABLE,
                format!("{file} is outside the workspace"),
            ));
        }
        match self.regions.find(&self.settings.workspace, file, identifier) {
            Ok(Some(region)) => Ok(region),
            Ok(None) => Err(ServerMsg::error(
                error_codes::REGION_NOT_FOUND,
                format!("no region {identifier} in {file}"),
            )),
            Err(err) => Err(ServerMsg::error(
                error_codes::FILE_UNREADABLE,
                format!("{file}: {err}"),
            )),
        }
    }

    fn file_regions(&mut self, file: &str) -> Result<std::sync::Arc<Vec<CodeRegion>>, ServerMsg> {
        if !is_contained(file) {
            return Err(ServerMsg::error(
                error_codes::FILE_UNREADABLE,
                format!("{file} is outside the workspace"),
            ));
        }
        self.regions
            .regions_for_file(&self.settings.workspace, file)
            .map_err(|err| ServerMsg::error(error_codes::FILE_UNREADABLE, format!("{file}: {err}")))
    }

    fn acquire(
        &mut self,
        conn: ConnId,
        agent: &str,
        request: LockRequest,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
    ) {
        match self.locks.acquire(request, now) {
            AcquireOutcome::Granted {
                record,
                renewed,
                replaced,
            } => {
                if let Some(old) = replaced {
                    self.metrics.locks_expired += 1;
                    self.to_all(out, &ServerMsg::LockExpired { lock: old }, None);
                }
                if renewed {
                    self.metrics.locks_renewed += 1;
                } else {
                    self.metrics.locks_granted += 1;
                }
                self.dirty = true;
                info!(
                    event = "lock_granted",
                    agent_id = %agent,
                    resource_id = %record.resource_id,
                    lock_type = record.lock_type.as_str(),
                    renewed
                );
                let msg = ServerMsg::LockAcquired {
                    lock: record,
                    renewed,
                };
                send(out, conn, msg.clone());
                self.to_all(out, &msg, Some(agent));
                self.push_context(out, None, now);
            }
            AcquireOutcome::Denied(denial) => {
                self.metrics.locks_denied += 1;
                info!(
                    event = "lock_denied",
                    agent_id = %agent,
                    resource_id = %denial.resource_id,
                    held_by = %denial.held_by
                );
                let msg = ServerMsg::LockFailed(denial);
                send(out, conn, msg.clone());
                self.to_all(out, &msg, Some(agent));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn relay(
        &mut self,
        conn: ConnId,
        from: &str,
        event: String,
        data: Value,
        target: Option<String>,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
    ) {
        let frame = ServerMsg::Event(EventFrame {
            event: event.clone(),
            from: from.to_string(),
            timestamp: now,
            data: data.clone(),
        });
        for agent in self.agents.values() {
            if agent.agent_id == from {
                continue;
            }
            let wanted = match target.as_deref() {
                None => true,
                Some(t) => agent.agent_id == t || agent.agent_type.eq_ignore_ascii_case(t),
            };
            if wanted {
                send(out, agent.conn, frame.clone());
            }
        }
        debug!(event = "relayed", from = %from, name = %event, target = ?target);
        if WORKFLOW_EVENTS.contains(&event.as_str()) {
            self.drive_workflow(conn, from, &event, &data, now, out);
        }
    }

    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let expired = self.locks.sweep_expired(now);
        if expired.is_empty() {
            return out;
        }
        self.dirty = true;
        for lock in expired {
            self.metrics.locks_expired += 1;
            info!(event = "lock_expired", resource_id = %lock.resource_id, holder = %lock.holder_id);
            self.to_all(&mut out, &ServerMsg::LockExpired { lock }, None);
        }
        self.push_context(&mut out, None, now);
        out
    }

    pub fn check_heartbeats(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let timeout = chrono::Duration::from_std(self.settings.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let stale: Vec<(String, ConnId)> = self
            .agents
            .values()
            .filter(|a| now.signed_duration_since(a.last_heartbeat) > timeout)
            .map(|a| (a.agent_id.clone(), a.conn))
            .collect();
        for (agent_id, conn) in stale {
            warn!(event = "agent_stale", agent_id = %agent_id, conn);
            self.metrics.stale_agents += 1;
            self.teardown(&agent_id, "heartbeat_timeout", now, &mut out);
            self.connections.remove(&conn);
            out.push(Outbound::Close {
                conn,
                reason: "heartbeat_timeout".to_string(),
            });
        }
        out
    }

    /// Records an observed workspace change and fans it out to subscribers.
    pub fn file_changed(
        &mut self,
        path: &str,
        change_type: ChangeType,
        checksum: Option<String>,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let file = self.normalize(path);
        match (&change_type, &checksum) {
            (ChangeType::Deleted, _) => {
                self.seen_checksums.pop(&file);
            }
            (_, Some(sum)) => {
                if self.seen_checksums.get(&file) == Some(sum) {
                    self.metrics.duplicate_changes += 1;
                    debug!(event = "file_change_duplicate", file = %file);
                    return out;
                }
                self.seen_checksums.put(file.clone(), sum.clone());
            }
            (_, None) => {}
        }

        let holder = self
            .locks
            .locks_for(&file)
            .find(|r| !r.is_expired_at(now))
            .map(|r| r.holder_id.clone());
        if holder.is_none() {
            self.metrics.out_of_band_writes += 1;
            debug!(event = "out_of_band_write", file = %file, change = ?change_type);
        }
        self.regions.invalidate(&file);
        self.metrics.file_events += 1;

        let event = FileChangeEvent {
            file_path: file.clone(),
            change_type,
            agent_id: holder.clone(),
            timestamp: now,
            checksum,
        };
        while self.recent.len() >= self.settings.recent_capacity.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(event.clone());

        let msg = ServerMsg::file_event(event);
        for agent in self.agents.values() {
            if holder.as_deref() == Some(agent.agent_id.as_str()) {
                continue;
            }
            if agent.matcher.is_match(&file) {
                send(&mut out, agent.conn, msg.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cohort_core::locks::LockType;
    use serde_json::json;
    use std::fs;

    pub(super) fn settings(workspace: &Path) -> CoreSettings {
        CoreSettings {
            workspace: workspace.to_path_buf(),
            lock_ttl_secs: 300,
            heartbeat_timeout: Duration::from_secs(120),
            recent_capacity: 100,
            apply_merges: true,
            checksum_capacity: DEFAULT_CHECKSUM_CAPACITY,
            mode: None,
        }
    }

    pub(super) fn register(core: &mut HubCore, conn: ConnId, agent_type: &str, now: DateTime<Utc>) {
        core.connect(conn);
        let out = core.handle(
            conn,
            ClientMsg::Register {
                agent_type: agent_type.to_string(),
                instance_id: "1".to_string(),
                partition: None,
                role: None,
            },
            now,
        );
        assert!(matches!(
            sent_to(&out, conn).first(),
            Some(ServerMsg::Registered { .. })
        ));
    }

    pub(super) fn sent_to(out: &[Outbound], conn: ConnId) -> Vec<ServerMsg> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Send { conn: c, msg } if *c == conn => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    fn acquire(file: &str, lock_type: LockType, ttl: Option<u64>, region: Option<&str>) -> ClientMsg {
        ClientMsg::AcquireLock {
            file_path: file.to_string(),
            lock_type,
            ttl_secs: ttl,
            region: region.map(str::to_string),
        }
    }

    #[test]
    fn exclusive_lock_denies_second_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);

        let out = core.handle(1, acquire("a.py", LockType::Exclusive, Some(300), None), now);
        assert!(sent_to(&out, 1)
            .iter()
            .any(|m| matches!(m, ServerMsg::LockAcquired { renewed: false, .. })));
        assert!(sent_to(&out, 2)
            .iter()
            .any(|m| matches!(m, ServerMsg::LockAcquired { .. })));

        let out = core.handle(2, acquire("./a.py", LockType::Exclusive, None, None), now);
        match sent_to(&out, 2).as_slice() {
            [ServerMsg::LockFailed(denial)] => {
                assert_eq!(denial.held_by, "CLAUDE-1");
                assert_eq!(denial.requested_by.as_deref(), Some("CODEX-1"));
            }
            other => panic!("unexpected replies {other:?}"),
        }
        match sent_to(&out, 1).as_slice() {
            [ServerMsg::LockFailed(denial)] => assert_eq!(denial.resource_id, "a.py"),
            other => panic!("holder should see the refusal, got {other:?}"),
        }
        assert!(core.take_dirty());
    }

    #[test]
    fn releasing_someone_elses_lock_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        core.handle(1, acquire("a.py", LockType::Exclusive, None, None), now);

        let out = core.handle(
            2,
            ClientMsg::ReleaseLock {
                file_path: "a.py".to_string(),
                region: None,
            },
            now,
        );
        match sent_to(&out, 2).as_slice() {
            [ServerMsg::Error { code, .. }] => assert_eq!(code, error_codes::HELD_BY_OTHER),
            other => panic!("unexpected replies {other:?}"),
        }
        assert_eq!(core.locks().len(), 1);

        let out = core.handle(
            1,
            ClientMsg::ReleaseLock {
                file_path: "a.py".to_string(),
                region: None,
            },
            now,
        );
        assert!(sent_to(&out, 2)
            .iter()
            .any(|m| matches!(m, ServerMsg::LockReleased { agent_id, .. } if agent_id == "CLAUDE-1")));
        assert!(core.locks().is_empty());
    }

    #[test]
    fn unregistered_connections_only_get_pong() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        core.connect(9);
        let out = core.handle_frame(9, r#"{"type":"context:get"}"#, now);
        assert!(matches!(
            sent_to(&out, 9).as_slice(),
            [ServerMsg::Error { code, .. }] if code == error_codes::NOT_REGISTERED
        ));
        let out = core.handle_frame(9, r#"{"type":"ping"}"#, now);
        assert!(matches!(sent_to(&out, 9).as_slice(), [ServerMsg::Pong { .. }]));
        let out = core.handle_frame(9, "{oops", now);
        assert!(matches!(
            sent_to(&out, 9).as_slice(),
            [ServerMsg::Error { code, .. }] if code == error_codes::INVALID_MESSAGE
        ));
    }

    #[test]
    fn disconnect_releases_locks_and_announces_departure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        core.handle(1, acquire("a.py", LockType::Exclusive, None, None), now);
        core.handle(1, acquire("b.py", LockType::Shared, None, None), now);

        let out = core.disconnect(1, "disconnect", now);
        let seen = sent_to(&out, 2);
        let released = seen
            .iter()
            .filter(|m| matches!(m, ServerMsg::LockReleased { .. }))
            .count();
        assert_eq!(released, 2);
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMsg::AgentLeft { agent_id, .. } if agent_id == "CLAUDE-1")));
        assert!(core.locks().is_empty());
        assert_eq!(core.agent_ids().collect::<Vec<_>>(), vec!["CODEX-1"]);
        assert!(core.disconnect(1, "disconnect", now).is_empty());
    }

    #[test]
    fn reregistering_an_id_closes_the_prior_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        core.handle(1, acquire("a.py", LockType::Exclusive, None, None), now);

        core.connect(2);
        let out = core.handle(
            2,
            ClientMsg::Register {
                agent_type: "CLAUDE".to_string(),
                instance_id: "1".to_string(),
                partition: None,
                role: None,
            },
            now,
        );
        assert!(out.contains(&Outbound::Close {
            conn: 1,
            reason: "replaced".to_string()
        }));
        assert!(core.locks().is_empty());
        assert!(matches!(
            sent_to(&out, 2).last(),
            Some(ServerMsg::Registered { agent_id, .. }) if agent_id == "CLAUDE-1"
        ));
        // The replaced connection's eventual close is a no-op.
        assert!(core.disconnect(1, "disconnect", now).is_empty());
        assert_eq!(core.agent_ids().count(), 1);

        // Registering again on the same connection is idempotent.
        let out = core.handle(
            2,
            ClientMsg::Register {
                agent_type: "CLAUDE".to_string(),
                instance_id: "1".to_string(),
                partition: Some("src/api".to_string()),
                role: None,
            },
            now,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(core.context(now).partitions.get("CLAUDE-1").map(String::as_str), Some("src/api"));
    }

    #[test]
    fn expiry_sweep_broadcasts_to_everyone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        core.handle(1, acquire("b.py", LockType::Exclusive, Some(1), None), now);
        core.take_dirty();

        assert!(core.sweep_expired(now).is_empty());
        let out = core.sweep_expired(now + ChronoDuration::seconds(2));
        for conn in [1, 2] {
            assert!(sent_to(&out, conn)
                .iter()
                .any(|m| matches!(m, ServerMsg::LockExpired { lock } if lock.file_path == "b.py")));
        }
        assert!(core.locks().is_empty());
        assert!(core.take_dirty());
    }

    #[test]
    fn silent_agents_are_torn_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        core.handle(1, acquire("a.py", LockType::Exclusive, None, None), now);

        let later = now + ChronoDuration::seconds(100);
        core.touch(2, later);
        let out = core.check_heartbeats(now + ChronoDuration::seconds(121));
        assert!(out.contains(&Outbound::Close {
            conn: 1,
            reason: "heartbeat_timeout".to_string()
        }));
        assert!(core.locks().is_empty());
        assert_eq!(core.agent_ids().collect::<Vec<_>>(), vec!["CODEX-1"]);
    }

    #[test]
    fn region_locks_resolve_through_the_parser() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("svc.py"),
            "class Foo:\n    def bar(self):\n        return 1\n\n\ndef baz():\n    return 2\n",
        )
        .expect("seed");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);

        let out = core.handle(1, acquire("svc.py", LockType::Exclusive, None, Some("Foo.bar")), now);
        assert!(matches!(
            sent_to(&out, 1).first(),
            Some(ServerMsg::LockAcquired { lock, .. }) if lock.resource_id == "svc.py#Foo.bar"
        ));

        // The enclosing class overlaps; the sibling function does not.
        let out = core.handle(2, acquire("svc.py", LockType::Exclusive, None, Some("Foo")), now);
        assert!(matches!(sent_to(&out, 2).first(), Some(ServerMsg::LockFailed(_))));
        let out = core.handle(2, acquire("svc.py", LockType::Exclusive, None, Some("baz")), now);
        assert!(matches!(sent_to(&out, 2).first(), Some(ServerMsg::LockAcquired { .. })));

        let out = core.handle(2, acquire("svc.py", LockType::Exclusive, None, Some("Nope")), now);
        assert!(matches!(
            sent_to(&out, 2).as_slice(),
            [ServerMsg::Error { code, .. }] if code == error_codes::REGION_NOT_FOUND
        ));

        let out = core.handle(
            2,
            ClientMsg::CheckLock {
                file_path: "svc.py".to_string(),
                line: 3,
            },
            now,
        );
        match sent_to(&out, 2).as_slice() {
            [ServerMsg::LockAccess { report, .. }] => {
                assert!(!report.can_access);
                assert_eq!(report.blocking[0].holder_id, "CLAUDE-1");
            }
            other => panic!("unexpected replies {other:?}"),
        }

        let out = core.handle(
            2,
            ClientMsg::GetRegions {
                file_path: "svc.py".to_string(),
            },
            now,
        );
        match sent_to(&out, 2).as_slice() {
            [ServerMsg::RegionsList { regions, .. }] => {
                let availability: BTreeMap<&str, bool> = regions
                    .iter()
                    .map(|r| (r.region.name.as_str(), r.available))
                    .collect();
                assert_eq!(availability.get("Foo"), Some(&false));
                assert_eq!(availability.get("Foo.bar"), Some(&false));
                assert_eq!(availability.get("baz"), Some(&true));
            }
            other => panic!("unexpected replies {other:?}"),
        }

        let out = core.handle(
            1,
            ClientMsg::ReleaseLock {
                file_path: "svc.py".to_string(),
                region: Some("Foo.bar".to_string()),
            },
            now,
        );
        assert!(sent_to(&out, 2)
            .iter()
            .any(|m| matches!(m, ServerMsg::LockReleased { resource_id, .. } if resource_id == "svc.py#Foo.bar")));
    }

    #[test]
    fn line_range_locks_need_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        let out = core.handle(1, acquire("gen.rs", LockType::Exclusive, None, Some("line:10-20")), now);
        assert!(matches!(
            sent_to(&out, 1).first(),
            Some(ServerMsg::LockAcquired { lock, .. }) if lock.resource_id == "gen.rs#lines:10-20"
        ));
    }

    #[test]
    fn file_changes_fan_out_to_matching_subscribers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        register(&mut core, 3, "GEMINI", now);
        core.handle(2, ClientMsg::Subscribe { pattern: "src/**/*.py".to_string() }, now);
        core.handle(3, ClientMsg::Subscribe { pattern: "**/*".to_string() }, now);
        core.handle(1, ClientMsg::Subscribe { pattern: "**/*".to_string() }, now);
        core.handle(1, acquire("src/a.py", LockType::Exclusive, None, None), now);

        let out = core.file_changed("src/a.py", ChangeType::Modified, Some("abc".into()), now);
        assert!(sent_to(&out, 1).is_empty(), "author is not echoed");
        match sent_to(&out, 2).as_slice() {
            [ServerMsg::FileChanged(change)] => assert_eq!(change.agent_id.as_deref(), Some("CLAUDE-1")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sent_to(&out, 3).len(), 1);

        assert!(core
            .file_changed("src/a.py", ChangeType::Modified, Some("abc".into()), now)
            .is_empty());

        let out = core.file_changed("README.md", ChangeType::Created, Some("r1".into()), now);
        assert!(sent_to(&out, 2).is_empty());
        assert!(matches!(sent_to(&out, 3).as_slice(), [ServerMsg::FileCreated(_)]));

        let out = core.handle(
            3,
            ClientMsg::Subscribe {
                pattern: "src/[".to_string(),
            },
            now,
        );
        assert!(matches!(
            sent_to(&out, 3).as_slice(),
            [ServerMsg::Error { code, .. }] if code == error_codes::INVALID_PATTERN
        ));

        let report = core.metrics_report(true);
        assert_eq!(report.counters.file_events, 2);
        assert_eq!(report.counters.duplicate_changes, 1);
        assert_eq!(report.counters.out_of_band_writes, 1);
        assert_eq!(core.context(now).recent_changes.len(), 2);
        assert_eq!(core.metrics_report(false).counters.file_events, 0);
    }

    #[test]
    fn recent_changes_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(CoreSettings {
            recent_capacity: 3,
            ..settings(dir.path())
        });
        let now = Utc::now();
        for i in 0..5 {
            core.file_changed(&format!("f{i}.txt"), ChangeType::Created, Some(format!("{i}")), now);
        }
        let files: Vec<String> = core
            .context(now)
            .recent_changes
            .into_iter()
            .map(|c| c.file_path)
            .collect();
        assert_eq!(files, vec!["f2.txt", "f3.txt", "f4.txt"]);
    }

    #[test]
    fn remembered_checksums_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(CoreSettings {
            checksum_capacity: 2,
            ..settings(dir.path())
        });
        let now = Utc::now();
        for file in ["a.txt", "b.txt", "c.txt"] {
            core.file_changed(file, ChangeType::Modified, Some(format!("{file}-1")), now);
        }
        assert_eq!(core.seen_checksums.len(), 2);
        assert!(core.seen_checksums.peek("a.txt").is_none());

        // Evicted entries count as news again; retained ones are still deduped.
        core.file_changed("c.txt", ChangeType::Modified, Some("c.txt-1".into()), now);
        core.file_changed("a.txt", ChangeType::Modified, Some("a.txt-1".into()), now);
        assert_eq!(core.metrics_report(false).counters.duplicate_changes, 1);

        core.file_changed("a.txt", ChangeType::Deleted, None, now);
        assert!(core.seen_checksums.peek("a.txt").is_none());
    }

    #[test]
    fn invalid_pattern_is_reported_and_keeps_existing_subscriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        core.handle(2, ClientMsg::Subscribe { pattern: "*.md".to_string() }, now);

        for bad in ["{a,b", "src/[", "a/**["] {
            let out = core.handle(2, ClientMsg::Subscribe { pattern: bad.to_string() }, now);
            match sent_to(&out, 2).as_slice() {
                [ServerMsg::Error { code, message }] => {
                    assert_eq!(code, error_codes::INVALID_PATTERN);
                    assert!(message.starts_with(bad));
                }
                other => panic!("{bad} should be rejected, got {other:?}"),
            }
        }
        let subscriptions = core.context(now).agents.into_iter().find(|a| a.agent_id == "CODEX-1");
        assert_eq!(
            subscriptions.map(|a| a.subscriptions),
            Some(vec!["*.md".to_string()])
        );
        let out = core.file_changed("README.md", ChangeType::Modified, Some("r".into()), now);
        assert!(matches!(sent_to(&out, 2).as_slice(), [ServerMsg::FileChanged(_)]));
    }

    #[test]
    fn broadcasts_reach_targets_and_unknown_types_are_forwarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        register(&mut core, 2, "CODEX", now);
        register(&mut core, 3, "GEMINI", now);

        let out = core.handle(
            1,
            ClientMsg::Broadcast {
                event: "build:done".to_string(),
                data: json!({"ok": true}),
                target: Some("codex".to_string()),
            },
            now,
        );
        assert!(sent_to(&out, 1).is_empty());
        assert!(sent_to(&out, 3).is_empty());
        assert!(matches!(
            sent_to(&out, 2).as_slice(),
            [ServerMsg::Event(frame)] if frame.event == "build:done" && frame.from == "CLAUDE-1"
        ));

        let out = core.handle_frame(2, r#"{"type":"custom:ping","n":3}"#, now);
        for conn in [1, 3] {
            match sent_to(&out, conn).as_slice() {
                [ServerMsg::Event(frame)] => {
                    assert_eq!(frame.event, "custom:ping");
                    assert_eq!(frame.data["n"], 3);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn snapshot_round_trip_keeps_live_locks_and_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut core = HubCore::new(settings(dir.path()));
        let now = Utc::now();
        register(&mut core, 1, "CLAUDE", now);
        core.handle(1, acquire("a.py", LockType::Exclusive, Some(300), None), now);
        core.handle(1, acquire("b.py", LockType::Exclusive, Some(5), None), now);
        core.handle(
            1,
            ClientMsg::UpdateContext {
                partition: Some("src/api".to_string()),
            },
            now,
        );
        let snapshot = core.snapshot(now);

        let mut restored = HubCore::new(settings(dir.path()));
        restored.restore(snapshot, now + ChronoDuration::seconds(10));
        let files: Vec<&str> = restored.locks().locks().map(|l| l.file_path.as_str()).collect();
        assert_eq!(files, vec!["a.py"]);
        assert_eq!(
            restored.context(now).partitions.get("CLAUDE-1").map(String::as_str),
            Some("src/api")
        );
    }

    #[test]
    fn only_plain_relative_paths_are_contained() {
        assert!(is_contained("src/a.py"));
        assert!(!is_contained("../etc/passwd"));
        assert!(!is_contained("/etc/passwd"));
    }
}
