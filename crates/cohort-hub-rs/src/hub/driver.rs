//! Feeds relayed workflow events through the state machine and carries out
//! the side effects it asks for.

use super::{is_contained, send, ConnId, HubCore, Outbound};
use chrono::{DateTime, Utc};
use cohort_core::checksum;
use cohort_core::merge::MergeOutcome;
use cohort_core::orchestrator::{SideEffect, WorkflowEvent};
use cohort_core::protocol::{error_codes, EventFrame, ServerMsg};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Sender name on events the hub emits itself.
pub const HUB_SENDER: &str = "hub";

impl HubCore {
    pub(super) fn drive_workflow(
        &mut self,
        conn: ConnId,
        from: &str,
        event: &str,
        data: &Value,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
    ) {
        let mut first = match WorkflowEvent::from_wire(event, from, data, now) {
            Ok(Some(first)) => first,
            Ok(None) => return,
            Err(err) => {
                self.metrics.workflow_rejections += 1;
                warn!(event = "workflow_rejected", name = %event, error = %err);
                send(
                    out,
                    conn,
                    ServerMsg::error(error_codes::WORKFLOW, format!("{event}: {err}")),
                );
                return;
            }
        };
        match &mut first {
            WorkflowEvent::CodeWritten { file, base, .. } => {
                *file = self.normalize(file);
                if data.get("base_content").is_none() {
                    *base = self.read_workspace(file).unwrap_or_default();
                }
            }
            WorkflowEvent::MergeSucceeded { file, .. } | WorkflowEvent::CodeMerged { file } => {
                *file = self.normalize(file);
            }
            _ => {}
        }

        let before = self.workflow.summary(&self.roster());
        let mut queue = VecDeque::from([first]);
        while let Some(next) = queue.pop_front() {
            let roster = self.roster();
            match self.workflow.apply(&next, &roster, now) {
                Ok((workflow, effects)) => {
                    debug!(
                        event = "workflow_step",
                        name = next.name(),
                        state = workflow.state.as_str(),
                        effects = effects.len()
                    );
                    self.workflow = workflow;
                    self.dirty = true;
                    for effect in effects {
                        self.run_effect(effect, now, &mut queue, out);
                    }
                }
                Err(err) => {
                    self.metrics.workflow_rejections += 1;
                    warn!(event = "workflow_rejected", name = next.name(), error = %err);
                    send(
                        out,
                        conn,
                        ServerMsg::error(error_codes::WORKFLOW, format!("{}: {err}", next.name())),
                    );
                }
            }
        }

        let after = self.workflow.summary(&self.roster());
        if after != before {
            info!(event = "workflow_state", state = after.state.as_str());
            self.to_all(out, &ServerMsg::WorkflowStatus(after), None);
        }
    }

    fn read_workspace(&self, file: &str) -> Option<String> {
        if !is_contained(file) {
            return None;
        }
        std::fs::read(self.settings.workspace.join(file))
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn announce(&self, out: &mut Vec<Outbound>, event: &str, data: Value, now: DateTime<Utc>) {
        let frame = ServerMsg::Event(EventFrame {
            event: event.to_string(),
            from: HUB_SENDER.to_string(),
            timestamp: now,
            data,
        });
        self.to_all(out, &frame, None);
    }

    fn run_effect(
        &mut self,
        effect: SideEffect,
        now: DateTime<Utc>,
        queue: &mut VecDeque<WorkflowEvent>,
        out: &mut Vec<Outbound>,
    ) {
        match effect {
            SideEffect::Notify {
                role,
                event,
                message,
                data,
            } => {
                let msg = ServerMsg::WorkflowNotify {
                    role,
                    event,
                    message,
                    data,
                };
                for agent in self.agents.values().filter(|a| a.role == role) {
                    send(out, agent.conn, msg.clone());
                }
            }
            SideEffect::InvokeMerge { file } => {
                if let Some(next) = self.merge_versions(&file, now, out) {
                    queue.push_back(next);
                }
            }
            SideEffect::ApplyResolution {
                file,
                content,
                conflict_id,
            } => self.apply_resolution(file, content, conflict_id, out),
        }
    }

    /// Folds every pending version of `file` onto its base, left to right.
    fn merge_versions(
        &mut self,
        file: &str,
        now: DateTime<Utc>,
        out: &mut Vec<Outbound>,
    ) -> Option<WorkflowEvent> {
        let entry = self.workflow.versions.get(file)?.clone();
        let mut versions = entry.versions.into_iter();
        let (mut author, mut merged) = versions.next()?;
        for (other, content) in versions {
            match self
                .merges
                .merge(&entry.base, &merged, &content, &author, &other, file, now)
            {
                MergeOutcome::Merged(text) => {
                    merged = text;
                    author = format!("{author}+{other}");
                }
                MergeOutcome::Conflict(conflict) => {
                    self.metrics.merges_conflicted += 1;
                    self.announce(out, "conflict:detected", json!(conflict), now);
                    return Some(WorkflowEvent::ConflictDetected { conflict });
                }
            }
        }
        self.metrics.merges_clean += 1;
        info!(event = "merge_clean", file = %file, authors = %author);
        self.announce(
            out,
            "merge:succeeded",
            json!({ "file": file, "content": merged }),
            now,
        );
        Some(WorkflowEvent::MergeSucceeded {
            file: file.to_string(),
            content: merged,
        })
    }

    fn apply_resolution(
        &mut self,
        file: String,
        content: String,
        conflict_id: Option<String>,
        out: &mut Vec<Outbound>,
    ) {
        if let Some(id) = &conflict_id {
            let resolver = self
                .workflow
                .conflicts
                .get(id)
                .and_then(|c| c.resolved_by.clone())
                .unwrap_or_else(|| HUB_SENDER.to_string());
            if let Err(err) = self.merges.resolve(id, &content, &resolver) {
                debug!(event = "merge_engine_resolve_skipped", conflict_id = %id, error = %err);
            }
        }

        let file = self.normalize(&file);
        let mut written = false;
        let mut sum = None;
        if self.settings.apply_merges && is_contained(&file) {
            let target = self.settings.workspace.join(&file);
            match cohort_storage::write_atomic(&target, content.as_bytes()) {
                Ok(()) => {
                    let digest = checksum(content.as_bytes());
                    self.seen_checksums.put(file.clone(), digest.clone());
                    self.regions.invalidate(&file);
                    self.metrics.merges_applied += 1;
                    info!(event = "merge_applied", file = %file, checksum = %digest);
                    written = true;
                    sum = Some(digest);
                }
                Err(err) => warn!(event = "merge_write_failed", file = %file, error = %err),
            }
        } else if self.settings.apply_merges {
            warn!(event = "merge_path_rejected", file = %file);
        }

        let msg = ServerMsg::MergeApplied {
            file_path: file,
            written,
            checksum: sum,
            conflict_id,
        };
        self.to_all(out, &msg, None);
    }
}
