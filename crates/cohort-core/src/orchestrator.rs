//! Role-based workflow as a pure transition function.
//!
//! `Workflow::apply` never touches the network or the filesystem: it returns
//! the next workflow value plus the [`SideEffect`]s the hub should carry out.
//! A failed transition leaves the caller's workflow untouched.

use crate::merge::{auto_resolve, Conflict};
use crate::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

pub const AUTO_RESOLVER: &str = "auto";
pub const ENV_ORCHESTRATION_MODE: &str = "COHORT_ORCHESTRATION_MODE";

/// Broadcast event names that feed the workflow.
pub const WORKFLOW_EVENTS: &[&str] = &[
    "plan:proposed",
    "plan:approved",
    "plan:amendment",
    "code:written",
    "code:merged",
    "review:requested",
    "review:completed",
    "fix:suggested",
    "fix:applied",
    "merge:succeeded",
    "conflict:detected",
    "conflict:resolved",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Idle,
    Planning,
    Implementing,
    Reviewing,
    Merging,
    Completed,
    Conflict,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Idle
    }
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::Implementing => "IMPLEMENTING",
            WorkflowState::Reviewing => "REVIEWING",
            WorkflowState::Merging => "MERGING",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the team is expected to work; reported with the workflow and persisted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrchestrationMode {
    /// Planner, implementers and reviewers hand work along in real time.
    #[default]
    #[serde(rename = "GCC-RT")]
    GccRt,
    /// Agents work in parallel and meet at sync points.
    #[serde(rename = "PAR-RT")]
    ParRt,
    /// One agent under monitoring.
    #[serde(rename = "SOLO-RT")]
    SoloRt,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationMode::GccRt => "GCC-RT",
            OrchestrationMode::ParRt => "PAR-RT",
            OrchestrationMode::SoloRt => "SOLO-RT",
        }
    }
}

impl std::str::FromStr for OrchestrationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "GCC-RT" => Ok(OrchestrationMode::GccRt),
            "PAR-RT" => Ok(OrchestrationMode::ParRt),
            "SOLO-RT" => Ok(OrchestrationMode::SoloRt),
            other => Err(format!("unknown orchestration mode {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Proposed,
    Approved,
    Amended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Amendment {
    pub suggested_by: String,
    pub suggestion: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub feature: String,
    pub approach: String,
    pub files: Vec<String>,
    pub risks: Vec<String>,
    pub status: PlanStatus,
    pub proposed_by: String,
    pub approved_by: Vec<String>,
    pub amendments: Vec<Amendment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Approved,
    ChangesRequested,
    Blocked,
}

impl ReviewStatus {
    /// Only an explicit approval counts; anything unrecognised asks for changes.
    pub fn from_wire(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str).map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("APPROVED") => ReviewStatus::Approved,
            Some(s) if s.eq_ignore_ascii_case("BLOCKED") => ReviewStatus::Blocked,
            _ => ReviewStatus::ChangesRequested,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewResult {
    pub id: String,
    pub files: Vec<String>,
    pub status: ReviewStatus,
    pub findings: Vec<Value>,
    pub comments: String,
    pub reviewer_id: String,
    pub created_at: DateTime<Utc>,
}

/// Concurrent versions of one file awaiting merge, keyed by author.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileVersions {
    pub base: String,
    pub versions: BTreeMap<String, String>,
}

/// Connected agents and their roles, as seen by the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    roles: BTreeMap<String, Role>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent_id: &str, role: Role) {
        self.roles.insert(agent_id.to_string(), role);
    }

    pub fn remove(&mut self, agent_id: &str) {
        self.roles.remove(agent_id);
    }

    pub fn role_of(&self, agent_id: &str) -> Option<Role> {
        self.roles.get(agent_id).copied()
    }

    pub fn agents_with(&self, role: Role) -> impl Iterator<Item = &str> {
        self.roles
            .iter()
            .filter(move |(_, r)| **r == role)
            .map(|(id, _)| id.as_str())
    }
}

impl FromIterator<(String, Role)> for Roster {
    fn from_iter<T: IntoIterator<Item = (String, Role)>>(iter: T) -> Self {
        Self {
            roles: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    PlanProposed {
        from: String,
        feature: String,
        approach: String,
        files: Vec<String>,
        risks: Vec<String>,
    },
    PlanApproved {
        from: String,
    },
    PlanAmendment {
        from: String,
        suggestion: String,
        reason: String,
    },
    CodeWritten {
        from: String,
        file: String,
        content: Option<String>,
        /// Workspace content before this round of edits, supplied by the driver.
        base: String,
    },
    CodeMerged {
        file: String,
    },
    ReviewRequested {
        from: String,
        files: Vec<String>,
        description: String,
    },
    ReviewCompleted {
        from: String,
        files: Vec<String>,
        status: ReviewStatus,
        findings: Vec<Value>,
        comments: String,
    },
    FixSuggested {
        from: String,
        description: String,
    },
    FixApplied {
        from: String,
    },
    MergeSucceeded {
        file: String,
        content: String,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictResolved {
        from: String,
        conflict_id: String,
        resolution: String,
    },
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn required_field(data: &Value, keys: &[&'static str]) -> Result<String, WorkflowError> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or(WorkflowError::MissingField(keys[0]))
}

fn list_field(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

impl WorkflowEvent {
    /// Decodes a broadcast into a workflow event; `Ok(None)` when `event` is not
    /// one. Events that would write files must carry their file and content.
    pub fn from_wire(
        event: &str,
        from: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, WorkflowError> {
        let from = from.to_string();
        let parsed = match event {
            "plan:proposed" => WorkflowEvent::PlanProposed {
                from,
                feature: str_field(data, "feature"),
                approach: str_field(data, "approach"),
                files: list_field(data, "files"),
                risks: list_field(data, "risks"),
            },
            "plan:approved" => WorkflowEvent::PlanApproved { from },
            "plan:amendment" => WorkflowEvent::PlanAmendment {
                from,
                suggestion: str_field(data, "suggestion"),
                reason: str_field(data, "reason"),
            },
            "code:written" => WorkflowEvent::CodeWritten {
                from,
                file: str_field(data, "file"),
                content: data.get("content").and_then(Value::as_str).map(str::to_string),
                base: str_field(data, "base_content"),
            },
            "code:merged" => WorkflowEvent::CodeMerged {
                file: str_field(data, "file"),
            },
            "review:requested" => WorkflowEvent::ReviewRequested {
                from,
                files: list_field(data, "files"),
                description: str_field(data, "description"),
            },
            "review:completed" => WorkflowEvent::ReviewCompleted {
                from,
                files: list_field(data, "files"),
                status: ReviewStatus::from_wire(data.get("status")),
                findings: data
                    .get("findings")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                comments: str_field(data, "comments"),
            },
            "fix:suggested" => WorkflowEvent::FixSuggested {
                from,
                description: str_field(data, "description"),
            },
            "fix:applied" => WorkflowEvent::FixApplied { from },
            "merge:succeeded" => {
                let content = required_field(data, &["content"])?;
                if content.trim().is_empty() {
                    return Err(WorkflowError::BlankContent(str_field(data, "file")));
                }
                WorkflowEvent::MergeSucceeded {
                    file: required_field(data, &["file", "file_path"])?,
                    content,
                }
            }
            "conflict:detected" => WorkflowEvent::ConflictDetected {
                conflict: Conflict {
                    id: str_field(data, "conflict_id"),
                    file_path: required_field(data, &["file", "file_path"])?,
                    agent_a: str_field(data, "agent_a"),
                    agent_b: str_field(data, "agent_b"),
                    content_a: required_field(data, &["content_a"])?,
                    content_b: required_field(data, &["content_b"])?,
                    base_content: data
                        .get("base_content")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    overlapping_lines: Vec::new(),
                    resolved: false,
                    resolution: None,
                    resolved_by: None,
                    created_at: now,
                },
            },
            "conflict:resolved" => WorkflowEvent::ConflictResolved {
                from,
                conflict_id: required_field(data, &["conflict_id"])?,
                resolution: required_field(data, &["resolution"])?,
            },
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::PlanProposed { .. } => "plan:proposed",
            WorkflowEvent::PlanApproved { .. } => "plan:approved",
            WorkflowEvent::PlanAmendment { .. } => "plan:amendment",
            WorkflowEvent::CodeWritten { .. } => "code:written",
            WorkflowEvent::CodeMerged { .. } => "code:merged",
            WorkflowEvent::ReviewRequested { .. } => "review:requested",
            WorkflowEvent::ReviewCompleted { .. } => "review:completed",
            WorkflowEvent::FixSuggested { .. } => "fix:suggested",
            WorkflowEvent::FixApplied { .. } => "fix:applied",
            WorkflowEvent::MergeSucceeded { .. } => "merge:succeeded",
            WorkflowEvent::ConflictDetected { .. } => "conflict:detected",
            WorkflowEvent::ConflictResolved { .. } => "conflict:resolved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    Notify {
        role: Role,
        event: String,
        message: String,
        data: Value,
    },
    InvokeMerge {
        file: String,
    },
    ApplyResolution {
        file: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_id: Option<String>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("no active plan")]
    NoActivePlan,
    #[error("unknown conflict {0}")]
    UnknownConflict(String),
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),
    #[error("conflict {0} already exists")]
    DuplicateConflict(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("blank content for {0}")]
    BlankContent(String),
    #[error("{0} has no merge in progress")]
    NoPendingMerge(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSummary {
    #[serde(default)]
    pub mode: OrchestrationMode,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<PlanStatus>,
    pub pending_approvals: Vec<String>,
    pub unresolved_conflicts: Vec<String>,
    pub pending_merges: Vec<String>,
}

/// Serializes whole for the hub snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub mode: OrchestrationMode,
    pub state: WorkflowState,
    pub plan: Option<Plan>,
    pub reviews: Vec<ReviewResult>,
    pub versions: BTreeMap<String, FileVersions>,
    pub pending_merges: BTreeSet<String>,
    pub conflicts: BTreeMap<String, Conflict>,
    pub sequence: u32,
}

fn notify(role: Role, event: &str, message: String, data: Value) -> SideEffect {
    SideEffect::Notify {
        role,
        event: event.to_string(),
        message,
        data,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &self,
        event: &WorkflowEvent,
        roster: &Roster,
        now: DateTime<Utc>,
    ) -> Result<(Workflow, Vec<SideEffect>), WorkflowError> {
        let mut next = self.clone();
        let effects = next.step(event, roster, now)?;
        Ok((next, effects))
    }

    fn next_id(&mut self, prefix: &str, now: DateTime<Utc>) -> String {
        self.sequence += 1;
        format!("{prefix}-{}-{:03}", now.format("%Y%m%d"), self.sequence)
    }

    fn required_approvers(roster: &Roster) -> BTreeSet<String> {
        roster
            .agents_with(Role::Implementer)
            .chain(roster.agents_with(Role::Reviewer))
            .map(str::to_string)
            .collect()
    }

    fn open_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values().filter(|c| !c.resolved)
    }

    /// Leaves MERGING (or CONFLICT) once nothing is left to merge or resolve.
    fn settle_merging(&mut self) {
        if self.open_conflicts().next().is_some() {
            self.state = WorkflowState::Conflict;
            return;
        }
        if matches!(self.state, WorkflowState::Merging | WorkflowState::Conflict) {
            self.state = if self.pending_merges.is_empty() {
                WorkflowState::Completed
            } else {
                WorkflowState::Merging
            };
        }
    }

    fn step(
        &mut self,
        event: &WorkflowEvent,
        roster: &Roster,
        now: DateTime<Utc>,
    ) -> Result<Vec<SideEffect>, WorkflowError> {
        let mut effects = Vec::new();
        match event {
            WorkflowEvent::PlanProposed {
                from,
                feature,
                approach,
                files,
                risks,
            } => {
                let plan = Plan {
                    id: self.next_id("PLAN", now),
                    feature: feature.clone(),
                    approach: approach.clone(),
                    files: files.clone(),
                    risks: risks.clone(),
                    status: PlanStatus::Proposed,
                    proposed_by: from.clone(),
                    approved_by: Vec::new(),
                    amendments: Vec::new(),
                    created_at: now,
                };
                let data = json!({ "plan": &plan });
                effects.push(notify(
                    Role::Implementer,
                    event.name(),
                    format!("New plan proposed: {}", plan.id),
                    data.clone(),
                ));
                effects.push(notify(
                    Role::Reviewer,
                    event.name(),
                    format!("New plan for review: {}", plan.id),
                    data,
                ));
                self.plan = Some(plan);
                self.state = WorkflowState::Planning;
            }
            WorkflowEvent::PlanApproved { from } => {
                let required = Self::required_approvers(roster);
                let plan = self.plan.as_mut().ok_or(WorkflowError::NoActivePlan)?;
                if !plan.approved_by.contains(from) {
                    plan.approved_by.push(from.clone());
                }
                let approved: BTreeSet<String> = plan.approved_by.iter().cloned().collect();
                if required.is_subset(&approved) {
                    plan.status = PlanStatus::Approved;
                    effects.push(notify(
                        Role::Implementer,
                        event.name(),
                        format!("Plan approved. Begin implementation of: {}", plan.feature),
                        json!({ "plan_id": plan.id }),
                    ));
                    self.state = WorkflowState::Implementing;
                } else {
                    let pending: Vec<&String> = required.difference(&approved).collect();
                    effects.push(notify(
                        Role::Planner,
                        event.name(),
                        format!("Plan {} awaiting {} approval(s)", plan.id, pending.len()),
                        json!({ "plan_id": plan.id, "approved_by": approved, "pending": pending }),
                    ));
                }
            }
            WorkflowEvent::PlanAmendment {
                from,
                suggestion,
                reason,
            } => {
                let plan = self.plan.as_mut().ok_or(WorkflowError::NoActivePlan)?;
                plan.amendments.push(Amendment {
                    suggested_by: from.clone(),
                    suggestion: suggestion.clone(),
                    reason: reason.clone(),
                    at: now,
                });
                plan.status = PlanStatus::Amended;
                effects.push(notify(
                    Role::Planner,
                    event.name(),
                    format!("Amendment suggested: {}", preview(suggestion)),
                    json!({ "plan_id": plan.id, "suggested_by": from, "reason": reason }),
                ));
            }
            WorkflowEvent::CodeWritten {
                from,
                file,
                content,
                base,
            } => {
                let mut count = 0;
                if let (false, Some(content)) = (file.is_empty(), content) {
                    let entry = self
                        .versions
                        .entry(file.clone())
                        .or_insert_with(|| FileVersions {
                            base: base.clone(),
                            versions: BTreeMap::new(),
                        });
                    entry.versions.insert(from.clone(), content.clone());
                    count = entry.versions.len();
                }
                effects.push(notify(
                    Role::Reviewer,
                    event.name(),
                    format!("Code update: {file}"),
                    json!({ "file": file, "author": from, "versions": count }),
                ));
            }
            WorkflowEvent::CodeMerged { file } => {
                self.versions.remove(file);
                self.pending_merges.remove(file);
            }
            WorkflowEvent::ReviewRequested {
                from,
                files,
                description,
            } => {
                self.state = WorkflowState::Reviewing;
                effects.push(notify(
                    Role::Reviewer,
                    event.name(),
                    format!(
                        "Review requested for {} files: {}",
                        files.len(),
                        preview(description)
                    ),
                    json!({ "files": files, "requested_by": from }),
                ));
            }
            WorkflowEvent::ReviewCompleted {
                from,
                files,
                status,
                findings,
                comments,
            } => {
                let review = ReviewResult {
                    id: self.next_id("REV", now),
                    files: files.clone(),
                    status: *status,
                    findings: findings.clone(),
                    comments: comments.clone(),
                    reviewer_id: from.clone(),
                    created_at: now,
                };
                if *status == ReviewStatus::Approved {
                    let to_merge: Vec<String> = self
                        .versions
                        .iter()
                        .filter(|(_, v)| v.versions.len() >= 2)
                        .map(|(file, _)| file.clone())
                        .collect();
                    effects.push(notify(
                        Role::Implementer,
                        event.name(),
                        "Code approved! Ready to merge.".to_string(),
                        json!({ "review_id": review.id, "merging": to_merge }),
                    ));
                    if to_merge.is_empty() {
                        self.state = WorkflowState::Completed;
                    } else {
                        self.state = WorkflowState::Merging;
                        for file in to_merge {
                            effects.push(SideEffect::InvokeMerge { file: file.clone() });
                            self.pending_merges.insert(file);
                        }
                    }
                } else {
                    self.state = WorkflowState::Implementing;
                    effects.push(notify(
                        Role::Implementer,
                        event.name(),
                        format!("Changes requested: {} findings", findings.len()),
                        json!({ "review_id": review.id, "status": status, "findings": findings }),
                    ));
                }
                self.reviews.push(review);
            }
            WorkflowEvent::FixSuggested { from, description } => {
                effects.push(notify(
                    Role::Implementer,
                    event.name(),
                    format!("Fix suggested: {}", preview(description)),
                    json!({ "suggested_by": from, "description": description }),
                ));
            }
            WorkflowEvent::FixApplied { from } => {
                effects.push(notify(
                    Role::Reviewer,
                    event.name(),
                    "Fix applied, please re-review".to_string(),
                    json!({ "applied_by": from }),
                ));
            }
            WorkflowEvent::MergeSucceeded { file, content } => {
                if !self.pending_merges.contains(file) {
                    return Err(WorkflowError::NoPendingMerge(file.clone()));
                }
                if content.trim().is_empty() {
                    return Err(WorkflowError::BlankContent(file.clone()));
                }
                effects.push(SideEffect::ApplyResolution {
                    file: file.clone(),
                    content: content.clone(),
                    conflict_id: None,
                });
                self.pending_merges.remove(file);
                self.versions.remove(file);
                self.settle_merging();
            }
            WorkflowEvent::ConflictDetected { conflict } => {
                let mut conflict = conflict.clone();
                if conflict.id.is_empty() {
                    conflict.id = self.next_id("CONFLICT", now);
                    while self.conflicts.contains_key(&conflict.id) {
                        conflict.id = self.next_id("CONFLICT", now);
                    }
                } else if self.conflicts.contains_key(&conflict.id) {
                    return Err(WorkflowError::DuplicateConflict(conflict.id));
                }
                self.pending_merges.remove(&conflict.file_path);
                match auto_resolve(&conflict).filter(|text| !text.trim().is_empty()) {
                    Some(content) => {
                        conflict.resolved = true;
                        conflict.resolution = Some(content.clone());
                        conflict.resolved_by = Some(AUTO_RESOLVER.to_string());
                        self.versions.remove(&conflict.file_path);
                        effects.push(SideEffect::ApplyResolution {
                            file: conflict.file_path.clone(),
                            content,
                            conflict_id: Some(conflict.id.clone()),
                        });
                        self.conflicts.insert(conflict.id.clone(), conflict);
                        self.settle_merging();
                    }
                    None => {
                        effects.push(notify(
                            Role::Planner,
                            event.name(),
                            format!("Conflict needs manual resolution: {}", conflict.file_path),
                            json!({
                                "conflict_id": conflict.id,
                                "file": conflict.file_path,
                                "agent_a": conflict.agent_a,
                                "agent_b": conflict.agent_b,
                            }),
                        ));
                        self.conflicts.insert(conflict.id.clone(), conflict);
                        self.state = WorkflowState::Conflict;
                    }
                }
            }
            WorkflowEvent::ConflictResolved {
                from,
                conflict_id,
                resolution,
            } => {
                let conflict = self
                    .conflicts
                    .get_mut(conflict_id)
                    .ok_or_else(|| WorkflowError::UnknownConflict(conflict_id.clone()))?;
                if conflict.resolved {
                    return Err(WorkflowError::AlreadyResolved(conflict_id.clone()));
                }
                conflict.resolved = true;
                conflict.resolution = Some(resolution.clone());
                conflict.resolved_by = Some(from.clone());
                let file = conflict.file_path.clone();
                effects.push(SideEffect::ApplyResolution {
                    file: file.clone(),
                    content: resolution.clone(),
                    conflict_id: Some(conflict_id.clone()),
                });
                self.versions.remove(&file);
                self.settle_merging();
            }
        }
        Ok(effects)
    }

    pub fn summary(&self, roster: &Roster) -> WorkflowSummary {
        let pending_approvals = match &self.plan {
            Some(plan) if plan.status != PlanStatus::Approved => {
                let approved: BTreeSet<String> = plan.approved_by.iter().cloned().collect();
                Self::required_approvers(roster)
                    .difference(&approved)
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        };
        WorkflowSummary {
            mode: self.mode,
            state: self.state,
            plan_id: self.plan.as_ref().map(|p| p.id.clone()),
            plan_status: self.plan.as_ref().map(|p| p.status),
            pending_approvals,
            unresolved_conflicts: self.open_conflicts().map(|c| c.id.clone()).collect(),
            pending_merges: self.pending_merges.iter().cloned().collect(),
        }
    }
}
