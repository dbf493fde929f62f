//! In-memory lock table shared by the hub and the standalone coordinator.
//!
//! Every overlap decision goes through [`LineSpan::overlaps`]: two inclusive
//! ranges conflict unless one ends strictly before the other starts, so
//! touching endpoints count as overlap. A whole-file lock spans every line.

use crate::regions::{CodeRegion, RegionKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
/// Upper bound applied to requested TTLs (one year).
pub const MAX_LOCK_TTL_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Exclusive,
    Shared,
    Review,
}

impl Default for LockType {
    fn default() -> Self {
        Self::Exclusive
    }
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Exclusive => "EXCLUSIVE",
            LockType::Shared => "SHARED",
            LockType::Review => "REVIEW",
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockType::Exclusive)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "EXCLUSIVE" => Ok(LockType::Exclusive),
            "SHARED" => Ok(LockType::Shared),
            "REVIEW" => Ok(LockType::Review),
            other => Err(format!("Unknown lock type: {other}")),
        }
    }
}

/// Inclusive, 1-based line range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineSpan {
    pub start: u32,
    pub end: u32,
}

impl LineSpan {
    pub const WHOLE_FILE: LineSpan = LineSpan {
        start: 1,
        end: u32::MAX,
    };

    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn overlaps(&self, other: &LineSpan) -> bool {
        !(self.end < other.start || self.start > other.end)
    }

    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRegion {
    pub name: String,
    pub kind: RegionKind,
    pub start_line: u32,
    pub end_line: u32,
}

impl LockRegion {
    pub fn span(&self) -> LineSpan {
        LineSpan::new(self.start_line, self.end_line)
    }
}

impl From<&CodeRegion> for LockRegion {
    fn from(region: &CodeRegion) -> Self {
        Self {
            name: region.name.clone(),
            kind: region.kind,
            start_line: region.start_line,
            end_line: region.end_line,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub resource_id: String,
    pub file_path: String,
    pub holder_id: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<LockRegion>,
}

impl LockRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::seconds(self.ttl_secs.min(MAX_LOCK_TTL_SECS) as i64)
    }

    /// A lock reaching `acquired_at + ttl` is expired from that instant on.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn span(&self) -> LineSpan {
        self.region
            .as_ref()
            .map(LockRegion::span)
            .unwrap_or(LineSpan::WHOLE_FILE)
    }

    fn blocks(&self, requester: &str, lock_type: LockType, span: &LineSpan) -> bool {
        self.holder_id != requester
            && (lock_type.is_exclusive() || self.lock_type.is_exclusive())
            && self.span().overlaps(span)
    }
}

pub fn resource_id(file_path: &str, region_name: Option<&str>) -> String {
    match region_name {
        Some(name) if !name.is_empty() => format!("{file_path}#{name}"),
        _ => file_path.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub file_path: String,
    pub holder_id: String,
    pub lock_type: LockType,
    pub ttl_secs: u64,
    pub region: Option<LockRegion>,
}

impl LockRequest {
    pub fn file(file_path: &str, holder_id: &str, lock_type: LockType, ttl_secs: u64) -> Self {
        Self {
            file_path: file_path.to_string(),
            holder_id: holder_id.to_string(),
            lock_type,
            ttl_secs,
            region: None,
        }
    }

    pub fn with_region(mut self, region: LockRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn resource_id(&self) -> String {
        resource_id(
            &self.file_path,
            self.region.as_ref().map(|region| region.name.as_str()),
        )
    }

    fn span(&self) -> LineSpan {
        self.region
            .as_ref()
            .map(LockRegion::span)
            .unwrap_or(LineSpan::WHOLE_FILE)
    }
}

/// Who is in the way of a denied request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockDenial {
    pub resource_id: String,
    pub file_path: String,
    pub held_by: String,
    pub lock_type: LockType,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_resource: Option<String>,
    /// Agent whose request was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted {
        record: LockRecord,
        renewed: bool,
        /// Expired lock on the same resource that this grant displaced.
        replaced: Option<LockRecord>,
    },
    Denied(LockDenial),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(LockRecord),
    HeldByOther { held_by: String },
    NotHeld,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessReport {
    pub can_access: bool,
    pub blocking: Vec<LockRecord>,
}

#[derive(Debug, Default, Clone)]
pub struct ResourceLockTable {
    by_file: BTreeMap<String, Vec<LockRecord>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, request: LockRequest, now: DateTime<Utc>) -> AcquireOutcome {
        let resource_id = request.resource_id();
        let span = request.span();
        let records = self.by_file.entry(request.file_path.clone()).or_default();

        let mut replaced = None;
        if let Some(pos) = records
            .iter()
            .position(|r| r.resource_id == resource_id && r.is_expired_at(now))
        {
            replaced = Some(records.remove(pos));
        }

        let mut blocking: Vec<&LockRecord> = records
            .iter()
            .filter(|r| !r.is_expired_at(now))
            .filter(|r| r.blocks(&request.holder_id, request.lock_type, &span))
            .collect();
        blocking.sort_by_key(|r| r.acquired_at);
        if let Some(holder) = blocking.first() {
            let denial = LockDenial {
                resource_id: resource_id.clone(),
                file_path: request.file_path.clone(),
                held_by: holder.holder_id.clone(),
                lock_type: holder.lock_type,
                expires_at: holder.expires_at(),
                blocking_resource: (holder.resource_id != resource_id)
                    .then(|| holder.resource_id.clone()),
                requested_by: Some(request.holder_id.clone()),
            };
            if let Some(expired) = replaced {
                records.push(expired);
            }
            return AcquireOutcome::Denied(denial);
        }

        let record = LockRecord {
            resource_id: resource_id.clone(),
            file_path: request.file_path.clone(),
            holder_id: request.holder_id.clone(),
            lock_type: request.lock_type,
            acquired_at: now,
            ttl_secs: request.ttl_secs,
            region: request.region.clone(),
        };

        if let Some(existing) = records
            .iter_mut()
            .find(|r| r.resource_id == resource_id && r.holder_id == request.holder_id)
        {
            *existing = record.clone();
            return AcquireOutcome::Granted {
                record,
                renewed: true,
                replaced,
            };
        }

        records.push(record.clone());
        AcquireOutcome::Granted {
            record,
            renewed: false,
            replaced,
        }
    }

    pub fn release(&mut self, resource_id: &str, holder_id: &str) -> ReleaseOutcome {
        let mut other_holder = None;
        for records in self.by_file.values_mut() {
            if let Some(pos) = records
                .iter()
                .position(|r| r.resource_id == resource_id && r.holder_id == holder_id)
            {
                let record = records.remove(pos);
                self.prune_empty();
                return ReleaseOutcome::Released(record);
            }
            if other_holder.is_none() {
                other_holder = records
                    .iter()
                    .find(|r| r.resource_id == resource_id)
                    .map(|r| r.holder_id.clone());
            }
        }
        match other_holder {
            Some(held_by) => ReleaseOutcome::HeldByOther { held_by },
            None => ReleaseOutcome::NotHeld,
        }
    }

    /// Drops every lock held by `holder_id`, expired or not.
    pub fn release_all(&mut self, holder_id: &str) -> Vec<LockRecord> {
        let mut released = Vec::new();
        for records in self.by_file.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = records
                .drain(..)
                .partition(|r| r.holder_id == holder_id);
            *records = kept;
            released.extend(gone);
        }
        self.prune_empty();
        released
    }

    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<LockRecord> {
        let mut expired = Vec::new();
        for records in self.by_file.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|r| r.is_expired_at(now));
            *records = kept;
            expired.extend(gone);
        }
        self.prune_empty();
        expired
    }

    /// Reinstates persisted records, dropping any already expired at `now`.
    pub fn restore(&mut self, records: Vec<LockRecord>, now: DateTime<Utc>) -> Vec<LockRecord> {
        let mut discarded = Vec::new();
        for record in records {
            if record.is_expired_at(now) {
                discarded.push(record);
                continue;
            }
            let entries = self.by_file.entry(record.file_path.clone()).or_default();
            entries.retain(|r| !(r.resource_id == record.resource_id && r.holder_id == record.holder_id));
            entries.push(record);
        }
        discarded
    }

    pub fn check_access(
        &self,
        file_path: &str,
        line: u32,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> AccessReport {
        let blocking: Vec<LockRecord> = self
            .valid_for(file_path, now)
            .filter(|r| r.holder_id != agent_id && r.span().contains(line))
            .cloned()
            .collect();
        AccessReport {
            can_access: blocking.is_empty(),
            blocking,
        }
    }

    /// Regions on which `agent_id` would currently be granted an exclusive lock.
    pub fn available_regions(
        &self,
        file_path: &str,
        regions: &[CodeRegion],
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<CodeRegion> {
        regions
            .iter()
            .filter(|region| {
                let span = region.span();
                !self
                    .valid_for(file_path, now)
                    .any(|r| r.blocks(agent_id, LockType::Exclusive, &span))
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, resource_id: &str, now: DateTime<Utc>) -> Vec<&LockRecord> {
        self.by_file
            .values()
            .flatten()
            .filter(|r| r.resource_id == resource_id && !r.is_expired_at(now))
            .collect()
    }

    pub fn locks(&self) -> impl Iterator<Item = &LockRecord> {
        self.by_file.values().flatten()
    }

    pub fn locks_for(&self, file_path: &str) -> impl Iterator<Item = &LockRecord> {
        self.by_file.get(file_path).into_iter().flatten()
    }

    pub fn locks_held_by<'a>(&'a self, holder_id: &'a str) -> impl Iterator<Item = &'a LockRecord> {
        self.locks().filter(move |r| r.holder_id == holder_id)
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn valid_for<'a>(
        &'a self,
        file_path: &str,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a LockRecord> {
        self.locks_for(file_path)
            .filter(move |r| !r.is_expired_at(now))
    }

    fn prune_empty(&mut self) {
        self.by_file.retain(|_, records| !records.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn region(name: &str, start: u32, end: u32) -> LockRegion {
        LockRegion {
            name: name.to_string(),
            kind: RegionKind::Function,
            start_line: start,
            end_line: end,
        }
    }

    fn assert_mutual_exclusion(table: &ResourceLockTable, now: DateTime<Utc>) {
        let valid: Vec<&LockRecord> = table.locks().filter(|r| !r.is_expired_at(now)).collect();
        for a in &valid {
            for b in &valid {
                if std::ptr::eq(*a, *b) || a.file_path != b.file_path || a.holder_id == b.holder_id {
                    continue;
                }
                if a.span().overlaps(&b.span()) {
                    assert!(
                        !a.lock_type.is_exclusive() && !b.lock_type.is_exclusive(),
                        "exclusive lock {} coexists with {}",
                        a.resource_id,
                        b.resource_id
                    );
                }
            }
        }
    }

    #[test]
    fn touching_ranges_overlap() {
        assert!(LineSpan::new(10, 20).overlaps(&LineSpan::new(20, 30)));
        assert!(LineSpan::new(20, 30).overlaps(&LineSpan::new(10, 20)));
        assert!(!LineSpan::new(10, 19).overlaps(&LineSpan::new(20, 30)));
        assert!(LineSpan::new(5, 5).overlaps(&LineSpan::WHOLE_FILE));
        assert_eq!(LineSpan::new(9, 3), LineSpan::new(3, 9));
    }

    #[test]
    fn second_exclusive_request_is_denied_with_holder() {
        let mut table = ResourceLockTable::new();
        let first = table.acquire(
            LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 300),
            t0(),
        );
        assert!(first.is_granted());

        let second = table.acquire(
            LockRequest::file("a.py", "CODEX-1", LockType::Exclusive, 300),
            t0() + Duration::seconds(5),
        );
        let AcquireOutcome::Denied(denial) = second else {
            panic!("expected denial")
        };
        assert_eq!(denial.held_by, "CLAUDE-1");
        assert_eq!(denial.lock_type, LockType::Exclusive);
        assert_eq!(denial.expires_at, t0() + Duration::seconds(300));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn holder_renews_and_may_change_type() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("a.py", "CLAUDE-1", LockType::Shared, 60), t0());
        let later = t0() + Duration::seconds(30);
        let outcome = table.acquire(
            LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 120),
            later,
        );
        let AcquireOutcome::Granted { record, renewed, .. } = outcome else {
            panic!("expected renewal")
        };
        assert!(renewed);
        assert_eq!(record.acquired_at, later);
        assert_eq!(record.lock_type, LockType::Exclusive);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn upgrade_is_refused_while_another_agent_shares() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("a.py", "CLAUDE-1", LockType::Shared, 60), t0());
        table.acquire(LockRequest::file("a.py", "CODEX-1", LockType::Review, 60), t0());
        let outcome = table.acquire(
            LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 60),
            t0(),
        );
        assert!(matches!(outcome, AcquireOutcome::Denied(ref d) if d.held_by == "CODEX-1"));
        assert_mutual_exclusion(&table, t0());
    }

    #[test]
    fn shared_and_review_coexist_but_block_exclusive() {
        let mut table = ResourceLockTable::new();
        assert!(table
            .acquire(LockRequest::file("a.py", "A-1", LockType::Shared, 60), t0())
            .is_granted());
        assert!(table
            .acquire(LockRequest::file("a.py", "B-1", LockType::Review, 60), t0())
            .is_granted());
        assert!(!table
            .acquire(LockRequest::file("a.py", "C-1", LockType::Exclusive, 60), t0())
            .is_granted());
        assert_eq!(table.get("a.py", t0()).len(), 2);
    }

    #[test]
    fn exclusive_region_denied_on_any_overlap_in_file() {
        let mut table = ResourceLockTable::new();
        let granted = table.acquire(
            LockRequest::file("svc.py", "CLAUDE-1", LockType::Exclusive, 300)
                .with_region(region("Foo.bar", 10, 20)),
            t0(),
        );
        assert!(granted.is_granted());

        let touching = table.acquire(
            LockRequest::file("svc.py", "CODEX-1", LockType::Exclusive, 300)
                .with_region(region("baz", 20, 30)),
            t0(),
        );
        let AcquireOutcome::Denied(denial) = touching else {
            panic!("touching region must be denied")
        };
        assert_eq!(denial.resource_id, "svc.py#baz");
        assert_eq!(denial.blocking_resource.as_deref(), Some("svc.py#Foo.bar"));

        assert!(table
            .acquire(
                LockRequest::file("svc.py", "CODEX-1", LockType::Exclusive, 300)
                    .with_region(region("qux", 21, 30)),
                t0(),
            )
            .is_granted());

        assert!(!table
            .acquire(
                LockRequest::file("svc.py", "GEMINI-1", LockType::Shared, 300),
                t0(),
            )
            .is_granted());
        assert_mutual_exclusion(&table, t0());
    }

    #[test]
    fn expiry_is_reached_at_ttl_and_never_extended_by_time() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("b.py", "CLAUDE-1", LockType::Exclusive, 1), t0());
        let record = table.locks().next().cloned().expect("record");
        assert!(!record.is_expired_at(t0()));
        for offset in [1, 2, 10, 3600] {
            assert!(record.is_expired_at(t0() + Duration::seconds(offset)));
        }

        let outcome = table.acquire(
            LockRequest::file("b.py", "CODEX-1", LockType::Exclusive, 30),
            t0() + Duration::seconds(1),
        );
        let AcquireOutcome::Granted { replaced, renewed, .. } = outcome else {
            panic!("expired lock must not block")
        };
        assert!(!renewed);
        assert_eq!(replaced.map(|r| r.holder_id), Some("CLAUDE-1".to_string()));
    }

    #[test]
    fn sweep_removes_only_expired_locks() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("b.py", "CLAUDE-1", LockType::Exclusive, 1), t0());
        table.acquire(LockRequest::file("c.py", "CLAUDE-1", LockType::Exclusive, 300), t0());

        let expired = table.sweep_expired(t0() + Duration::seconds(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].resource_id, "b.py");
        assert_eq!(table.len(), 1);
        assert!(table.sweep_expired(t0() + Duration::seconds(2)).is_empty());
    }

    #[test]
    fn release_requires_the_holder() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 60), t0());

        assert_eq!(
            table.release("a.py", "CODEX-1"),
            ReleaseOutcome::HeldByOther {
                held_by: "CLAUDE-1".to_string()
            }
        );
        assert_eq!(table.release("missing.py", "CODEX-1"), ReleaseOutcome::NotHeld);
        assert!(matches!(
            table.release("a.py", "CLAUDE-1"),
            ReleaseOutcome::Released(ref r) if r.holder_id == "CLAUDE-1"
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn release_all_leaves_nothing_for_the_agent() {
        let mut table = ResourceLockTable::new();
        table.acquire(LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 60), t0());
        table.acquire(
            LockRequest::file("b.py", "CLAUDE-1", LockType::Shared, 60)
                .with_region(region("run", 1, 4)),
            t0(),
        );
        table.acquire(LockRequest::file("b.py", "CODEX-1", LockType::Shared, 60), t0());

        let released = table.release_all("CLAUDE-1");
        assert_eq!(released.len(), 2);
        assert_eq!(table.locks_held_by("CLAUDE-1").count(), 0);
        assert_eq!(table.locks_held_by("CODEX-1").count(), 1);
    }

    #[test]
    fn check_access_reports_blocking_locks_of_others() {
        let mut table = ResourceLockTable::new();
        table.acquire(
            LockRequest::file("m.ts", "CLAUDE-1", LockType::Exclusive, 60)
                .with_region(region("render", 5, 9)),
            t0(),
        );

        let blocked = table.check_access("m.ts", 9, "CODEX-1", t0());
        assert!(!blocked.can_access);
        assert_eq!(blocked.blocking.len(), 1);
        assert!(table.check_access("m.ts", 10, "CODEX-1", t0()).can_access);
        assert!(table.check_access("m.ts", 7, "CLAUDE-1", t0()).can_access);
        assert!(table
            .check_access("m.ts", 7, "CODEX-1", t0() + Duration::seconds(60))
            .can_access);
    }

    #[test]
    fn available_regions_use_the_overlap_predicate() {
        let mut table = ResourceLockTable::new();
        table.acquire(
            LockRequest::file("m.py", "CLAUDE-1", LockType::Shared, 60)
                .with_region(region("a", 1, 5)),
            t0(),
        );
        let regions = vec![
            CodeRegion::new("m.py", RegionKind::Function, "a", 1, 5),
            CodeRegion::new("m.py", RegionKind::Function, "b", 5, 8),
            CodeRegion::new("m.py", RegionKind::Function, "c", 6, 8),
        ];
        let names: Vec<String> = table
            .available_regions("m.py", &regions, "CODEX-1", t0())
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["c".to_string()]);
        assert_eq!(
            table.available_regions("m.py", &regions, "CLAUDE-1", t0()).len(),
            3
        );
    }

    #[test]
    fn restore_discards_locks_expired_at_load() {
        let mut source = ResourceLockTable::new();
        source.acquire(LockRequest::file("a.py", "CLAUDE-1", LockType::Exclusive, 10), t0());
        source.acquire(LockRequest::file("b.py", "CLAUDE-1", LockType::Exclusive, 600), t0());
        let persisted: Vec<LockRecord> = source.locks().cloned().collect();

        let mut restored = ResourceLockTable::new();
        let discarded = restored.restore(persisted, t0() + Duration::seconds(10));
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].file_path, "a.py");
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn random_operation_sequences_keep_mutual_exclusion() {
        let agents = ["A-1", "B-1", "C-1"];
        let types = [LockType::Exclusive, LockType::Shared, LockType::Review];
        let spans = [(1, 10), (10, 20), (15, 40), (41, 50)];
        let mut table = ResourceLockTable::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..500 {
            let now = t0() + Duration::seconds(step);
            let agent = agents[(next() % 3) as usize];
            match next() % 4 {
                0 => {
                    table.release_all(agent);
                }
                1 => {
                    table.sweep_expired(now);
                }
                _ => {
                    let (start, end) = spans[(next() % 4) as usize];
                    let mut request = LockRequest::file(
                        "shared.py",
                        agent,
                        types[(next() % 3) as usize],
                        1 + next() % 20,
                    );
                    if next() % 3 != 0 {
                        request = request.with_region(region(&format!("r{start}"), start, end));
                    }
                    table.acquire(request, now);
                }
            }
            assert_mutual_exclusion(&table, now);
        }
    }
}
