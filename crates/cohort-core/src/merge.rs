//! Three-way line merge of two concurrent versions against a common base.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// One contiguous replacement of base lines `[base_start, base_end)` (0-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub base_start: usize,
    pub base_end: usize,
    pub lines: Vec<String>,
}

impl Hunk {
    pub fn is_insertion(&self) -> bool {
        self.base_start == self.base_end
    }

    /// Base lines this hunk claims; an insertion claims its anchor line.
    fn touched(&self) -> (usize, usize) {
        (self.base_start, self.base_end.max(self.base_start + 1))
    }

    fn collides(&self, other: &Hunk) -> bool {
        let (a0, a1) = self.touched();
        let (b0, b1) = other.touched();
        a0 < b1 && b0 < a1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conflict {
    pub id: String,
    pub file_path: String,
    pub agent_a: String,
    pub agent_b: String,
    pub content_a: String,
    pub content_b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_content: Option<String>,
    /// 1-based base lines edited by both sides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlapping_lines: Vec<u32>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(String),
    Conflict(Conflict),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("unknown conflict {0}")]
    UnknownConflict(String),
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),
}

pub fn conflict_id(now: DateTime<Utc>, sequence: u32) -> String {
    format!("CONFLICT-{}-{sequence:03}", now.format("%Y%m%d"))
}

/// Lines with their terminators kept, so joining them reproduces the input.
fn split_lines(content: &str) -> Vec<&str> {
    content.split_inclusive('\n').collect()
}

/// Edit cost after which a subrange is replaced wholesale instead of aligned.
pub const MAX_EDIT_COST: usize = 2048;

/// Myers diff state for one direction, indexed by diagonal `k` in `-d..=d`.
struct Diagonals {
    offset: isize,
    xs: Vec<usize>,
}

impl Diagonals {
    fn new(max_d: usize) -> Self {
        Self {
            offset: max_d as isize,
            xs: vec![0; 2 * max_d + 1],
        }
    }

    fn get(&self, k: isize) -> usize {
        self.xs[(k + self.offset) as usize]
    }

    fn set(&mut self, k: isize, x: usize) {
        self.xs[(k + self.offset) as usize] = x;
    }
}

fn common_prefix(a: &[&str], b: &[&str]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[&str], b: &[&str]) -> usize {
    a.iter().rev().zip(b.iter().rev()).take_while(|(x, y)| x == y).count()
}

/// Point where the forward and backward searches meet, relative to the slices.
fn middle_snake(
    a: &[&str],
    b: &[&str],
    fwd: &mut Diagonals,
    bwd: &mut Diagonals,
    limit: usize,
) -> Option<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let delta = n as isize - m as isize;
    let odd = delta & 1 == 1;
    fwd.set(1, 0);
    bwd.set(1, 0);
    let max_d = ((n + m + 1) / 2 + 1).min(limit) as isize;
    for d in 0..max_d {
        for k in (-d..=d).rev().step_by(2) {
            let mut x = if k == -d || (k != d && fwd.get(k - 1) < fwd.get(k + 1)) {
                fwd.get(k + 1)
            } else {
                fwd.get(k - 1) + 1
            };
            let y = (x as isize - k) as usize;
            let (x0, y0) = (x, y);
            if x < n && y < m {
                x += common_prefix(&a[x..], &b[y..]);
            }
            fwd.set(k, x);
            if odd && (k - delta).abs() < d && fwd.get(k) + bwd.get(-(k - delta)) >= n {
                return Some((x0, y0));
            }
        }
        for k in (-d..=d).rev().step_by(2) {
            let mut x = if k == -d || (k != d && bwd.get(k - 1) < bwd.get(k + 1)) {
                bwd.get(k + 1)
            } else {
                bwd.get(k - 1) + 1
            };
            let mut y = (x as isize - k) as usize;
            if x < n && y < m {
                let run = common_suffix(&a[..n - x], &b[..m - y]);
                x += run;
                y += run;
            }
            bwd.set(k, x);
            if !odd && (k - delta).abs() <= d && bwd.get(k) + fwd.get(-(k - delta)) >= n {
                return Some((n.saturating_sub(x), m.saturating_sub(y)));
            }
        }
    }
    None
}

/// Appends runs of equal lines as `(base_index, other_index, len)`.
fn collect_matches(
    a: &[&str],
    b: &[&str],
    (a0, b0): (usize, usize),
    fwd: &mut Diagonals,
    bwd: &mut Diagonals,
    matches: &mut Vec<(usize, usize, usize)>,
) {
    let head = common_prefix(a, b);
    if head > 0 {
        matches.push((a0, b0, head));
    }
    let (a, b) = (&a[head..], &b[head..]);
    let tail = common_suffix(a, b);
    let (mid_a, mid_b) = (&a[..a.len() - tail], &b[..b.len() - tail]);
    let (a0, b0) = (a0 + head, b0 + head);

    if !mid_a.is_empty() && !mid_b.is_empty() {
        // Past the limit the whole middle stays one replacement.
        let split = middle_snake(mid_a, mid_b, fwd, bwd, MAX_EDIT_COST)
            .map(|(x, y)| (x.min(mid_a.len()), y.min(mid_b.len())))
            .filter(|&(x, y)| (x, y) != (0, 0) && (x, y) != (mid_a.len(), mid_b.len()));
        if let Some((x, y)) = split {
            collect_matches(&mid_a[..x], &mid_b[..y], (a0, b0), fwd, bwd, matches);
            collect_matches(&mid_a[x..], &mid_b[y..], (a0 + x, b0 + y), fwd, bwd, matches);
        }
    }
    if tail > 0 {
        matches.push((a0 + mid_a.len(), b0 + mid_b.len(), tail));
    }
}

/// Myers line diff of `other` against `base`, as replacement hunks in base order.
/// Memory stays linear in the input; very distant inputs yield coarser hunks.
pub fn diff_hunks(base: &[&str], other: &[&str]) -> Vec<Hunk> {
    let max_d = (base.len() + other.len() + 1) / 2 + 1;
    let mut fwd = Diagonals::new(max_d.min(MAX_EDIT_COST + 1));
    let mut bwd = Diagonals::new(max_d.min(MAX_EDIT_COST + 1));
    let mut matches = Vec::new();
    collect_matches(base, other, (0, 0), &mut fwd, &mut bwd, &mut matches);
    matches.push((base.len(), other.len(), 0));

    let mut hunks = Vec::new();
    let (mut i, mut j) = (0, 0);
    for (bi, oj, len) in matches {
        if bi > i || oj > j {
            hunks.push(Hunk {
                base_start: i,
                base_end: bi,
                lines: other[j..oj].iter().map(|line| line.to_string()).collect(),
            });
        }
        i = bi + len;
        j = oj + len;
    }
    hunks
}

/// Takes the other side when one is blank, the superset when one contains
/// the other, and the in-order union when both sides only inserted lines.
pub fn auto_resolve(conflict: &Conflict) -> Option<String> {
    let (a, b) = (&conflict.content_a, &conflict.content_b);
    if a.trim().is_empty() {
        return Some(b.clone());
    }
    if b.trim().is_empty() {
        return Some(a.clone());
    }
    if b.contains(a.as_str()) {
        return Some(b.clone());
    }
    if a.contains(b.as_str()) {
        return Some(a.clone());
    }

    let base = conflict.base_content.as_deref()?;
    let base_lines = split_lines(base);
    let hunks_a = diff_hunks(&base_lines, &split_lines(a));
    let hunks_b = diff_hunks(&base_lines, &split_lines(b));
    if !hunks_a.iter().chain(hunks_b.iter()).all(Hunk::is_insertion) {
        return None;
    }

    let at = |hunks: &[Hunk], anchor: usize| {
        hunks
            .iter()
            .find(|h| h.base_start == anchor)
            .map(|h| h.lines.clone())
    };
    let mut out = String::new();
    for anchor in 0..=base_lines.len() {
        let from_a = at(&hunks_a, anchor);
        let from_b = at(&hunks_b, anchor);
        if let Some(lines) = &from_a {
            push_lines(&mut out, lines);
        }
        if let Some(lines) = &from_b {
            if from_a.as_ref() != Some(lines) {
                push_lines(&mut out, lines);
            }
        }
        if let Some(line) = base_lines.get(anchor) {
            push_lines(&mut out, &[line.to_string()]);
        }
    }
    Some(out)
}

/// Appends lines, adding a break when the previous text lacks one.
fn push_lines(out: &mut String, lines: &[String]) {
    for line in lines {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(line);
    }
}

/// Produces merges and tracks the conflicts it has issued.
#[derive(Debug, Default)]
pub struct MergeEngine {
    sequence: u32,
    conflicts: BTreeMap<String, Conflict>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &mut self,
        base: &str,
        content_a: &str,
        content_b: &str,
        agent_a: &str,
        agent_b: &str,
        file_path: &str,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let base_lines = split_lines(base);
        let hunks_a = diff_hunks(&base_lines, &split_lines(content_a));
        let mut hunks_b = diff_hunks(&base_lines, &split_lines(content_b));
        hunks_b.retain(|hunk| !hunks_a.contains(hunk));

        let mut overlapping = Vec::new();
        for ha in &hunks_a {
            for hb in hunks_b.iter().filter(|hb| ha.collides(hb)) {
                let (a0, a1) = ha.touched();
                let (b0, b1) = hb.touched();
                for line in a0.max(b0)..a1.min(b1) {
                    overlapping.push(u32::try_from(line + 1).unwrap_or(u32::MAX));
                }
            }
        }
        if !overlapping.is_empty() {
            overlapping.sort_unstable();
            overlapping.dedup();
            self.sequence += 1;
            let conflict = Conflict {
                id: conflict_id(now, self.sequence),
                file_path: file_path.to_string(),
                agent_a: agent_a.to_string(),
                agent_b: agent_b.to_string(),
                content_a: content_a.to_string(),
                content_b: content_b.to_string(),
                base_content: Some(base.to_string()),
                overlapping_lines: overlapping,
                resolved: false,
                resolution: None,
                resolved_by: None,
                created_at: now,
            };
            info!(
                event = "merge_conflict",
                conflict_id = %conflict.id,
                file = file_path,
                agent_a = agent_a,
                agent_b = agent_b,
                lines = conflict.overlapping_lines.len()
            );
            self.conflicts.insert(conflict.id.clone(), conflict.clone());
            return MergeOutcome::Conflict(conflict);
        }

        let mut hunks: Vec<&Hunk> = hunks_a.iter().chain(hunks_b.iter()).collect();
        hunks.sort_by_key(|h| (h.base_start, h.base_end));
        let mut merged = String::with_capacity(base.len().max(content_a.len()));
        let mut next = hunks.into_iter().peekable();
        let mut i = 0;
        loop {
            if let Some(hunk) = next.next_if(|h| h.base_start == i) {
                for line in &hunk.lines {
                    merged.push_str(line);
                }
                if hunk.base_end > i {
                    i = hunk.base_end;
                    continue;
                }
            }
            match base_lines.get(i) {
                Some(line) => {
                    merged.push_str(line);
                    i += 1;
                }
                None => break,
            }
        }
        debug!(
            event = "merge_clean",
            file = file_path,
            hunks_a = hunks_a.len(),
            hunks_b = hunks_b.len()
        );
        MergeOutcome::Merged(merged)
    }

    pub fn auto_resolve(&self, conflict: &Conflict) -> Option<String> {
        auto_resolve(conflict)
    }

    pub fn resolve(&mut self, conflict_id: &str, resolution: &str, resolved_by: &str) -> Result<&Conflict, MergeError> {
        let conflict = self
            .conflicts
            .get_mut(conflict_id)
            .ok_or_else(|| MergeError::UnknownConflict(conflict_id.to_string()))?;
        if conflict.resolved {
            return Err(MergeError::AlreadyResolved(conflict_id.to_string()));
        }
        conflict.resolved = true;
        conflict.resolution = Some(resolution.to_string());
        conflict.resolved_by = Some(resolved_by.to_string());
        Ok(conflict)
    }

    pub fn conflict(&self, conflict_id: &str) -> Option<&Conflict> {
        self.conflicts.get(conflict_id)
    }

    pub fn open_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values().filter(|c| !c.resolved)
    }

    /// Takes back conflicts saved before a restart; new ids continue after them.
    pub fn restore(&mut self, conflicts: impl IntoIterator<Item = Conflict>) {
        for conflict in conflicts {
            let issued = conflict
                .id
                .rsplit('-')
                .next()
                .and_then(|seq| seq.parse::<u32>().ok())
                .unwrap_or(0);
            self.sequence = self.sequence.max(issued);
            self.conflicts.insert(conflict.id.clone(), conflict);
        }
    }
}
