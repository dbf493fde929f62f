use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub mod config;
pub mod locks;
pub mod merge;
pub mod orchestrator;
pub mod protocol;
pub mod regions;

/// Number of hex characters kept from a content digest.
pub const CHECKSUM_HEX_LEN: usize = 16;

/// Collaboration function an agent plays inside a workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Implementer,
    Reviewer,
    Observer,
}

impl Default for Role {
    fn default() -> Self {
        Self::Observer
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Observer => "observer",
        }
    }

    /// Default role for an agent type when registration does not name one.
    pub fn for_agent_type(agent_type: &str) -> Self {
        match agent_type.trim().to_uppercase().as_str() {
            "GEMINI" => Role::Planner,
            "CLAUDE" => Role::Implementer,
            "CODEX" => Role::Reviewer,
            _ => Role::Observer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "planner" => Ok(Role::Planner),
            "implementer" => Ok(Role::Implementer),
            "reviewer" => Ok(Role::Reviewer),
            "observer" => Ok(Role::Observer),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

pub fn agent_id(agent_type: &str, instance_id: &str) -> String {
    format!("{}-{}", agent_type.trim(), instance_id.trim())
}

/// Workspace-relative, `/`-separated form of a path sent by an agent or the watcher.
pub fn normalize_path(workspace: &Path, raw: &str) -> String {
    let candidate = Path::new(raw.trim());
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(workspace).unwrap_or(candidate)
    } else {
        candidate
    };
    let text = relative.to_string_lossy().replace('\\', "/");
    text.trim_start_matches("./").to_string()
}

/// Truncated SHA-256 used to tell real edits apart from touch-only notifications.
pub fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(CHECKSUM_HEX_LEN);
    for byte in digest.iter().take(CHECKSUM_HEX_LEN / 2) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
