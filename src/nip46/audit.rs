//! Audit logging for remote signer operations
//!
//! Records connects, signing requests and encryption calls, with their
//! outcome, to a local JSON lines file for later review.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub operation: String,
    pub details: String,
}

/// Append-only audit log
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    enabled: bool,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
        }
    }

    /// Log next to a state file: `state.json` -> `state.audit.jsonl`
    pub fn beside(state_path: &Path) -> Self {
        Self::new(state_path.with_extension("audit.jsonl"))
    }

    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record an audit event
    pub fn record(&mut self, operation: &str, details: &str) {
        if !self.enabled {
            return;
        }

        let entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            details: details.to_string(),
        };

        // Best-effort append, never fails the operation being audited
        if let Err(e) = self.append(&entry) {
            debug!("failed to write audit entry to {}: {}", self.path.display(), e);
        }
    }

    /// Read back every entry; unparseable lines are skipped
    pub fn entries(&self) -> Vec<AuditEntry> {
        if !self.enabled {
            return Vec::new();
        }
        std::fs::read_to_string(&self.path)
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let json = serde_json::to_string(entry)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)
    }
}
