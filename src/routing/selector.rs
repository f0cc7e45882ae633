use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical routing destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKey {
    Read,
    #[default]
    Write,
}

impl TargetKey {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKey::Read => "read",
            TargetKey::Write => "write",
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Attributes of the unit of work a connection is requested for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    pub active: bool,
    pub read_only: bool,
    pub name: Option<String>,
}

impl TransactionContext {
    /// No transaction in progress
    pub fn none() -> Self {
        Self::default()
    }

    pub fn active(read_only: bool, name: Option<String>) -> Self {
        Self {
            active: true,
            read_only,
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Pick the routing target for a transaction context.
pub fn select_target(context: &TransactionContext) -> TargetKey {
    match (context.active, context.read_only) {
        (false, _) => TargetKey::Write,
        (true, true) => TargetKey::Read,
        (true, false) => TargetKey::Write,
    }
}
