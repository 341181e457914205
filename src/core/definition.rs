//! Transaction definitions
//!
//! Propagation behaviour, isolation level, timeout and read-only hint for a
//! transaction, plus their string forms for configuration files.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a new transaction relates to one already bound in the context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the current transaction, or start one
    #[default]
    Required,
    /// Join the current transaction, or run without one
    Supports,
    /// Join the current transaction, fail without one
    Mandatory,
    /// Suspend the current transaction and start a new one
    RequiresNew,
    /// Suspend the current transaction and run without one
    NotSupported,
    /// Fail if a transaction exists
    Never,
    /// Nested transaction; rejected when a transaction exists
    Nested,
}

impl Propagation {
    pub fn to_str(&self) -> &'static str {
        match self {
            Propagation::Required => "required",
            Propagation::Supports => "supports",
            Propagation::Mandatory => "mandatory",
            Propagation::RequiresNew => "requires_new",
            Propagation::NotSupported => "not_supported",
            Propagation::Never => "never",
            Propagation::Nested => "nested",
        }
    }
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "required" => Ok(Propagation::Required),
            "supports" => Ok(Propagation::Supports),
            "mandatory" => Ok(Propagation::Mandatory),
            "requires_new" => Ok(Propagation::RequiresNew),
            "not_supported" => Ok(Propagation::NotSupported),
            "never" => Ok(Propagation::Never),
            "nested" => Ok(Propagation::Nested),
            _ => Err(format!("Invalid propagation behavior: '{}'", s)),
        }
    }
}

/// Requested isolation level
///
/// Only [`IsolationLevel::Default`] can be honoured: the engines run every
/// operation inside their own implicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_str(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "default",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, IsolationLevel::Default)
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "default" | "unspecified" => Ok(IsolationLevel::Default),
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("Invalid isolation level: '{}'", s)),
        }
    }
}

/// Definition of a transaction to start or join
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: IsolationLevel,
    /// Timeout in seconds; `None` means the manager default
    pub timeout_seconds: Option<u64>,
    pub read_only: bool,
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}
