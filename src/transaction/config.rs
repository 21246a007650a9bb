//! Transaction configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::isolation::IsolationLevel;

/// What happens when a wrapped computation is dropped before it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Roll back the abandoned scope and everything nested in it.
    #[default]
    Rollback,
    /// Leave the scope open; the caller must commit or roll back.
    Ignore,
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelPolicy::Rollback => write!(f, "rollback"),
            CancelPolicy::Ignore => write!(f, "ignore"),
        }
    }
}

impl std::str::FromStr for CancelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rollback" => Ok(CancelPolicy::Rollback),
            "ignore" => Ok(CancelPolicy::Ignore),
            _ => Err(format!("unknown cancel policy: {}", s)),
        }
    }
}

/// Transaction configuration options.
///
/// Deserializes from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Hand wrapped computations a context carrying the transaction.
    pub auto_bind: bool,
    /// Isolation level applied when the connection is acquired.
    /// `None` keeps the driver's default.
    pub isolation: Option<IsolationLevel>,
    /// Behavior for wrapped computations that are dropped mid-flight.
    pub cancel_policy: CancelPolicy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            auto_bind: true,
            isolation: None,
            cancel_policy: CancelPolicy::default(),
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set auto_bind flag.
    pub fn auto_bind(mut self, value: bool) -> Self {
        self.auto_bind = value;
        self
    }

    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Set the cancellation policy.
    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }
}
