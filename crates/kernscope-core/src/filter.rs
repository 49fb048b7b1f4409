//! Inode filter rules
//!
//! The rule set is written by the management side and only read by
//! handlers. A rule marks a filesystem object as IGNORE (drop anything
//! beneath it) or RECORD (report anything beneath it).

use kernscope_common::{ACTION_IGNORE, ACTION_RECORD};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::TableFull;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Ignore = ACTION_IGNORE,
    Record = ACTION_RECORD,
}

impl TryFrom<u8> for FilterAction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ACTION_IGNORE => Ok(FilterAction::Ignore),
            ACTION_RECORD => Ok(FilterAction::Record),
            other => Err(other),
        }
    }
}

/// Result of checking one path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// No rule, keep walking
    Keep,
    /// Abort the walk and the operation
    Ignore,
    /// Stop the walk and report the operation
    RecordAndStop,
}

/// What happens to an operation when no RECORD rule matched its path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterPolicy {
    /// Only operations under a RECORD rule are reported
    #[default]
    DefaultDeny,
    /// Every regular file is reported; rules are only used to suppress
    DefaultRecord,
}

impl FilterPolicy {
    pub fn reports(self, rule_matched: bool) -> bool {
        match self {
            FilterPolicy::DefaultDeny => rule_matched,
            FilterPolicy::DefaultRecord => true,
        }
    }
}

impl std::str::FromStr for FilterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default-deny" | "deny" => Ok(FilterPolicy::DefaultDeny),
            "default-record" | "record" => Ok(FilterPolicy::DefaultRecord),
            other => Err(format!("unknown filter policy: {}", other)),
        }
    }
}

/// Inode-keyed rule map with a fixed maximum size
#[derive(Debug)]
pub struct FilterRules {
    capacity: usize,
    rules: RwLock<HashMap<u64, FilterAction>>,
}

impl FilterRules {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn check(&self, ino: u64) -> FilterVerdict {
        match self.rules.read().get(&ino) {
            None => FilterVerdict::Keep,
            Some(FilterAction::Ignore) => FilterVerdict::Ignore,
            Some(FilterAction::Record) => FilterVerdict::RecordAndStop,
        }
    }

    pub fn get(&self, ino: u64) -> Option<FilterAction> {
        self.rules.read().get(&ino).copied()
    }

    pub fn set_rule(&self, ino: u64, action: FilterAction) -> Result<(), TableFull> {
        let mut rules = self.rules.write();
        if rules.len() >= self.capacity && !rules.contains_key(&ino) {
            return Err(TableFull {
                table: "filter_rules",
                capacity: self.capacity,
            });
        }
        rules.insert(ino, action);
        Ok(())
    }

    pub fn remove_rule(&self, ino: u64) -> Option<FilterAction> {
        self.rules.write().remove(&ino)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}
