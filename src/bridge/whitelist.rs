//! Whitelist Filter
//!
//! Optional allow-list of remote conversation IDs. An empty list lets every
//! conversation through.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WhitelistError {
    #[error("this conversation is not whitelisted")]
    NotWhitelisted,
}

/// Ordered allow-list. Insertion order is the order shown to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Whitelist {
    ids: Vec<String>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        let mut list = Self::new();
        for id in ids {
            list.add(id);
        }
        list
    }

    pub fn allows(&self, remote_id: &str) -> bool {
        self.ids.is_empty() || self.contains(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.ids.iter().any(|id| id == remote_id)
    }

    /// Returns `false` when the ID was already present.
    pub fn add(&mut self, remote_id: impl Into<String>) -> bool {
        let remote_id = remote_id.into();
        if self.contains(&remote_id) {
            return false;
        }
        self.ids.push(remote_id);
        true
    }

    pub fn remove(&mut self, remote_id: &str) -> Result<(), WhitelistError> {
        let before = self.ids.len();
        self.ids.retain(|id| id != remote_id);
        if self.ids.len() == before {
            Err(WhitelistError::NotWhitelisted)
        } else {
            Ok(())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}
