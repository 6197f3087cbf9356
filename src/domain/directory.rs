//! Group Directory
//!
//! Membership lookup for group targets. Group CRUD lives outside this
//! service; the relay only asks "who is in this group".

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Member user ids of a group, or `None` if the group is unknown.
    async fn members(&self, group_id: &str) -> Option<Vec<String>>;
}

/// Directory kept in process memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct InMemoryGroupDirectory {
    groups: DashMap<String, Vec<String>>,
}

impl InMemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(groups: HashMap<String, Vec<String>>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }

    /// Add a user to a group, creating the group if needed.
    pub fn join(&self, group_id: &str, user_id: &str) {
        let mut members = self.groups.entry(group_id.to_string()).or_default();
        if !members.iter().any(|m| m == user_id) {
            members.push(user_id.to_string());
        }
    }
}

#[async_trait]
impl GroupDirectory for InMemoryGroupDirectory {
    async fn members(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups.get(group_id).map(|m| m.clone())
    }
}
