// Copyright 2024 Blobmap Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Administrative partition overrides
//!
//! When partition override is enabled the cluster map reads partition state
//! and class from a [`PartitionOverrideStore`] and ignores seal signals from
//! replicas.

use crate::types::{PartitionId, PartitionState};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Override record for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOverride {
    pub state: PartitionState,

    /// Replaces the layout class when set
    #[serde(default)]
    pub class: Option<String>,
}

/// Read accessor over the external override store
pub trait PartitionOverrideStore: Send + Sync + fmt::Debug {
    fn partition_override(&self, id: PartitionId) -> Option<PartitionOverride>;
}

/// Override store held in memory
#[derive(Debug, Default)]
pub struct InMemoryOverrideStore {
    entries: RwLock<HashMap<PartitionId, PartitionOverride>>,
}

impl InMemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: PartitionId, entry: PartitionOverride) {
        self.entries.write().insert(id, entry);
    }

    pub fn remove(&self, id: PartitionId) -> Option<PartitionOverride> {
        self.entries.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PartitionOverrideStore for InMemoryOverrideStore {
    fn partition_override(&self, id: PartitionId) -> Option<PartitionOverride> {
        self.entries.read().get(&id).cloned()
    }
}

impl FromIterator<(PartitionId, PartitionOverride)> for InMemoryOverrideStore {
    fn from_iter<T: IntoIterator<Item = (PartitionId, PartitionOverride)>>(iter: T) -> Self {
        Self {
            entries: RwLock::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_remove_override() {
        let store = InMemoryOverrideStore::new();
        assert!(store.is_empty());
        assert_eq!(store.partition_override(PartitionId(1)), None);

        let entry = PartitionOverride {
            state: PartitionState::ReadOnly,
            class: None,
        };
        store.set(PartitionId(1), entry.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.partition_override(PartitionId(1)), Some(entry.clone()));

        assert_eq!(store.remove(PartitionId(1)), Some(entry));
        assert!(store.is_empty());
    }
}
