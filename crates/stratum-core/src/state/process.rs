// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployed process definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::DeployedProcess;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    processes: BTreeMap<i64, DeployedProcess>,
    /// process id -> version -> process key
    versions: BTreeMap<String, BTreeMap<i32, i64>>,
}

impl ProcessState {
    pub fn put(&mut self, process: DeployedProcess) {
        self.versions
            .entry(process.definition.process_id.clone())
            .or_default()
            .insert(process.version, process.process_key);
        self.processes.insert(process.process_key, process);
    }

    pub fn by_key(&self, process_key: i64) -> Option<&DeployedProcess> {
        self.processes.get(&process_key)
    }

    pub fn by_id_and_version(&self, process_id: &str, version: i32) -> Option<&DeployedProcess> {
        let key = self.versions.get(process_id)?.get(&version)?;
        self.processes.get(key)
    }

    pub fn latest(&self, process_id: &str) -> Option<&DeployedProcess> {
        let (_, key) = self.versions.get(process_id)?.last_key_value()?;
        self.processes.get(key)
    }

    /// Version the next deployment of `process_id` receives.
    pub fn next_version(&self, process_id: &str) -> i32 {
        self.versions
            .get(process_id)
            .and_then(|versions| versions.last_key_value())
            .map_or(1, |(version, _)| version + 1)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
