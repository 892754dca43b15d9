// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeSet;

use super::ResultBuilder;
use crate::error::{Rejection, Result};
use crate::record::{DeployedProcess, DeploymentIntent, DeploymentRecord, Record, RecordValue};

/// Assign keys and versions to pre-parsed process definitions.
pub(super) fn create(b: &mut ResultBuilder<'_>, command: &Record, value: &DeploymentRecord) -> Result<()> {
    if value.processes.is_empty() {
        b.reject(command, Rejection::bad_value("deployment contains no processes"));
        return Ok(());
    }
    let mut process_ids = BTreeSet::new();
    for process in &value.processes {
        if let Err(reason) = process.definition.validate() {
            b.reject(command, Rejection::bad_value(reason));
            return Ok(());
        }
        if !process_ids.insert(process.definition.process_id.as_str()) {
            b.reject(
                command,
                Rejection::bad_value(format!(
                    "process '{}' is deployed more than once in the same deployment",
                    process.definition.process_id
                )),
            );
            return Ok(());
        }
    }

    let key = b.next_key();
    let mut processes = Vec::with_capacity(value.processes.len());
    for process in &value.processes {
        let version = b.state().processes.next_version(&process.definition.process_id);
        processes.push(DeployedProcess {
            process_key: b.next_key(),
            version,
            definition: process.definition.clone(),
        });
    }

    let created = b.event(
        key,
        RecordValue::Deployment {
            intent: DeploymentIntent::Created,
            value: DeploymentRecord { processes },
        },
    );
    b.respond(command, created);
    Ok(())
}
