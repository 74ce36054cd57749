//! Imports delegations captured at subscribe time.
//!
//! The file is a JSON object keyed by subscription id. Each value is either
//! the delegation object itself or a string holding its serialized form.
//! Contents are stored as-is; validation happens when a redemption runs.

use crate::domain::job::SubscriptionId;
use crate::domain::ports::DelegationStore;
use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub fn parse_delegations(bytes: &[u8]) -> Result<BTreeMap<SubscriptionId, Vec<u8>>> {
    let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)?;

    entries
        .into_iter()
        .map(|(id, value)| {
            let serialized = match value {
                serde_json::Value::String(raw) => raw.into_bytes(),
                serde_json::Value::Object(_) => serde_json::to_vec(&value)?,
                other => {
                    return Err(PipelineError::ValidationError(format!(
                        "delegation for {id} must be an object or a string, got {other}"
                    )));
                }
            };
            Ok((SubscriptionId::new(id), serialized))
        })
        .collect()
}

/// Loads the file at `path` into `store`, returning how many were stored.
pub async fn import_delegations(path: &Path, store: &dyn DelegationStore) -> Result<usize> {
    let bytes = tokio::fs::read(path).await?;
    let delegations = parse_delegations(&bytes)?;
    let count = delegations.len();

    for (subscription_id, delegation) in delegations {
        store.store_delegation(&subscription_id, delegation).await?;
    }

    info!(count, path = %path.display(), "delegations imported");
    Ok(count)
}
