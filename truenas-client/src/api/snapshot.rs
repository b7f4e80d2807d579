//! ZFS snapshots and clones: `zfs.snapshot.*` methods.

use serde::Deserialize;
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// A ZFS snapshot record, identified by `dataset@name`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZfsSnapshot {
    /// Full id, `<dataset>@<name>`.
    pub id: String,
    pub dataset: String,
    pub snapshot_name: String,
}

impl ZfsSnapshot {
    /// Compose the `dataset@name` id.
    pub fn full_name(dataset: &str, name: &str) -> String {
        format!("{}@{}", dataset, name)
    }
}

impl Client {
    pub async fn snapshot_create(&self, dataset: &str, name: &str) -> Result<ZfsSnapshot> {
        self.call(
            "zfs.snapshot.create",
            vec![json!({ "dataset": dataset, "name": name })],
        )
        .await
        .map_err(|e| e.for_method("zfs.snapshot.create"))
    }

    /// Destroy `<dataset>@<name>` by full id.
    pub async fn snapshot_delete(&self, id: &str) -> Result<()> {
        self.call::<bool>("zfs.snapshot.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("zfs.snapshot.delete"))?;
        Ok(())
    }

    /// All snapshots of one dataset.
    pub async fn snapshot_query(&self, dataset: &str) -> Result<Vec<ZfsSnapshot>> {
        self.call(
            "zfs.snapshot.query",
            vec![json!(vec![filter("dataset", "=", dataset)])],
        )
        .await
        .map_err(|e| e.for_method("zfs.snapshot.query"))
    }

    /// One snapshot by full `dataset@name` id; `None` when absent.
    pub async fn snapshot_get(&self, id: &str) -> Result<Option<ZfsSnapshot>> {
        let mut found: Vec<ZfsSnapshot> = self
            .call("zfs.snapshot.query", vec![json!(vec![filter("id", "=", id)])])
            .await
            .map_err(|e| e.for_method("zfs.snapshot.query"))?;
        Ok(found.drain(..).next())
    }

    /// Clone a snapshot into a new dataset path.
    pub async fn snapshot_clone(&self, snapshot: &str, dataset_dst: &str) -> Result<()> {
        self.call::<bool>(
            "zfs.snapshot.clone",
            vec![json!({ "snapshot": snapshot, "dataset_dst": dataset_dst })],
        )
        .await
        .map_err(|e| e.for_method("zfs.snapshot.clone"))?;
        Ok(())
    }
}
