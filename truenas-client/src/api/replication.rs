//! One-time replication (`zfs send | zfs recv`): `replication.run_onetime`.

use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::rpc::Client;

/// Body for `replication.run_onetime`. The appliance materializes
/// `<source_dataset>@<source_snapshot>` into `target_dataset` and returns
/// an asynchronous job id to poll.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationRunOnetimeParams {
    pub source_dataset: String,
    pub source_snapshot: String,
    pub target_dataset: String,
    /// Transport mode; `LOCAL` for same-appliance send/recv.
    pub transport: String,
    pub recursive: bool,
}

impl ReplicationRunOnetimeParams {
    /// Same-appliance replication of one snapshot.
    pub fn local(source_dataset: &str, source_snapshot: &str, target_dataset: &str) -> Self {
        Self {
            source_dataset: source_dataset.to_string(),
            source_snapshot: source_snapshot.to_string(),
            target_dataset: target_dataset.to_string(),
            transport: "LOCAL".to_string(),
            recursive: false,
        }
    }
}

impl Client {
    /// Kick off a one-time replication; returns the job id.
    pub async fn replication_run_onetime(
        &self,
        params: ReplicationRunOnetimeParams,
    ) -> Result<i64> {
        self.call("replication.run_onetime", vec![json!(params)])
            .await
            .map_err(|e| e.for_method("replication.run_onetime"))
    }
}
