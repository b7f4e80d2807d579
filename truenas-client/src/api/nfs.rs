//! NFS exports: `sharing.nfs.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// An NFS export record, keyed by filesystem path.
#[derive(Debug, Clone, Deserialize)]
pub struct NfsShare {
    pub id: i64,
    pub path: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Body for `sharing.nfs.create`.
#[derive(Debug, Clone, Serialize)]
pub struct NfsShareCreateParams {
    pub path: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub comment: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub hosts: Vec<String>,
}

impl NfsShareCreateParams {
    pub fn for_path(path: &str, comment: &str) -> Self {
        Self {
            path: path.to_string(),
            enabled: true,
            comment: comment.to_string(),
            networks: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl Client {
    pub async fn nfs_share_create(&self, params: NfsShareCreateParams) -> Result<NfsShare> {
        self.call("sharing.nfs.create", vec![json!(params)])
            .await
            .map_err(|e| e.for_method("sharing.nfs.create"))
    }

    pub async fn nfs_share_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("sharing.nfs.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("sharing.nfs.delete"))?;
        Ok(())
    }

    /// Find the export for a filesystem path; `None` when not shared.
    pub async fn nfs_share_find_by_path(&self, path: &str) -> Result<Option<NfsShare>> {
        let mut found: Vec<NfsShare> = self
            .call("sharing.nfs.query", vec![json!(vec![filter("path", "=", path)])])
            .await
            .map_err(|e| e.for_method("sharing.nfs.query"))?;
        Ok(found.drain(..).next())
    }
}
