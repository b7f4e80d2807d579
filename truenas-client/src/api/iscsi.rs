//! iSCSI target management: `iscsi.target.*`, `iscsi.extent.*`,
//! `iscsi.targetextent.*` methods.

use serde::Deserialize;
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// An iSCSI target. `name` is the IQN suffix; the appliance prepends its
/// configured base name to form the full IQN.
#[derive(Debug, Clone, Deserialize)]
pub struct IscsiTarget {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// A ZVOL-backed extent.
#[derive(Debug, Clone, Deserialize)]
pub struct IscsiExtent {
    pub id: i64,
    pub name: String,
    /// Backing disk, `zvol/<dataset-path>`.
    pub disk: String,
}

/// The association placing an extent behind a target at a LUN.
#[derive(Debug, Clone, Deserialize)]
pub struct IscsiTargetExtent {
    pub id: i64,
    pub target: i64,
    pub extent: i64,
    pub lunid: u32,
}

impl Client {
    pub async fn iscsi_target_create(&self, name: &str, alias: Option<&str>) -> Result<IscsiTarget> {
        self.call(
            "iscsi.target.create",
            vec![json!({ "name": name, "alias": alias })],
        )
        .await
        .map_err(|e| e.for_method("iscsi.target.create"))
    }

    pub async fn iscsi_target_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("iscsi.target.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("iscsi.target.delete"))?;
        Ok(())
    }

    pub async fn iscsi_target_find_by_name(&self, name: &str) -> Result<Option<IscsiTarget>> {
        let mut found: Vec<IscsiTarget> = self
            .call(
                "iscsi.target.query",
                vec![json!(vec![filter("name", "=", name)])],
            )
            .await
            .map_err(|e| e.for_method("iscsi.target.query"))?;
        Ok(found.drain(..).next())
    }

    /// Create a DISK extent backed by a ZVOL dataset path.
    pub async fn iscsi_extent_create(&self, name: &str, dataset: &str) -> Result<IscsiExtent> {
        self.call(
            "iscsi.extent.create",
            vec![json!({
                "name": name,
                "type": "DISK",
                "disk": format!("zvol/{}", dataset),
            })],
        )
        .await
        .map_err(|e| e.for_method("iscsi.extent.create"))
    }

    pub async fn iscsi_extent_delete(&self, id: i64) -> Result<()> {
        // `remove=false`: never let extent deletion touch the backing ZVOL.
        self.call::<bool>(
            "iscsi.extent.delete",
            vec![json!(id), json!(false), json!(true)],
        )
        .await
        .map_err(|e| e.for_method("iscsi.extent.delete"))?;
        Ok(())
    }

    pub async fn iscsi_extent_find_by_name(&self, name: &str) -> Result<Option<IscsiExtent>> {
        let mut found: Vec<IscsiExtent> = self
            .call(
                "iscsi.extent.query",
                vec![json!(vec![filter("name", "=", name)])],
            )
            .await
            .map_err(|e| e.for_method("iscsi.extent.query"))?;
        Ok(found.drain(..).next())
    }

    pub async fn iscsi_targetextent_create(
        &self,
        target: i64,
        extent: i64,
    ) -> Result<IscsiTargetExtent> {
        self.call(
            "iscsi.targetextent.create",
            vec![json!({ "target": target, "extent": extent, "lunid": 0 })],
        )
        .await
        .map_err(|e| e.for_method("iscsi.targetextent.create"))
    }

    pub async fn iscsi_targetextent_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("iscsi.targetextent.delete", vec![json!(id), json!(true)])
            .await
            .map_err(|e| e.for_method("iscsi.targetextent.delete"))?;
        Ok(())
    }

    pub async fn iscsi_targetextent_query_by_target(
        &self,
        target: i64,
    ) -> Result<Vec<IscsiTargetExtent>> {
        self.call(
            "iscsi.targetextent.query",
            vec![json!(vec![filter("target", "=", target)])],
        )
        .await
        .map_err(|e| e.for_method("iscsi.targetextent.query"))
    }
}
