//! NVMe-oF target management: `nvmet.*` methods.
//!
//! A subsystem (keyed by NQN) exposes namespaces backed by ZVOL device
//! paths and becomes reachable once bound to one or more listening ports.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// An NVMe-oF subsystem record.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmetSubsystem {
    pub id: i64,
    /// Short name the subsystem was created with.
    pub name: String,
    /// Full NVMe Qualified Name.
    pub subnqn: String,
    #[serde(default)]
    pub allow_any_host: bool,
}

/// A namespace exposing one ZVOL inside a subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmetNamespace {
    pub id: i64,
    pub subsys_id: i64,
    pub nsid: u32,
    pub device_path: String,
}

/// A listening port (transport + address) on the appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmetPort {
    pub id: i64,
    pub addr_trtype: String,
    pub addr_traddr: String,
    pub addr_trsvcid: u32,
}

/// A port-to-subsystem binding.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmetPortSubsys {
    pub id: i64,
    pub port_id: i64,
    pub subsys_id: i64,
}

/// Body for `nvmet.subsys.create`.
#[derive(Debug, Clone, Serialize)]
struct SubsysCreateParams<'a> {
    name: &'a str,
    subnqn: &'a str,
    allow_any_host: bool,
}

impl Client {
    pub async fn nvmet_subsys_create(
        &self,
        name: &str,
        subnqn: &str,
        allow_any_host: bool,
    ) -> Result<NvmetSubsystem> {
        let params = SubsysCreateParams {
            name,
            subnqn,
            allow_any_host,
        };
        self.call("nvmet.subsys.create", vec![json!(params)])
            .await
            .map_err(|e| e.for_method("nvmet.subsys.create"))
    }

    pub async fn nvmet_subsys_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("nvmet.subsys.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("nvmet.subsys.delete"))?;
        Ok(())
    }

    pub async fn nvmet_subsys_find_by_nqn(&self, subnqn: &str) -> Result<Option<NvmetSubsystem>> {
        let mut found: Vec<NvmetSubsystem> = self
            .call(
                "nvmet.subsys.query",
                vec![json!(vec![filter("subnqn", "=", subnqn)])],
            )
            .await
            .map_err(|e| e.for_method("nvmet.subsys.query"))?;
        Ok(found.drain(..).next())
    }

    /// Expose a ZVOL device path as a namespace of the subsystem.
    pub async fn nvmet_namespace_create(
        &self,
        subsys_id: i64,
        device_path: &str,
    ) -> Result<NvmetNamespace> {
        self.call(
            "nvmet.namespace.create",
            vec![json!({
                "subsys_id": subsys_id,
                "device_type": "ZVOL",
                "device_path": device_path,
            })],
        )
        .await
        .map_err(|e| e.for_method("nvmet.namespace.create"))
    }

    pub async fn nvmet_namespace_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("nvmet.namespace.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("nvmet.namespace.delete"))?;
        Ok(())
    }

    pub async fn nvmet_namespace_query(&self, subsys_id: i64) -> Result<Vec<NvmetNamespace>> {
        self.call(
            "nvmet.namespace.query",
            vec![json!(vec![filter("subsys_id", "=", subsys_id)])],
        )
        .await
        .map_err(|e| e.for_method("nvmet.namespace.query"))
    }

    /// All listening ports configured on the appliance.
    pub async fn nvmet_port_query(&self) -> Result<Vec<NvmetPort>> {
        self.call("nvmet.port.query", vec![json!(Vec::<serde_json::Value>::new())])
            .await
            .map_err(|e| e.for_method("nvmet.port.query"))
    }

    pub async fn nvmet_port_subsys_create(
        &self,
        port_id: i64,
        subsys_id: i64,
    ) -> Result<NvmetPortSubsys> {
        self.call(
            "nvmet.port_subsys.create",
            vec![json!({ "port_id": port_id, "subsys_id": subsys_id })],
        )
        .await
        .map_err(|e| e.for_method("nvmet.port_subsys.create"))
    }

    pub async fn nvmet_port_subsys_delete(&self, id: i64) -> Result<()> {
        self.call::<bool>("nvmet.port_subsys.delete", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("nvmet.port_subsys.delete"))?;
        Ok(())
    }

    pub async fn nvmet_port_subsys_query(&self, subsys_id: i64) -> Result<Vec<NvmetPortSubsys>> {
        self.call(
            "nvmet.port_subsys.query",
            vec![json!(vec![filter("subsys_id", "=", subsys_id)])],
        )
        .await
        .map_err(|e| e.for_method("nvmet.port_subsys.query"))
    }
}
