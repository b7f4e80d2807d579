//! Storage-class and request parameter surface.
//!
//! Storage classes hand the driver a flat string map; this module parses it
//! into a typed view and rejects malformed values before any appliance call.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Transport protocol a volume is exposed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nfs,
    Nvmeof,
    Iscsi,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Nfs => "nfs",
            Protocol::Nvmeof => "nvmeof",
            Protocol::Iscsi => "iscsi",
        }
    }

    /// Whether the protocol exposes a block device (ZVOL-backed).
    pub fn is_block(&self) -> bool {
        matches!(self, Protocol::Nvmeof | Protocol::Iscsi)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nfs" => Ok(Protocol::Nfs),
            "nvmeof" | "nvme" => Ok(Protocol::Nvmeof),
            "iscsi" => Ok(Protocol::Iscsi),
            _ => Err(ControllerError::InvalidArgument(format!(
                "unknown protocol '{}': expected nfs, nvmeof or iscsi",
                s
            ))),
        }
    }
}

/// What Delete does with the backing dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteStrategy {
    #[default]
    Delete,
    Retain,
}

impl DeleteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteStrategy::Delete => "delete",
            DeleteStrategy::Retain => "retain",
        }
    }
}

impl FromStr for DeleteStrategy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "delete" => Ok(DeleteStrategy::Delete),
            "retain" => Ok(DeleteStrategy::Retain),
            _ => Err(ControllerError::InvalidArgument(format!(
                "unknown delete strategy '{}': expected delete or retain",
                s
            ))),
        }
    }
}

/// Typed view of the recognized storage-class parameter keys.
#[derive(Debug, Clone)]
pub struct StorageClassParams {
    pub protocol: Protocol,
    /// Appliance address the node plugin mounts from.
    pub server: String,
    pub pool: String,
    /// Dataset segment under the pool that owns all volumes of this class.
    pub parent_dataset: String,
    pub name_template: Option<String>,
    pub name_prefix: String,
    pub name_suffix: String,
    pub delete_strategy: DeleteStrategy,
    pub mark_adoptable: bool,
    pub adopt_existing: bool,
    pub fs_type: Option<String>,
    pub encryption: bool,
    pub encryption_algorithm: Option<String>,
    pub encryption_generate_key: bool,
    pub compression: Option<String>,
    pub atime: Option<String>,
    pub recordsize: Option<String>,
    pub volblocksize: Option<String>,
    /// NVMe-oF transport filter for port selection (e.g. `TCP`).
    pub nvmeof_transport: Option<String>,
    /// Explicit NVMe-oF port ids to bind; empty means every port matching
    /// the transport filter.
    pub nvmeof_ports: Vec<i64>,
    pub iscsi_port: Option<u32>,
}

impl StorageClassParams {
    /// Parse the flat storage-class map, rejecting malformed values.
    pub fn from_map(parameters: &HashMap<String, String>) -> Result<Self> {
        let protocol: Protocol = required(parameters, "protocol")?.parse()?;
        let server = required(parameters, "server")?.to_string();
        let pool = required(parameters, "pool")?.to_string();

        let delete_strategy = match parameters.get("deleteStrategy") {
            Some(value) => value.parse()?,
            None => DeleteStrategy::default(),
        };

        let nvmeof_ports = match parameters.get("port").filter(|_| protocol == Protocol::Nvmeof) {
            Some(list) => parse_port_list(list)?,
            None => Vec::new(),
        };
        let iscsi_port = match parameters.get("port").filter(|_| protocol == Protocol::Iscsi) {
            Some(value) => Some(value.parse::<u32>().map_err(|_| {
                ControllerError::InvalidArgument(format!("invalid iSCSI port '{}'", value))
            })?),
            None => None,
        };

        Ok(Self {
            protocol,
            server,
            pool,
            parent_dataset: parameters
                .get("parentDataset")
                .cloned()
                .unwrap_or_default(),
            name_template: parameters.get("nameTemplate").cloned(),
            name_prefix: parameters.get("namePrefix").cloned().unwrap_or_default(),
            name_suffix: parameters.get("nameSuffix").cloned().unwrap_or_default(),
            delete_strategy,
            mark_adoptable: parse_bool(parameters, "markAdoptable")?,
            adopt_existing: parse_bool(parameters, "adoptExisting")?,
            fs_type: parameters.get("fsType").cloned(),
            encryption: parse_bool(parameters, "encryption")?,
            encryption_algorithm: parameters.get("encryptionAlgorithm").cloned(),
            encryption_generate_key: parse_bool(parameters, "encryptionGenerateKey")?,
            compression: parameters.get("zfs.compression").cloned(),
            atime: parameters.get("zfs.atime").cloned(),
            recordsize: parameters.get("zfs.recordsize").cloned(),
            volblocksize: parameters.get("zfs.volblocksize").cloned(),
            nvmeof_transport: parameters.get("transport").cloned(),
            nvmeof_ports,
            iscsi_port,
        })
    }

    /// Full dataset path that owns every volume of this class.
    pub fn parent_path(&self) -> String {
        if self.parent_dataset.is_empty() {
            self.pool.clone()
        } else {
            format!("{}/{}", self.pool, self.parent_dataset)
        }
    }
}

fn required<'a>(parameters: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    parameters
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ControllerError::InvalidArgument(format!("storage class parameter '{}' is required", key))
        })
}

/// Parse a `"true"`/`"false"` class parameter; absent means false.
pub fn parse_class_bool(parameters: &HashMap<String, String>, key: &str) -> Result<bool> {
    parse_bool(parameters, key)
}

fn parse_bool(parameters: &HashMap<String, String>, key: &str) -> Result<bool> {
    match parameters.get(key).map(String::as_str) {
        None | Some("") | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(ControllerError::InvalidArgument(format!(
            "parameter '{}' must be 'true' or 'false', got '{}'",
            key, other
        ))),
    }
}

fn parse_port_list(list: &str) -> Result<Vec<i64>> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<i64>().map_err(|_| {
                ControllerError::InvalidArgument(format!("invalid NVMe-oF port id '{}'", p))
            })
        })
        .collect()
}

/// Whether the volume is consumed as a raw block device or a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

/// Content source of a Create request.
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// CSI snapshot id (attached `dataset@name` or detached dataset path).
    Snapshot(String),
    /// Volume handle of an existing volume to clone.
    Volume(String),
}

/// The provisioning request surface handed down from the orchestrator.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// CSI volume name; unique per storage-class parent.
    pub name: String,
    pub required_bytes: u64,
    pub limit_bytes: Option<u64>,
    pub mode: VolumeMode,
    pub parameters: HashMap<String, String>,
    pub content_source: Option<ContentSource>,
    pub pvc_name: Option<String>,
    pub pvc_namespace: Option<String>,
}

impl CreateRequest {
    /// Validate the size bounds and protocol/mode pairing.
    pub fn validate(&self, params: &StorageClassParams) -> Result<()> {
        if self.name.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "volume name is required".to_string(),
            ));
        }
        if self.required_bytes == 0 {
            return Err(ControllerError::InvalidArgument(
                "requested capacity must be positive".to_string(),
            ));
        }
        if let Some(limit) = self.limit_bytes {
            if limit < self.required_bytes {
                return Err(ControllerError::InvalidArgument(format!(
                    "capacity limit {} is below required {}",
                    limit, self.required_bytes
                )));
            }
        }
        if self.mode == VolumeMode::Block && params.protocol == Protocol::Nfs {
            return Err(ControllerError::InvalidArgument(
                "block volume mode is not supported over nfs".to_string(),
            ));
        }
        Ok(())
    }
}
