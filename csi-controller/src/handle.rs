//! Volume and snapshot handle formats.
//!
//! The handle is the opaque string the orchestrator stores and passes back;
//! it carries everything the node plugin needs to locate the volume without
//! re-querying the appliance: `<protocol>#<server>#<dataset-path>[#<extra>]`
//! where extra is the export path (NFS), the subsystem NQN (NVMe-oF) or the
//! target IQN (iSCSI).

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::{ControllerError, Result};
use crate::params::Protocol;

/// Parsed volume handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub protocol: Protocol,
    pub server: String,
    pub dataset: String,
    pub extra: Option<String>,
}

impl VolumeHandle {
    pub fn new(protocol: Protocol, server: &str, dataset: &str, extra: Option<String>) -> Self {
        Self {
            protocol,
            server: server.to_string(),
            dataset: dataset.to_string(),
            extra,
        }
    }

    /// Parse a handle string, validating all mandatory segments.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, '#');
        let protocol = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid(s))?
            .parse::<Protocol>()
            .map_err(|_| invalid(s))?;
        let server = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| invalid(s))?;
        let dataset = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| invalid(s))?;
        let extra = parts.next().map(str::to_string);
        Ok(Self {
            protocol,
            server: server.to_string(),
            dataset: dataset.to_string(),
            extra,
        })
    }
}

fn invalid(handle: &str) -> ControllerError {
    ControllerError::InvalidArgument(format!("malformed volume handle '{}'", handle))
}

impl Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.protocol, self.server, self.dataset)?;
        if let Some(extra) = &self.extra {
            write!(f, "#{}", extra)?;
        }
        Ok(())
    }
}

impl FromStr for VolumeHandle {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parsed snapshot handle. Attached snapshots are identified by
/// `dataset@name`; detached snapshots by the path of their independent
/// dataset (which never contains `@`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotHandle {
    Attached { dataset: String, name: String },
    Detached { dataset: String },
}

impl SnapshotHandle {
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "snapshot id is required".to_string(),
            ));
        }
        match s.split_once('@') {
            Some((dataset, name)) if !dataset.is_empty() && !name.is_empty() => {
                Ok(SnapshotHandle::Attached {
                    dataset: dataset.to_string(),
                    name: name.to_string(),
                })
            }
            Some(_) => Err(ControllerError::InvalidArgument(format!(
                "malformed snapshot id '{}'",
                s
            ))),
            None => Ok(SnapshotHandle::Detached {
                dataset: s.to_string(),
            }),
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, SnapshotHandle::Detached { .. })
    }
}

impl Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotHandle::Attached { dataset, name } => write!(f, "{}@{}", dataset, name),
            SnapshotHandle::Detached { dataset } => write!(f, "{}", dataset),
        }
    }
}

impl FromStr for SnapshotHandle {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
