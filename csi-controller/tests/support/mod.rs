//! In-process mock appliance.
//!
//! A WebSocket JSON-RPC server with an in-memory resource store mimicking
//! the appliance semantics the controller depends on: datasets with user
//! properties, snapshots and clones with origin tracking, NFS shares,
//! NVMe-oF subsystems, iSCSI targets, one-time replication jobs, and the
//! structured error shape (`ENOENT`, `EEXIST`, `EBUSY`).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct DatasetRec {
    pub id: String,
    pub kind: String,
    pub volsize: Option<u64>,
    pub refquota: Option<u64>,
    pub origin: Option<String>,
    pub user_properties: HashMap<String, String>,
}

impl DatasetRec {
    fn filesystem(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: "FILESYSTEM".to_string(),
            volsize: None,
            refquota: None,
            origin: None,
            user_properties: HashMap::new(),
        }
    }

    fn to_json(&self) -> Value {
        let mountpoint = if self.kind == "FILESYSTEM" {
            Some(format!("/mnt/{}", self.id))
        } else {
            None
        };
        json!({
            "id": self.id,
            "type": self.kind,
            "volsize": self.volsize,
            "origin": self.origin,
            "mountpoint": mountpoint,
            "user_properties": self.user_properties,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRec {
    pub id: String,
    pub dataset: String,
    pub name: String,
}

impl SnapshotRec {
    fn to_json(&self) -> Value {
        json!({"id": self.id, "dataset": self.dataset, "snapshot_name": self.name})
    }
}

#[derive(Debug, Clone)]
pub struct JobRec {
    pub id: i64,
    pub final_state: String,
    pub error: Option<String>,
    /// Polls left before the job reports its final state.
    pub polls_remaining: u32,
}

#[derive(Debug, Default)]
pub struct ApplianceState {
    next_id: i64,
    pub pools: Vec<(String, u64, u64)>,
    pub datasets: BTreeMap<String, DatasetRec>,
    pub snapshots: BTreeMap<String, SnapshotRec>,
    pub nfs_shares: BTreeMap<i64, Value>,
    pub nvmet_subsystems: BTreeMap<i64, Value>,
    pub nvmet_namespaces: BTreeMap<i64, Value>,
    pub nvmet_ports: BTreeMap<i64, Value>,
    pub nvmet_port_subsys: BTreeMap<i64, Value>,
    pub iscsi_targets: BTreeMap<i64, Value>,
    pub iscsi_extents: BTreeMap<i64, Value>,
    pub iscsi_targetextents: BTreeMap<i64, Value>,
    pub jobs: BTreeMap<i64, JobRec>,
    /// When set, one-time replication fails with this error text.
    pub fail_replication: Option<String>,
    /// When set, one-time replication ends in ABORTED.
    pub abort_replication: bool,
}

impl ApplianceState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn seeded() -> Self {
        let mut state = Self::default();
        state.pools.push(("tank".to_string(), 1 << 40, 1 << 30));
        state
            .datasets
            .insert("tank".to_string(), DatasetRec::filesystem("tank"));
        state
            .datasets
            .insert("tank/csi".to_string(), DatasetRec::filesystem("tank/csi"));
        let port_id = state.allocate_id();
        state.nvmet_ports.insert(
            port_id,
            json!({"id": port_id, "addr_trtype": "TCP", "addr_traddr": "192.0.2.10", "addr_trsvcid": 4420}),
        );
        state
    }
}

type MockResult = Result<Value, (&'static str, String)>;

fn enoent(reason: String) -> (&'static str, String) {
    ("ENOENT", reason)
}

fn eexist(reason: String) -> (&'static str, String) {
    ("EEXIST", reason)
}

fn ebusy(reason: String) -> (&'static str, String) {
    ("EBUSY", reason)
}

/// Evaluate the appliance's `[field, op, value]` filter convention.
fn matches_filters(record: &Value, filters: &Value) -> bool {
    let Some(filters) = filters.as_array() else {
        return true;
    };
    filters.iter().all(|f| {
        let (Some(field), Some(op)) = (f[0].as_str(), f[1].as_str()) else {
            return false;
        };
        let expected = &f[2];
        let actual = &record[field];
        match op {
            "=" => actual == expected,
            "^" => actual
                .as_str()
                .zip(expected.as_str())
                .is_some_and(|(a, p)| a.starts_with(p)),
            _ => false,
        }
    })
}

fn query_map(records: &BTreeMap<i64, Value>, filters: &Value) -> Value {
    Value::Array(
        records
            .values()
            .filter(|r| matches_filters(r, filters))
            .cloned()
            .collect(),
    )
}

fn dispatch(state: &Arc<Mutex<ApplianceState>>, method: &str, params: &Value) -> MockResult {
    let mut state = state.lock().unwrap();
    let arg0 = params.get(0).cloned().unwrap_or(Value::Null);
    let arg1 = params.get(1).cloned().unwrap_or(Value::Null);

    match method {
        "auth.login_with_api_key" => Ok(json!(true)),

        "pool.query" => {
            let records: Vec<Value> = state
                .pools
                .iter()
                .enumerate()
                .map(|(i, (name, free, allocated))| {
                    json!({"id": i as i64 + 1, "name": name, "free": free, "allocated": allocated})
                })
                .collect();
            Ok(Value::Array(
                records
                    .into_iter()
                    .filter(|r| matches_filters(r, &arg0))
                    .collect(),
            ))
        }

        "pool.dataset.create" => {
            let name = arg0["name"].as_str().unwrap_or_default().to_string();
            if state.datasets.contains_key(&name) {
                return Err(eexist(format!("dataset {} already exists", name)));
            }
            if let Some((parent, _)) = name.rsplit_once('/') {
                if !state.datasets.contains_key(parent) {
                    return Err(enoent(format!("parent dataset {} does not exist", parent)));
                }
            }
            let user_properties = arg0["user_properties"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let record = DatasetRec {
                id: name.clone(),
                kind: arg0["type"].as_str().unwrap_or("FILESYSTEM").to_string(),
                volsize: arg0["volsize"].as_u64(),
                refquota: arg0["refquota"].as_u64(),
                origin: None,
                user_properties,
            };
            let reply = record.to_json();
            state.datasets.insert(name, record);
            Ok(reply)
        }

        "pool.dataset.update" => {
            let id = arg0.as_str().unwrap_or_default().to_string();
            let Some(record) = state.datasets.get_mut(&id) else {
                return Err(enoent(format!("dataset {} does not exist", id)));
            };
            if let Some(volsize) = arg1["volsize"].as_u64() {
                record.volsize = Some(volsize);
            }
            if let Some(refquota) = arg1["refquota"].as_u64() {
                record.refquota = Some(refquota);
            }
            if let Some(updates) = arg1["user_properties_update"].as_array() {
                for update in updates {
                    let key = update["key"].as_str().unwrap_or_default().to_string();
                    if update["remove"].as_bool().unwrap_or(false) {
                        record.user_properties.remove(&key);
                    } else if let Some(value) = update["value"].as_str() {
                        record.user_properties.insert(key, value.to_string());
                    }
                }
            }
            Ok(record.to_json())
        }

        "pool.dataset.delete" => {
            let id = arg0.as_str().unwrap_or_default().to_string();
            if !state.datasets.contains_key(&id) {
                return Err(enoent(format!("dataset {} does not exist", id)));
            }
            let recursive = arg1["recursive"].as_bool().unwrap_or(false);
            let child_prefix = format!("{}/", id);
            let children: Vec<String> = state
                .datasets
                .keys()
                .filter(|k| k.starts_with(&child_prefix))
                .cloned()
                .collect();
            let own_snapshots: Vec<String> = state
                .snapshots
                .values()
                .filter(|s| s.dataset == id || s.dataset.starts_with(&child_prefix))
                .map(|s| s.id.clone())
                .collect();
            if !recursive && !children.is_empty() {
                return Err(ebusy(format!("dataset {} has children", id)));
            }
            if !recursive && !own_snapshots.is_empty() {
                return Err(ebusy(format!("dataset {} has snapshots", id)));
            }
            // Dependent clones pin the dataset regardless of recursion.
            for snapshot in &own_snapshots {
                if state
                    .datasets
                    .values()
                    .any(|d| d.origin.as_deref() == Some(snapshot.as_str()))
                {
                    return Err(ebusy(format!("snapshot {} has dependent clones", snapshot)));
                }
            }
            for child in children {
                state.datasets.remove(&child);
            }
            for snapshot in own_snapshots {
                state.snapshots.remove(&snapshot);
            }
            state.datasets.remove(&id);
            Ok(json!(true))
        }

        "pool.dataset.query" => Ok(Value::Array(
            state
                .datasets
                .values()
                .map(DatasetRec::to_json)
                .filter(|r| matches_filters(r, &arg0))
                .collect(),
        )),

        "pool.dataset.destroy_snapshots" => {
            let id = arg0.as_str().unwrap_or_default().to_string();
            let doomed: Vec<String> = state
                .snapshots
                .values()
                .filter(|s| s.dataset == id)
                .map(|s| s.id.clone())
                .collect();
            for snapshot in &doomed {
                if state
                    .datasets
                    .values()
                    .any(|d| d.origin.as_deref() == Some(snapshot.as_str()))
                {
                    return Err(ebusy(format!("snapshot {} has dependent clones", snapshot)));
                }
            }
            for snapshot in doomed {
                state.snapshots.remove(&snapshot);
            }
            Ok(json!(true))
        }

        "pool.dataset.promote" => {
            let id = arg0.as_str().unwrap_or_default().to_string();
            let Some(record) = state.datasets.get(&id) else {
                return Err(enoent(format!("dataset {} does not exist", id)));
            };
            let Some(origin) = record.origin.clone() else {
                return Err(("EINVAL", format!("dataset {} is not a clone", id)));
            };
            let snap_name = origin
                .split_once('@')
                .map(|(_, name)| name.to_string())
                .unwrap_or_default();
            // The origin snapshot migrates to the promoted clone, which
            // becomes fully independent of its former source.
            let migrated = format!("{}@{}", id, snap_name);
            if state.snapshots.remove(&origin).is_some() {
                state.snapshots.insert(
                    migrated.clone(),
                    SnapshotRec {
                        id: migrated.clone(),
                        dataset: id.clone(),
                        name: snap_name,
                    },
                );
            }
            if let Some(record) = state.datasets.get_mut(&id) {
                record.origin = None;
            }
            Ok(json!(true))
        }

        "sharing.nfs.create" => {
            let path = arg0["path"].as_str().unwrap_or_default().to_string();
            if state
                .nfs_shares
                .values()
                .any(|s| s["path"].as_str() == Some(path.as_str()))
            {
                return Err(eexist(format!("share for {} already exists", path)));
            }
            let id = state.allocate_id();
            let record = json!({
                "id": id,
                "path": path,
                "enabled": arg0["enabled"].as_bool().unwrap_or(true),
                "comment": arg0["comment"].as_str().unwrap_or(""),
                "networks": [],
                "hosts": [],
            });
            state.nfs_shares.insert(id, record.clone());
            Ok(record)
        }
        "sharing.nfs.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if state.nfs_shares.remove(&id).is_none() {
                return Err(enoent(format!("share {} does not exist", id)));
            }
            Ok(json!(true))
        }
        "sharing.nfs.query" => Ok(query_map(&state.nfs_shares, &arg0)),

        "nvmet.subsys.create" => {
            let subnqn = arg0["subnqn"].as_str().unwrap_or_default().to_string();
            if state
                .nvmet_subsystems
                .values()
                .any(|s| s["subnqn"].as_str() == Some(subnqn.as_str()))
            {
                return Err(eexist(format!("subsystem {} already exists", subnqn)));
            }
            let id = state.allocate_id();
            let record = json!({
                "id": id,
                "name": arg0["name"].as_str().unwrap_or(""),
                "subnqn": subnqn,
                "allow_any_host": arg0["allow_any_host"].as_bool().unwrap_or(false),
            });
            state.nvmet_subsystems.insert(id, record.clone());
            Ok(record)
        }
        "nvmet.subsys.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if !state.nvmet_subsystems.contains_key(&id) {
                return Err(enoent(format!("subsystem {} does not exist", id)));
            }
            if state
                .nvmet_namespaces
                .values()
                .any(|n| n["subsys_id"].as_i64() == Some(id))
            {
                return Err(ebusy(format!("subsystem {} still has namespaces", id)));
            }
            if state
                .nvmet_port_subsys
                .values()
                .any(|b| b["subsys_id"].as_i64() == Some(id))
            {
                return Err(ebusy(format!("subsystem {} still has port bindings", id)));
            }
            state.nvmet_subsystems.remove(&id);
            Ok(json!(true))
        }
        "nvmet.subsys.query" => Ok(query_map(&state.nvmet_subsystems, &arg0)),

        "nvmet.namespace.create" => {
            let subsys_id = arg0["subsys_id"].as_i64().unwrap_or_default();
            if !state.nvmet_subsystems.contains_key(&subsys_id) {
                return Err(enoent(format!("subsystem {} does not exist", subsys_id)));
            }
            let nsid = state
                .nvmet_namespaces
                .values()
                .filter(|n| n["subsys_id"].as_i64() == Some(subsys_id))
                .count() as u32
                + 1;
            let id = state.allocate_id();
            let record = json!({
                "id": id,
                "subsys_id": subsys_id,
                "nsid": nsid,
                "device_path": arg0["device_path"].as_str().unwrap_or(""),
            });
            state.nvmet_namespaces.insert(id, record.clone());
            Ok(record)
        }
        "nvmet.namespace.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if state.nvmet_namespaces.remove(&id).is_none() {
                return Err(enoent(format!("namespace {} does not exist", id)));
            }
            Ok(json!(true))
        }
        "nvmet.namespace.query" => Ok(query_map(&state.nvmet_namespaces, &arg0)),

        "nvmet.port.query" => Ok(query_map(&state.nvmet_ports, &arg0)),

        "nvmet.port_subsys.create" => {
            let port_id = arg0["port_id"].as_i64().unwrap_or_default();
            let subsys_id = arg0["subsys_id"].as_i64().unwrap_or_default();
            if !state.nvmet_ports.contains_key(&port_id) {
                return Err(enoent(format!("port {} does not exist", port_id)));
            }
            if !state.nvmet_subsystems.contains_key(&subsys_id) {
                return Err(enoent(format!("subsystem {} does not exist", subsys_id)));
            }
            if state.nvmet_port_subsys.values().any(|b| {
                b["port_id"].as_i64() == Some(port_id) && b["subsys_id"].as_i64() == Some(subsys_id)
            }) {
                return Err(eexist("binding already exists".to_string()));
            }
            let id = state.allocate_id();
            let record = json!({"id": id, "port_id": port_id, "subsys_id": subsys_id});
            state.nvmet_port_subsys.insert(id, record.clone());
            Ok(record)
        }
        "nvmet.port_subsys.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if state.nvmet_port_subsys.remove(&id).is_none() {
                return Err(enoent(format!("binding {} does not exist", id)));
            }
            Ok(json!(true))
        }
        "nvmet.port_subsys.query" => Ok(query_map(&state.nvmet_port_subsys, &arg0)),

        "iscsi.target.create" => {
            let name = arg0["name"].as_str().unwrap_or_default().to_string();
            if state
                .iscsi_targets
                .values()
                .any(|t| t["name"].as_str() == Some(name.as_str()))
            {
                return Err(eexist(format!("target {} already exists", name)));
            }
            let id = state.allocate_id();
            let record = json!({"id": id, "name": name, "alias": arg0["alias"]});
            state.iscsi_targets.insert(id, record.clone());
            Ok(record)
        }
        "iscsi.target.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if !state.iscsi_targets.contains_key(&id) {
                return Err(enoent(format!("target {} does not exist", id)));
            }
            if state
                .iscsi_targetextents
                .values()
                .any(|te| te["target"].as_i64() == Some(id))
            {
                return Err(ebusy(format!("target {} still has extents", id)));
            }
            state.iscsi_targets.remove(&id);
            Ok(json!(true))
        }
        "iscsi.target.query" => Ok(query_map(&state.iscsi_targets, &arg0)),

        "iscsi.extent.create" => {
            let name = arg0["name"].as_str().unwrap_or_default().to_string();
            if state
                .iscsi_extents
                .values()
                .any(|e| e["name"].as_str() == Some(name.as_str()))
            {
                return Err(eexist(format!("extent {} already exists", name)));
            }
            let id = state.allocate_id();
            let record = json!({"id": id, "name": name, "disk": arg0["disk"]});
            state.iscsi_extents.insert(id, record.clone());
            Ok(record)
        }
        "iscsi.extent.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if state.iscsi_extents.remove(&id).is_none() {
                return Err(enoent(format!("extent {} does not exist", id)));
            }
            Ok(json!(true))
        }
        "iscsi.extent.query" => Ok(query_map(&state.iscsi_extents, &arg0)),

        "iscsi.targetextent.create" => {
            let id = state.allocate_id();
            let record = json!({
                "id": id,
                "target": arg0["target"],
                "extent": arg0["extent"],
                "lunid": arg0["lunid"].as_u64().unwrap_or(0),
            });
            state.iscsi_targetextents.insert(id, record.clone());
            Ok(record)
        }
        "iscsi.targetextent.delete" => {
            let id = arg0.as_i64().unwrap_or_default();
            if state.iscsi_targetextents.remove(&id).is_none() {
                return Err(enoent(format!("association {} does not exist", id)));
            }
            Ok(json!(true))
        }
        "iscsi.targetextent.query" => Ok(query_map(&state.iscsi_targetextents, &arg0)),

        "zfs.snapshot.create" => {
            let dataset = arg0["dataset"].as_str().unwrap_or_default().to_string();
            let name = arg0["name"].as_str().unwrap_or_default().to_string();
            if !state.datasets.contains_key(&dataset) {
                return Err(enoent(format!("dataset {} does not exist", dataset)));
            }
            let id = format!("{}@{}", dataset, name);
            if state.snapshots.contains_key(&id) {
                return Err(eexist(format!("snapshot {} already exists", id)));
            }
            let record = SnapshotRec {
                id: id.clone(),
                dataset,
                name,
            };
            let reply = record.to_json();
            state.snapshots.insert(id, record);
            Ok(reply)
        }
        "zfs.snapshot.delete" => {
            let id = arg0.as_str().unwrap_or_default().to_string();
            if !state.snapshots.contains_key(&id) {
                return Err(enoent(format!("snapshot {} does not exist", id)));
            }
            if state
                .datasets
                .values()
                .any(|d| d.origin.as_deref() == Some(id.as_str()))
            {
                return Err(ebusy(format!("snapshot {} has dependent clones", id)));
            }
            state.snapshots.remove(&id);
            Ok(json!(true))
        }
        "zfs.snapshot.query" => Ok(Value::Array(
            state
                .snapshots
                .values()
                .map(SnapshotRec::to_json)
                .filter(|r| matches_filters(r, &arg0))
                .collect(),
        )),
        "zfs.snapshot.clone" => {
            let snapshot = arg0["snapshot"].as_str().unwrap_or_default().to_string();
            let target = arg0["dataset_dst"].as_str().unwrap_or_default().to_string();
            let Some(source_snapshot) = state.snapshots.get(&snapshot).cloned() else {
                return Err(enoent(format!("snapshot {} does not exist", snapshot)));
            };
            if state.datasets.contains_key(&target) {
                return Err(eexist(format!("dataset {} already exists", target)));
            }
            let source = state
                .datasets
                .get(&source_snapshot.dataset)
                .cloned()
                .ok_or_else(|| enoent(format!("dataset {} does not exist", source_snapshot.dataset)))?;
            state.datasets.insert(
                target.clone(),
                DatasetRec {
                    id: target,
                    kind: source.kind,
                    volsize: source.volsize,
                    refquota: None,
                    origin: Some(snapshot),
                    user_properties: HashMap::new(),
                },
            );
            Ok(json!(true))
        }

        "replication.run_onetime" => {
            let source_dataset = arg0["source_dataset"].as_str().unwrap_or_default().to_string();
            let source_snapshot = arg0["source_snapshot"].as_str().unwrap_or_default().to_string();
            let target = arg0["target_dataset"].as_str().unwrap_or_default().to_string();
            let full = format!("{}@{}", source_dataset, source_snapshot);
            if !state.snapshots.contains_key(&full) {
                return Err(enoent(format!("snapshot {} does not exist", full)));
            }
            let job_id = state.allocate_id();
            if let Some(reason) = state.fail_replication.clone() {
                state.jobs.insert(
                    job_id,
                    JobRec {
                        id: job_id,
                        final_state: "FAILED".to_string(),
                        error: Some(reason),
                        polls_remaining: 1,
                    },
                );
                return Ok(json!(job_id));
            }
            if state.abort_replication {
                state.jobs.insert(
                    job_id,
                    JobRec {
                        id: job_id,
                        final_state: "ABORTED".to_string(),
                        error: Some("replication aborted".to_string()),
                        polls_remaining: 1,
                    },
                );
                return Ok(json!(job_id));
            }
            // Receive: create missing ancestors, then the target dataset
            // and the replicated snapshot.
            let mut ancestors = Vec::new();
            let mut current = target.as_str();
            while let Some((parent, _)) = current.rsplit_once('/') {
                if !state.datasets.contains_key(parent) {
                    ancestors.push(parent.to_string());
                }
                current = parent;
            }
            for ancestor in ancestors.into_iter().rev() {
                let record = DatasetRec::filesystem(&ancestor);
                state.datasets.insert(ancestor, record);
            }
            let source = state
                .datasets
                .get(&source_dataset)
                .cloned()
                .ok_or_else(|| enoent(format!("dataset {} does not exist", source_dataset)))?;
            state.datasets.insert(
                target.clone(),
                DatasetRec {
                    id: target.clone(),
                    kind: source.kind,
                    volsize: source.volsize,
                    refquota: None,
                    origin: None,
                    user_properties: HashMap::new(),
                },
            );
            let replicated = format!("{}@{}", target, source_snapshot);
            state.snapshots.insert(
                replicated.clone(),
                SnapshotRec {
                    id: replicated,
                    dataset: target,
                    name: source_snapshot,
                },
            );
            state.jobs.insert(
                job_id,
                JobRec {
                    id: job_id,
                    final_state: "SUCCESS".to_string(),
                    error: None,
                    polls_remaining: 1,
                },
            );
            Ok(json!(job_id))
        }

        "core.get_jobs" => {
            let ids: Vec<i64> = state.jobs.keys().cloned().collect();
            let mut records = Vec::new();
            for id in ids {
                let job = state.jobs.get_mut(&id).unwrap();
                let shown_state = if job.polls_remaining > 0 {
                    job.polls_remaining -= 1;
                    "RUNNING".to_string()
                } else {
                    job.final_state.clone()
                };
                let record = json!({
                    "id": job.id,
                    "state": shown_state,
                    "progress": {"percent": if shown_state == "RUNNING" { 50.0 } else { 100.0 }, "description": ""},
                    "error": if shown_state == "RUNNING" { None } else { job.error.clone() },
                });
                records.push(record);
            }
            Ok(Value::Array(
                records
                    .into_iter()
                    .filter(|r| matches_filters(r, &arg0))
                    .collect(),
            ))
        }

        other => Err(("EINVAL", format!("unhandled method {}", other))),
    }
}

/// A running mock appliance.
pub struct MockAppliance {
    pub url: String,
    pub state: Arc<Mutex<ApplianceState>>,
}

impl MockAppliance {
    /// Bind a listener and serve connections until the test ends.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(ApplianceState::seeded()));

        let served = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let state = Arc::clone(&served);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Text(text) = message else { continue };
                        let request: Value = serde_json::from_str(&text).unwrap();
                        let id = request["id"].clone();
                        let method = request["method"].as_str().unwrap_or_default();
                        let params = request.get("params").cloned().unwrap_or(Value::Null);
                        let reply = match dispatch(&state, method, &params) {
                            Ok(result) => {
                                json!({"id": id, "jsonrpc": "2.0", "result": result})
                            }
                            Err((errname, reason)) => json!({
                                "id": id,
                                "jsonrpc": "2.0",
                                "error": {
                                    "error": 1,
                                    "errname": errname,
                                    "reason": reason,
                                    "type": "CallError",
                                },
                            }),
                        };
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { url, state }
    }

    /// Direct read access to a dataset record.
    pub fn dataset(&self, id: &str) -> Option<DatasetRec> {
        self.state.lock().unwrap().datasets.get(id).cloned()
    }

    pub fn dataset_count_under(&self, parent: &str) -> usize {
        let prefix = format!("{}/", parent);
        self.state
            .lock()
            .unwrap()
            .datasets
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    pub fn snapshot_ids(&self, dataset: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .values()
            .filter(|s| s.dataset == dataset)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn nfs_share_for(&self, path: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .nfs_shares
            .values()
            .find(|s| s["path"].as_str() == Some(path))
            .cloned()
    }

    /// Remove the NFS share for a path out-of-band, as an operator would.
    pub fn remove_nfs_share(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<i64> = state
            .nfs_shares
            .iter()
            .filter(|(_, s)| s["path"].as_str() == Some(path))
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            state.nfs_shares.remove(&id);
        }
    }

    /// Set a user property out-of-band, as an operator would.
    pub fn set_user_property(&self, dataset: &str, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.datasets.get_mut(dataset) {
            record
                .user_properties
                .insert(key.to_string(), value.to_string());
        }
    }
}
