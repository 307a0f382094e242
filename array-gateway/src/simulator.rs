//! In-memory array gateway.
//!
//! `SimulatedArray` keeps a complete object model per array and applies the
//! same consistency rules the management API enforces (membership, masking
//! references, capacity). Faults and latency are injected per instance so
//! tests never share mutable state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ArrayError, Result};
use crate::gateway::ArrayGateway;
use crate::types::{
    Host, HostType, Job, JobId, JobStatus, MaskingView, ObjectKind, Port, PortGroup, PortKey,
    Snapshot, StorageGroup, StoragePool, Volume, VolumeSpec,
};

/// Service levels offered by a freshly added array.
pub const DEFAULT_SERVICE_LEVELS: &[&str] = &[
    "Diamond",
    "Platinum",
    "Gold",
    "Silver",
    "Bronze",
    "Optimized",
    "None",
];

/// First device ID handed out on a new array.
const FIRST_DEVICE_ID: u32 = 0x501;

/// Gateway operations that faults can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListArrays,
    Login,
    Logout,
    GetVolume,
    ListVolumes,
    CreateVolume,
    CreateVolumeFromSnapshot,
    RenameVolume,
    DeleteVolume,
    GetJob,
    GetStorageGroup,
    CreateStorageGroup,
    DeleteStorageGroup,
    AddToStorageGroup,
    RemoveFromStorageGroup,
    GetHost,
    CreateHost,
    UpdateHost,
    GetMaskingView,
    CreateMaskingView,
    DeleteMaskingView,
    ListPortGroups,
    GetPortGroup,
    GetPort,
    GetStoragePool,
    ListServiceLevels,
    CreateSnapshot,
    DeleteSnapshot,
    ListSnapshots,
}

/// How deletion jobs progress when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobBehavior {
    /// Succeed on the given poll (0 means the first poll sees success).
    CompleteAfter(u32),
    /// Never leave the running state.
    StayRunning,
    /// Fail with the given message on the first poll.
    Fail(String),
}

impl Default for JobBehavior {
    fn default() -> Self {
        JobBehavior::CompleteAfter(0)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    transient: bool,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct SimJob {
    array_id: String,
    device_id: String,
    polls: u32,
    behavior: JobBehavior,
    status: JobStatus,
}

#[derive(Debug, Default)]
struct ArrayState {
    volumes: BTreeMap<String, Volume>,
    volume_pools: HashMap<String, String>,
    storage_groups: BTreeMap<String, StorageGroup>,
    hosts: BTreeMap<String, Host>,
    masking_views: BTreeMap<String, MaskingView>,
    port_groups: BTreeMap<String, PortGroup>,
    ports: BTreeMap<PortKey, Port>,
    pools: BTreeMap<String, StoragePool>,
    service_levels: Vec<String>,
    snapshots: Vec<Snapshot>,
    next_device: u32,
}

impl ArrayState {
    fn new() -> Self {
        Self {
            service_levels: DEFAULT_SERVICE_LEVELS.iter().map(|s| s.to_string()).collect(),
            next_device: FIRST_DEVICE_ID,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct State {
    arrays: BTreeMap<String, ArrayState>,
    sessions: HashSet<String>,
    jobs: HashMap<JobId, SimJob>,
    job_behavior: JobBehavior,
    faults: Vec<Fault>,
    calls: HashMap<Operation, u64>,
}

/// Serializable description of the simulated arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub arrays: Vec<ArrayInventory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayInventory {
    pub id: String,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
    /// Replaces the default service levels when non-empty
    #[serde(default)]
    pub service_levels: Vec<String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub port_groups: Vec<PortGroup>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub storage_groups: Vec<StorageGroup>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub masking_views: Vec<MaskingView>,
}

/// In-memory implementation of [`ArrayGateway`].
pub struct SimulatedArray {
    state: Mutex<State>,
    latency: Mutex<Duration>,
}

impl Default for SimulatedArray {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedArray {
    /// Create a simulator with no arrays.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// A single array `000197900046` with pool `SRP_1`, two iSCSI port
    /// groups and the default service levels.
    pub fn sample() -> Self {
        let sim = Self::new();
        let array_id = "000197900046";
        sim.add_array(array_id);
        let setup = || -> Result<()> {
            sim.add_storage_pool(
                array_id,
                StoragePool {
                    id: "SRP_1".to_string(),
                    total_cylinders: 10_000_000,
                    used_cylinders: 0,
                },
            )?;
            for (director, port, address) in [
                ("SE-1E", "0", "192.168.1.50"),
                ("SE-2E", "0", "192.168.1.51"),
                ("SE-1E", "1", "192.168.1.52"),
            ] {
                sim.add_port(
                    array_id,
                    Port {
                        key: PortKey {
                            director_id: director.to_string(),
                            port_id: port.to_string(),
                        },
                        iscsi_target: Some(format!(
                            "iqn.1992-04.com.emc:6000097000{}{}{}",
                            array_id,
                            director.replace('-', "").to_lowercase(),
                            port
                        )),
                        ip_addresses: vec![address.to_string()],
                    },
                )?;
            }
            sim.add_port_group(
                array_id,
                PortGroup {
                    id: "portgroup1".to_string(),
                    ports: vec![
                        PortKey {
                            director_id: "SE-1E".to_string(),
                            port_id: "0".to_string(),
                        },
                        PortKey {
                            director_id: "SE-2E".to_string(),
                            port_id: "0".to_string(),
                        },
                    ],
                },
            )?;
            sim.add_port_group(
                array_id,
                PortGroup {
                    id: "portgroup2".to_string(),
                    ports: vec![PortKey {
                        director_id: "SE-1E".to_string(),
                        port_id: "1".to_string(),
                    }],
                },
            )
        };
        if let Err(e) = setup() {
            warn!(error = %e, "Failed to seed sample array");
        }
        sim
    }

    /// Build a simulator from a JSON [`Inventory`].
    pub fn from_json(json: &str) -> Result<Self> {
        let inventory: Inventory =
            serde_json::from_str(json).map_err(|e| ArrayError::Inventory(e.to_string()))?;
        Self::from_inventory(inventory)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ArrayError::Inventory(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn from_inventory(inventory: Inventory) -> Result<Self> {
        let sim = Self::new();
        for array in inventory.arrays {
            sim.add_array(&array.id);
            if !array.service_levels.is_empty() {
                sim.set_service_levels(&array.id, array.service_levels.clone())?;
            }
            for pool in array.storage_pools {
                sim.add_storage_pool(&array.id, pool)?;
            }
            for port in array.ports {
                sim.add_port(&array.id, port)?;
            }
            for group in array.port_groups {
                sim.add_port_group(&array.id, group)?;
            }
            for host in array.hosts {
                sim.add_host(&array.id, host)?;
            }
            for group in array.storage_groups {
                sim.add_storage_group(&array.id, group)?;
            }
            for volume in array.volumes {
                sim.add_volume(&array.id, volume)?;
            }
            for view in array.masking_views {
                sim.add_masking_view(&array.id, view)?;
            }
        }
        Ok(sim)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Fault and latency injection
    // ------------------------------------------------------------------------

    /// Make `operation` fail. Transient faults surface as a busy array,
    /// permanent ones as a rejected request. `times` limits how many calls
    /// fail; `None` fails every call until [`clear_faults`](Self::clear_faults).
    pub fn fail(&self, operation: Operation, transient: bool, times: Option<u32>) {
        self.lock().faults.push(Fault {
            operation,
            transient,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Behaviour of deletion jobs started after this call.
    pub fn set_job_behavior(&self, behavior: JobBehavior) {
        self.lock().job_behavior = behavior;
    }

    /// Number of calls made to `operation`, including failed ones.
    pub fn call_count(&self, operation: Operation) -> u64 {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn is_logged_in(&self, array_id: &str) -> bool {
        self.lock().sessions.contains(array_id)
    }

    /// Count the call, then apply latency and any matching fault.
    async fn enter(&self, operation: Operation, array_id: &str) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;

        let Some(index) = state.faults.iter().position(|f| f.operation == operation) else {
            return Ok(());
        };
        let fault = &mut state.faults[index];
        let transient = fault.transient;
        let exhausted = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            state.faults.remove(index);
        }

        debug!(?operation, array_id, transient, "Injecting array fault");
        let message = format!("injected failure in {:?}", operation);
        if transient {
            Err(ArrayError::Busy {
                array_id: array_id.to_string(),
                message,
            })
        } else {
            Err(ArrayError::rejected(array_id, message))
        }
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    /// Add an empty array with the default service levels. Existing arrays
    /// are left as they are.
    pub fn add_array(&self, array_id: &str) {
        self.lock()
            .arrays
            .entry(array_id.to_string())
            .or_insert_with(ArrayState::new);
    }

    pub fn set_service_levels(&self, array_id: &str, levels: Vec<String>) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.service_levels = levels;
            Ok(())
        })
    }

    pub fn add_storage_pool(&self, array_id: &str, pool: StoragePool) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.pools.insert(pool.id.clone(), pool);
            Ok(())
        })
    }

    pub fn add_port(&self, array_id: &str, port: Port) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.ports.insert(port.key.clone(), port);
            Ok(())
        })
    }

    pub fn add_port_group(&self, array_id: &str, group: PortGroup) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.port_groups.insert(group.id.clone(), group);
            Ok(())
        })
    }

    pub fn add_host(&self, array_id: &str, host: Host) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.hosts.insert(host.id.clone(), host);
            Ok(())
        })
    }

    /// Insert a storage group as given. Member devices and views are linked
    /// when they are added.
    pub fn add_storage_group(&self, array_id: &str, group: StorageGroup) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            a.storage_groups.insert(
                group.id.clone(),
                StorageGroup {
                    volume_ids: Vec::new(),
                    masking_views: Vec::new(),
                    ..group
                },
            );
            Ok(())
        })
    }

    /// Insert an existing device. Its storage groups must already exist.
    pub fn add_volume(&self, array_id: &str, volume: Volume) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            for group_id in &volume.storage_groups {
                let group = a
                    .storage_groups
                    .get_mut(group_id)
                    .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StorageGroup, group_id))?;
                if !group.contains(&volume.device_id) {
                    group.volume_ids.push(volume.device_id.clone());
                }
            }
            if let Ok(n) = u32::from_str_radix(&volume.device_id, 16) {
                a.next_device = a.next_device.max(n + 1);
            }
            a.volumes.insert(volume.device_id.clone(), volume);
            Ok(())
        })
    }

    pub fn add_masking_view(&self, array_id: &str, view: MaskingView) -> Result<()> {
        with_array(&mut self.lock(), array_id, |a| {
            insert_masking_view(array_id, a, view).map(|_| ())
        })
    }

    fn touch_session(&self, array_id: &str, logged_in: bool) -> Result<()> {
        let mut state = self.lock();
        if !state.arrays.contains_key(array_id) {
            return Err(ArrayError::UnknownArray(array_id.to_string()));
        }
        if logged_in {
            state.sessions.insert(array_id.to_string());
        } else {
            state.sessions.remove(array_id);
        }
        Ok(())
    }
}

fn with_array<T>(
    state: &mut State,
    array_id: &str,
    f: impl FnOnce(&mut ArrayState) -> Result<T>,
) -> Result<T> {
    let array = state
        .arrays
        .get_mut(array_id)
        .ok_or_else(|| ArrayError::UnknownArray(array_id.to_string()))?;
    f(array)
}

fn insert_masking_view(array_id: &str, a: &mut ArrayState, view: MaskingView) -> Result<MaskingView> {
    if a.masking_views.contains_key(&view.id) {
        return Err(ArrayError::already_exists(array_id, ObjectKind::MaskingView, &view.id));
    }
    if !a.hosts.contains_key(&view.host_id) {
        return Err(ArrayError::not_found(array_id, ObjectKind::Host, &view.host_id));
    }
    if !a.port_groups.contains_key(&view.port_group_id) {
        return Err(ArrayError::not_found(array_id, ObjectKind::PortGroup, &view.port_group_id));
    }
    let group = a
        .storage_groups
        .get_mut(&view.storage_group_id)
        .ok_or_else(|| {
            ArrayError::not_found(array_id, ObjectKind::StorageGroup, &view.storage_group_id)
        })?;
    group.masking_views.push(view.id.clone());
    a.masking_views.insert(view.id.clone(), view.clone());
    Ok(view)
}

fn insert_volume(array_id: &str, a: &mut ArrayState, spec: &VolumeSpec) -> Result<Volume> {
    if spec.capacity_cylinders <= 0 {
        return Err(ArrayError::rejected(
            array_id,
            format!("invalid device size {} cylinders", spec.capacity_cylinders),
        ));
    }
    let group = a.storage_groups.get(&spec.storage_group_id).ok_or_else(|| {
        ArrayError::not_found(array_id, ObjectKind::StorageGroup, &spec.storage_group_id)
    })?;
    let pool_id = group.storage_pool.clone();
    if let Some(pool_id) = &pool_id {
        let pool = a
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StoragePool, pool_id))?;
        if pool.available_cylinders() < spec.capacity_cylinders {
            return Err(ArrayError::rejected(
                array_id,
                format!("insufficient capacity in storage pool {}", pool_id),
            ));
        }
        pool.used_cylinders += spec.capacity_cylinders;
    }

    let device_id = format!("{:05X}", a.next_device);
    a.next_device += 1;

    let volume = Volume {
        device_id: device_id.clone(),
        identifier: spec.identifier.clone(),
        capacity_cylinders: spec.capacity_cylinders,
        wwn: device_wwn(array_id, &device_id),
        storage_groups: vec![spec.storage_group_id.clone()],
    };
    if let Some(group) = a.storage_groups.get_mut(&spec.storage_group_id) {
        group.volume_ids.push(device_id.clone());
    }
    if let Some(pool_id) = pool_id {
        a.volume_pools.insert(device_id.clone(), pool_id);
    }
    a.volumes.insert(device_id, volume.clone());
    Ok(volume)
}

fn device_wwn(array_id: &str, device_id: &str) -> String {
    format!("60000970000{}5330{}", array_id, device_id)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl ArrayGateway for SimulatedArray {
    async fn list_arrays(&self) -> Result<Vec<String>> {
        self.enter(Operation::ListArrays, "").await?;
        Ok(self.lock().arrays.keys().cloned().collect())
    }

    async fn login(&self, array_id: &str) -> Result<()> {
        self.enter(Operation::Login, array_id).await?;
        self.touch_session(array_id, true)
    }

    async fn logout(&self, array_id: &str) -> Result<()> {
        self.enter(Operation::Logout, array_id).await?;
        self.touch_session(array_id, false)
    }

    async fn get_volume(&self, array_id: &str, device_id: &str) -> Result<Volume> {
        self.enter(Operation::GetVolume, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.volumes
                .get(device_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Volume, device_id))
        })
    }

    async fn list_volumes(&self, array_id: &str) -> Result<Vec<Volume>> {
        self.enter(Operation::ListVolumes, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            Ok(a.volumes.values().cloned().collect())
        })
    }

    async fn create_volume(&self, array_id: &str, spec: &VolumeSpec) -> Result<Volume> {
        self.enter(Operation::CreateVolume, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| insert_volume(array_id, a, spec))
    }

    async fn create_volume_from_snapshot(
        &self,
        array_id: &str,
        spec: &VolumeSpec,
        source_device_id: &str,
        snapshot_name: &str,
    ) -> Result<Volume> {
        self.enter(Operation::CreateVolumeFromSnapshot, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let snapshot = a
                .snapshots
                .iter()
                .find(|s| s.source_device_id == source_device_id && s.name == snapshot_name)
                .ok_or_else(|| {
                    ArrayError::not_found(array_id, ObjectKind::Snapshot, snapshot_name)
                })?;
            if snapshot.size_cylinders != spec.capacity_cylinders {
                return Err(ArrayError::rejected(
                    array_id,
                    format!(
                        "target size {} cylinders does not match snapshot size {}",
                        spec.capacity_cylinders, snapshot.size_cylinders
                    ),
                ));
            }
            insert_volume(array_id, a, spec)
        })
    }

    async fn rename_volume(
        &self,
        array_id: &str,
        device_id: &str,
        identifier: &str,
    ) -> Result<Volume> {
        self.enter(Operation::RenameVolume, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let volume = a
                .volumes
                .get_mut(device_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Volume, device_id))?;
            volume.identifier = identifier.to_string();
            Ok(volume.clone())
        })
    }

    async fn delete_volume(&self, array_id: &str, device_id: &str) -> Result<JobId> {
        self.enter(Operation::DeleteVolume, array_id).await?;
        let mut state = self.lock();
        let behavior = state.job_behavior.clone();
        with_array(&mut state, array_id, |a| {
            let volume = a
                .volumes
                .get(device_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Volume, device_id))?;
            if let Some(group) = volume.storage_groups.first() {
                return Err(ArrayError::rejected(
                    array_id,
                    format!("device {} is a member of storage group {}", device_id, group),
                ));
            }
            Ok(())
        })?;

        let job_id = uuid::Uuid::new_v4().to_string();
        state.jobs.insert(
            job_id.clone(),
            SimJob {
                array_id: array_id.to_string(),
                device_id: device_id.to_string(),
                polls: 0,
                behavior,
                status: JobStatus::Running,
            },
        );
        Ok(job_id)
    }

    async fn get_job(&self, array_id: &str, job_id: &str) -> Result<Job> {
        self.enter(Operation::GetJob, array_id).await?;
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .filter(|j| j.array_id == array_id)
            .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Job, job_id))?;

        let mut finished_device = None;
        if !job.status.is_terminal() {
            let poll = job.polls;
            job.polls += 1;
            match &job.behavior {
                JobBehavior::CompleteAfter(n) if poll >= *n => {
                    job.status = JobStatus::Succeeded;
                    finished_device = Some(job.device_id.clone());
                }
                JobBehavior::Fail(message) => {
                    job.status = JobStatus::Failed(message.clone());
                }
                _ => {}
            }
        }
        let result = Job {
            id: job_id.to_string(),
            status: job.status.clone(),
            resource_link: format!("sloprovisioning/system/{}/volume/{}", job.array_id, job.device_id),
        };

        if let Some(device_id) = finished_device {
            if let Some(array) = state.arrays.get_mut(array_id) {
                if let Some(volume) = array.volumes.remove(&device_id) {
                    if let Some(pool_id) = array.volume_pools.remove(&device_id) {
                        if let Some(pool) = array.pools.get_mut(&pool_id) {
                            pool.used_cylinders =
                                (pool.used_cylinders - volume.capacity_cylinders).max(0);
                        }
                    }
                    array.snapshots.retain(|s| s.source_device_id != device_id);
                }
            }
        }
        Ok(result)
    }

    async fn get_storage_group(&self, array_id: &str, group_id: &str) -> Result<StorageGroup> {
        self.enter(Operation::GetStorageGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.storage_groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StorageGroup, group_id))
        })
    }

    async fn get_or_create_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        storage_pool: Option<&str>,
        service_level: Option<&str>,
    ) -> Result<StorageGroup> {
        self.enter(Operation::CreateStorageGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            if let Some(group) = a.storage_groups.get(group_id) {
                return Ok(group.clone());
            }
            if let Some(pool) = storage_pool {
                if !a.pools.contains_key(pool) {
                    return Err(ArrayError::not_found(array_id, ObjectKind::StoragePool, pool));
                }
            }
            if let Some(level) = service_level {
                if !a.service_levels.iter().any(|l| l == level) {
                    return Err(ArrayError::rejected(
                        array_id,
                        format!("unknown service level {}", level),
                    ));
                }
            }
            let group = StorageGroup {
                id: group_id.to_string(),
                storage_pool: storage_pool.map(str::to_string),
                service_level: service_level.map(str::to_string),
                volume_ids: Vec::new(),
                masking_views: Vec::new(),
            };
            a.storage_groups.insert(group_id.to_string(), group.clone());
            Ok(group)
        })
    }

    async fn delete_storage_group(&self, array_id: &str, group_id: &str) -> Result<()> {
        self.enter(Operation::DeleteStorageGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let group = a
                .storage_groups
                .get(group_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StorageGroup, group_id))?;
            if !group.volume_ids.is_empty() || group.is_masked() {
                return Err(ArrayError::rejected(
                    array_id,
                    format!("storage group {} is not empty or is masked", group_id),
                ));
            }
            a.storage_groups.remove(group_id);
            Ok(())
        })
    }

    async fn add_volume_to_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        device_id: &str,
    ) -> Result<()> {
        self.enter(Operation::AddToStorageGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let volume = a
                .volumes
                .get_mut(device_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Volume, device_id))?;
            let group = a
                .storage_groups
                .get_mut(group_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StorageGroup, group_id))?;
            if group.contains(device_id) {
                return Err(ArrayError::rejected(
                    array_id,
                    format!("device {} is already in storage group {}", device_id, group_id),
                ));
            }
            group.volume_ids.push(device_id.to_string());
            volume.storage_groups.push(group_id.to_string());
            Ok(())
        })
    }

    async fn remove_volume_from_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        device_id: &str,
    ) -> Result<()> {
        self.enter(Operation::RemoveFromStorageGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let group = a
                .storage_groups
                .get_mut(group_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StorageGroup, group_id))?;
            if !group.contains(device_id) {
                return Err(ArrayError::rejected(
                    array_id,
                    format!("device {} is not in storage group {}", device_id, group_id),
                ));
            }
            group.volume_ids.retain(|id| id != device_id);
            if let Some(volume) = a.volumes.get_mut(device_id) {
                volume.storage_groups.retain(|id| id != group_id);
            }
            Ok(())
        })
    }

    async fn get_host(&self, array_id: &str, host_id: &str) -> Result<Host> {
        self.enter(Operation::GetHost, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.hosts
                .get(host_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Host, host_id))
        })
    }

    async fn create_host(
        &self,
        array_id: &str,
        host_id: &str,
        host_type: HostType,
        initiators: &[String],
    ) -> Result<Host> {
        self.enter(Operation::CreateHost, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            if a.hosts.contains_key(host_id) {
                return Err(ArrayError::already_exists(array_id, ObjectKind::Host, host_id));
            }
            if initiators.is_empty() {
                return Err(ArrayError::rejected(array_id, "a host needs at least one initiator"));
            }
            let host = Host {
                id: host_id.to_string(),
                host_type,
                initiators: initiators.to_vec(),
            };
            a.hosts.insert(host_id.to_string(), host.clone());
            Ok(host)
        })
    }

    async fn add_host_initiators(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: &[String],
    ) -> Result<Host> {
        self.enter(Operation::UpdateHost, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let host = a
                .hosts
                .get_mut(host_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Host, host_id))?;
            for initiator in initiators {
                if !host.initiators.contains(initiator) {
                    host.initiators.push(initiator.clone());
                }
            }
            Ok(host.clone())
        })
    }

    async fn get_masking_view(&self, array_id: &str, view_id: &str) -> Result<MaskingView> {
        self.enter(Operation::GetMaskingView, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.masking_views
                .get(view_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::MaskingView, view_id))
        })
    }

    async fn create_masking_view(&self, array_id: &str, view: &MaskingView) -> Result<MaskingView> {
        self.enter(Operation::CreateMaskingView, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            insert_masking_view(array_id, a, view.clone())
        })
    }

    async fn delete_masking_view(&self, array_id: &str, view_id: &str) -> Result<()> {
        self.enter(Operation::DeleteMaskingView, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let view = a
                .masking_views
                .remove(view_id)
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::MaskingView, view_id))?;
            if let Some(group) = a.storage_groups.get_mut(&view.storage_group_id) {
                group.masking_views.retain(|id| id != view_id);
            }
            Ok(())
        })
    }

    async fn list_port_groups(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(Operation::ListPortGroups, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            Ok(a.port_groups.keys().cloned().collect())
        })
    }

    async fn get_port_group(&self, array_id: &str, group_id: &str) -> Result<PortGroup> {
        self.enter(Operation::GetPortGroup, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.port_groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::PortGroup, group_id))
        })
    }

    async fn get_port(&self, array_id: &str, key: &PortKey) -> Result<Port> {
        self.enter(Operation::GetPort, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.ports
                .get(key)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::Port, &key.to_string()))
        })
    }

    async fn get_storage_pool(&self, array_id: &str, pool_id: &str) -> Result<StoragePool> {
        self.enter(Operation::GetStoragePool, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            a.pools
                .get(pool_id)
                .cloned()
                .ok_or_else(|| ArrayError::not_found(array_id, ObjectKind::StoragePool, pool_id))
        })
    }

    async fn list_service_levels(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(Operation::ListServiceLevels, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| Ok(a.service_levels.clone()))
    }

    async fn create_snapshot(
        &self,
        array_id: &str,
        source_device_id: &str,
        name: &str,
    ) -> Result<Snapshot> {
        self.enter(Operation::CreateSnapshot, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let volume = a.volumes.get(source_device_id).ok_or_else(|| {
                ArrayError::not_found(array_id, ObjectKind::Volume, source_device_id)
            })?;
            if a
                .snapshots
                .iter()
                .any(|s| s.source_device_id == source_device_id && s.name == name)
            {
                return Err(ArrayError::already_exists(array_id, ObjectKind::Snapshot, name));
            }
            let snapshot = Snapshot {
                name: name.to_string(),
                source_device_id: source_device_id.to_string(),
                size_cylinders: volume.capacity_cylinders,
                created_at: unix_now(),
            };
            a.snapshots.push(snapshot.clone());
            Ok(snapshot)
        })
    }

    async fn delete_snapshot(
        &self,
        array_id: &str,
        source_device_id: &str,
        name: &str,
    ) -> Result<()> {
        self.enter(Operation::DeleteSnapshot, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| {
            let before = a.snapshots.len();
            a.snapshots
                .retain(|s| !(s.source_device_id == source_device_id && s.name == name));
            if a.snapshots.len() == before {
                return Err(ArrayError::not_found(array_id, ObjectKind::Snapshot, name));
            }
            Ok(())
        })
    }

    async fn list_snapshots(&self, array_id: &str) -> Result<Vec<Snapshot>> {
        self.enter(Operation::ListSnapshots, array_id).await?;
        with_array(&mut self.lock(), array_id, |a| Ok(a.snapshots.clone()))
    }
}
