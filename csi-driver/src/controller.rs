//! CSI Controller Service Implementation
//!
//! Handles volume, publish and snapshot operations against the array
//! gateway. Identifiers are decoded and requests validated before any array
//! call; volume teardown is handed to the deletion worker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use array_gateway::{
    ArrayError, MaskingView, ObjectKind, Snapshot, Volume, VolumeSpec, bytes_to_cylinders,
    cylinders_to_bytes,
};
use prost_types::Timestamp;
use tokio::sync::Semaphore;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::arrays::ArrayContext;
use crate::config::DriverConfig;
use crate::csi;
use crate::deletion::{DeletionRequest, DeletionWorker};
use crate::error::{DriverError, Result};
use crate::metrics::{self, OperationTimer};
use crate::pagination::paginate;
use crate::port_group::PortGroupSelector;
use crate::topology::TopologyManager;
use crate::volume_id::{
    SnapshotId, VolumeId, mark_for_deletion, snapshot_identifier, strip_deletion_marker,
    volume_identifier,
};

// StorageClass parameters and volume context keys
pub const PARAM_ARRAY: &str = "SYMID";
pub const PARAM_STORAGE_POOL: &str = "SRP";
pub const PARAM_SERVICE_LEVEL: &str = "ServiceLevel";
pub const PARAM_STORAGE_GROUP: &str = "StorageGroup";
pub const PARAM_APPLICATION_PREFIX: &str = "ApplicationPrefix";

// Publish context keys
pub const PUBLISH_CONTEXT_WWN: &str = "DEVICE_WWN";
pub const PUBLISH_CONTEXT_TARGETS: &str = "ISCSI_TARGETS";

pub const DEFAULT_SERVICE_LEVEL: &str = "Optimized";

/// Default volume size: 1GiB
pub const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;
/// Smallest volume created: 50MiB
pub const MIN_VOLUME_SIZE: i64 = 50 * 1024 * 1024;
/// Largest volume created: 64TiB
pub const MAX_VOLUME_SIZE: i64 = 64 * 1024 * 1024 * 1024 * 1024;

/// Resolved CreateVolume parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VolumeParameters {
    array_id: String,
    storage_pool: String,
    service_level: String,
    storage_group: Option<String>,
    application_prefix: Option<String>,
}

impl VolumeParameters {
    fn parse(parameters: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &str| {
            parameters
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| DriverError::validation(format!("parameter {} is required", key)))
        };
        let optional = |key: &str| parameters.get(key).filter(|v| !v.is_empty()).cloned();

        Ok(Self {
            array_id: required(PARAM_ARRAY)?,
            storage_pool: required(PARAM_STORAGE_POOL)?,
            service_level: optional(PARAM_SERVICE_LEVEL)
                .unwrap_or_else(|| DEFAULT_SERVICE_LEVEL.to_string()),
            storage_group: optional(PARAM_STORAGE_GROUP),
            application_prefix: optional(PARAM_APPLICATION_PREFIX),
        })
    }

    /// Storage group a new device is placed in.
    fn storage_group_id(&self, cluster_prefix: &str) -> String {
        if let Some(group) = &self.storage_group {
            return group.clone();
        }
        match &self.application_prefix {
            Some(app) => format!(
                "csi-{}-{}-{}-{}-SG",
                cluster_prefix, app, self.service_level, self.storage_pool
            ),
            None => format!(
                "csi-{}-{}-{}-SG",
                cluster_prefix, self.service_level, self.storage_pool
            ),
        }
    }
}

/// Size in cylinders for a requested capacity range.
fn requested_cylinders(range: Option<&csi::CapacityRange>) -> Result<i64> {
    let Some(range) = range else {
        return Ok(bytes_to_cylinders(DEFAULT_VOLUME_SIZE));
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(DriverError::validation("capacity range must not be negative"));
    }
    if range.required_bytes == 0 && range.limit_bytes == 0 {
        return Err(DriverError::validation(
            "capacity range must request a positive size",
        ));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(DriverError::validation(format!(
            "required bytes {} exceed limit bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }

    let requested = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    let bytes = requested.max(MIN_VOLUME_SIZE);
    if bytes > MAX_VOLUME_SIZE {
        return Err(DriverError::validation(format!(
            "requested size {} bytes exceeds the maximum of {} bytes",
            bytes, MAX_VOLUME_SIZE
        )));
    }

    let cylinders = bytes_to_cylinders(bytes);
    if range.limit_bytes > 0 && cylinders_to_bytes(cylinders) > range.limit_bytes {
        return Err(DriverError::validation(format!(
            "no whole number of cylinders fits between {} and {} bytes",
            bytes, range.limit_bytes
        )));
    }
    Ok(cylinders)
}

/// Snapshot a new volume is restored from, if the request names one.
/// Cloning from another volume is not offered.
fn requested_snapshot(source: Option<&csi::VolumeContentSource>) -> Result<Option<SnapshotId>> {
    use csi::volume_content_source::Type;

    let Some(source) = source else {
        return Ok(None);
    };
    match &source.r#type {
        Some(Type::Snapshot(snapshot)) => {
            if snapshot.snapshot_id.is_empty() {
                return Err(DriverError::validation("content source snapshot ID is required"));
            }
            Ok(Some(SnapshotId::decode(&snapshot.snapshot_id)?))
        }
        Some(Type::Volume(volume)) => Err(DriverError::validation(format!(
            "cannot clone from volume {}: volume cloning is not supported",
            volume.volume_id
        ))),
        None => Err(DriverError::validation("volume content source has no type")),
    }
}

/// Check a restore target against the snapshot size. The range itself is
/// validated by `requested_cylinders`.
fn check_restore_size(range: Option<&csi::CapacityRange>, snapshot_bytes: i64) -> Result<()> {
    let Some(range) = range else {
        return Ok(());
    };
    if snapshot_bytes < range.required_bytes
        || (range.limit_bytes > 0 && snapshot_bytes > range.limit_bytes)
    {
        return Err(DriverError::validation(format!(
            "snapshot size {} bytes is outside the requested range [{}, {}]",
            snapshot_bytes, range.required_bytes, range.limit_bytes
        )));
    }
    Ok(())
}

/// Reasons a capability set cannot be satisfied; empty when all are.
///
/// Block and mount access are supported. Multi-node writers are limited to
/// raw block volumes.
fn unsupported_capabilities(capabilities: &[csi::VolumeCapability]) -> Vec<String> {
    use csi::volume_capability::access_mode::Mode;

    let mut reasons = Vec::new();
    for cap in capabilities {
        let is_block = matches!(
            &cap.access_type,
            Some(csi::volume_capability::AccessType::Block(_))
        );
        if cap.access_type.is_none() {
            reasons.push("Volume capability must specify access type".to_string());
        }

        let Some(access_mode) = &cap.access_mode else {
            reasons.push("Volume capability must specify access mode".to_string());
            continue;
        };
        match Mode::try_from(access_mode.mode) {
            Ok(Mode::SingleNodeWriter)
            | Ok(Mode::SingleNodeReaderOnly)
            | Ok(Mode::MultiNodeReaderOnly)
            | Ok(Mode::SingleNodeSingleWriter)
            | Ok(Mode::SingleNodeMultiWriter) => {}
            Ok(Mode::MultiNodeSingleWriter) => {
                if !is_block {
                    reasons.push(
                        "MULTI_NODE_SINGLE_WRITER not supported for mount volumes".to_string(),
                    );
                }
            }
            Ok(Mode::MultiNodeMultiWriter) => {
                if !is_block {
                    reasons.push(
                        "MULTI_NODE_MULTI_WRITER not supported for mount volumes (requires cluster filesystem)"
                            .to_string(),
                    );
                }
            }
            Ok(Mode::Unknown) | Err(_) => {
                reasons.push(format!("Unknown access mode: {}", access_mode.mode));
            }
        }
    }
    reasons
}

fn is_already_exists(e: &ArrayError) -> bool {
    matches!(e, ArrayError::AlreadyExists { .. })
}

/// Removes a volume name from the in-flight set when the create finishes.
struct PendingCreate<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation and deferred deletion
/// - Publishing volumes to nodes through masking views
/// - Volume and snapshot listing
/// - Capacity and capability reporting
pub struct ControllerService {
    cluster_prefix: String,
    arrays: Arc<ArrayContext>,
    topology: TopologyManager,
    deletion: Arc<DeletionWorker>,
    /// Semaphore for rate limiting concurrent operations
    ops_semaphore: Semaphore,
    /// Maximum concurrent operations (for error messages)
    max_concurrent_ops: usize,
    /// Volume names with a CreateVolume in flight
    pending_creates: Mutex<HashSet<String>>,
}

impl ControllerService {
    pub fn new(
        config: &DriverConfig,
        arrays: Arc<ArrayContext>,
        deletion: Arc<DeletionWorker>,
    ) -> Self {
        let topology = TopologyManager::new(
            arrays.gateway().clone(),
            &config.cluster_prefix,
            PortGroupSelector::new(config.port_groups.clone()),
            config.empty_group_policy,
        );
        Self {
            cluster_prefix: config.cluster_prefix.clone(),
            arrays,
            topology,
            deletion,
            ops_semaphore: Semaphore::new(config.max_concurrent_ops),
            max_concurrent_ops: config.max_concurrent_ops,
            pending_creates: Mutex::new(HashSet::new()),
        }
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn deletion_worker(&self) -> &Arc<DeletionWorker> {
        &self.deletion
    }

    /// Acquire rate limiting permit, returning ResourceExhausted if too many concurrent ops
    fn acquire_permit(
        &self,
        operation: &str,
    ) -> std::result::Result<tokio::sync::SemaphorePermit<'_>, Status> {
        match self.ops_semaphore.try_acquire() {
            Ok(permit) => {
                let current_ops = self.max_concurrent_ops - self.ops_semaphore.available_permits();
                metrics::set_concurrent_ops(current_ops);
                Ok(permit)
            }
            Err(_) => {
                warn!(
                    "Rate limit exceeded: {} concurrent operations already in progress",
                    self.max_concurrent_ops
                );
                metrics::record_rate_limited(operation);
                Err(Status::resource_exhausted(format!(
                    "Too many concurrent operations (max: {}). Please retry later.",
                    self.max_concurrent_ops
                )))
            }
        }
    }

    fn begin_create(&self, name: &str) -> std::result::Result<PendingCreate<'_>, Status> {
        let mut pending = self
            .pending_creates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !pending.insert(name.to_string()) {
            warn!(name = %name, "CreateVolume already in progress");
            return Err(Status::aborted(format!(
                "an operation is already pending for volume {}",
                name
            )));
        }
        Ok(PendingCreate {
            pending: &self.pending_creates,
            name: name.to_string(),
        })
    }

    /// Convert a driver error into a status and record the failed operation.
    fn fail(timer: OperationTimer, error: DriverError) -> Status {
        let status = Status::from(error);
        warn!(code = ?status.code(), message = %status.message(), "Operation failed");
        timer.failure(&status.code().to_string());
        status
    }

    fn finish<T>(timer: OperationTimer, result: Result<T>) -> std::result::Result<Response<T>, Status> {
        match result {
            Ok(response) => {
                timer.success();
                Ok(Response::new(response))
            }
            Err(e) => Err(Self::fail(timer, e)),
        }
    }

    /// Identifier prefix of every volume this cluster owns.
    fn owned_volume_prefix(&self) -> String {
        volume_identifier(&self.cluster_prefix, "")
    }

    fn owned_snapshot_prefix(&self) -> String {
        snapshot_identifier(&self.cluster_prefix, "")
    }

    /// Fetch the device behind `id`, checking it still carries the
    /// identifier encoded in the ID.
    async fn resolve_volume(&self, id: &VolumeId) -> Result<Volume> {
        match self
            .arrays
            .gateway()
            .get_volume(id.array_id(), id.device_id())
            .await
        {
            Ok(volume) if volume.identifier == id.array_identifier() => Ok(volume),
            Ok(volume) => Err(DriverError::NotFound(format!(
                "device {} on array {} carries identifier '{}', not '{}'",
                id.device_id(),
                id.array_id(),
                volume.identifier,
                id.array_identifier()
            ))),
            Err(e) if e.is_missing(ObjectKind::Volume) => {
                Err(DriverError::NotFound(format!("volume {} does not exist", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_volume_by_identifier(
        &self,
        array_id: &str,
        identifier: &str,
    ) -> Result<Option<Volume>> {
        let volumes = self.arrays.gateway().list_volumes(array_id).await?;
        Ok(volumes.into_iter().find(|v| v.identifier == identifier))
    }

    /// Volume context of an existing device, read from its provisioning
    /// storage group.
    async fn existing_volume_context(
        &self,
        array_id: &str,
        volume: &Volume,
    ) -> Result<HashMap<String, String>> {
        let mut context = HashMap::new();
        context.insert(PARAM_ARRAY.to_string(), array_id.to_string());
        for group_id in &volume.storage_groups {
            let group = self
                .arrays
                .gateway()
                .get_storage_group(array_id, group_id)
                .await?;
            if let Some(pool) = group.storage_pool {
                context.insert(PARAM_STORAGE_POOL.to_string(), pool);
                context.insert(
                    PARAM_SERVICE_LEVEL.to_string(),
                    group.service_level.unwrap_or_default(),
                );
                context.insert(PARAM_STORAGE_GROUP.to_string(), group.id);
                break;
            }
        }
        Ok(context)
    }

    fn csi_volume(
        id: &VolumeId,
        volume: &Volume,
        context: HashMap<String, String>,
        content_source: Option<csi::VolumeContentSource>,
    ) -> csi::Volume {
        csi::Volume {
            capacity_bytes: volume.capacity_bytes(),
            volume_id: id.to_string(),
            volume_context: context,
            content_source,
            accessible_topology: vec![],
        }
    }

    fn csi_snapshot(
        &self,
        array_id: &str,
        source: &VolumeId,
        name: &str,
        snapshot: &Snapshot,
    ) -> Result<csi::Snapshot> {
        let snapshot_id = SnapshotId::new(
            &self.cluster_prefix,
            name,
            array_id,
            &snapshot.source_device_id,
        )?;
        Ok(csi::Snapshot {
            size_bytes: cylinders_to_bytes(snapshot.size_cylinders),
            snapshot_id: snapshot_id.to_string(),
            source_volume_id: source.to_string(),
            creation_time: Some(Timestamp {
                seconds: snapshot.created_at,
                nanos: 0,
            }),
            ready_to_use: true,
            group_snapshot_id: String::new(),
        })
    }

    /// Find the snapshot a volume is restored from and check it lives on
    /// the requested array and storage pool.
    async fn resolve_restore_source(
        &self,
        source: &SnapshotId,
        params: &VolumeParameters,
    ) -> Result<Snapshot> {
        let array_id = params.array_id.as_str();
        if source.array_id() != array_id {
            return Err(DriverError::validation(format!(
                "snapshot {} is on array {}, volume requested on array {}",
                source,
                source.array_id(),
                array_id
            )));
        }
        let name = source.array_identifier();
        let snapshot = self
            .arrays
            .gateway()
            .list_snapshots(array_id)
            .await?
            .into_iter()
            .find(|s| s.name == name && s.source_device_id == source.source_device_id())
            .ok_or_else(|| DriverError::NotFound(format!("snapshot {} does not exist", source)))?;

        let volume = self
            .arrays
            .gateway()
            .get_volume(array_id, source.source_device_id())
            .await?;
        let context = self.existing_volume_context(array_id, &volume).await?;
        let pool = context.get(PARAM_STORAGE_POOL);
        if let Some(pool) = pool.filter(|p| **p != params.storage_pool) {
            return Err(DriverError::validation(format!(
                "snapshot {} is in storage pool {}, volume requested in {}",
                source, pool, params.storage_pool
            )));
        }
        Ok(snapshot)
    }

    async fn create_volume_inner(&self, req: &csi::CreateVolumeRequest) -> Result<csi::Volume> {
        if req.name.is_empty() {
            return Err(DriverError::validation("Volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::validation("Volume capabilities are required"));
        }
        let reasons = unsupported_capabilities(&req.volume_capabilities);
        if !reasons.is_empty() {
            return Err(DriverError::validation(reasons.join("; ")));
        }
        let params = VolumeParameters::parse(&req.parameters)?;
        let reserved = format!("csi-{}-", self.cluster_prefix);
        if let Some(group) = params.storage_group.as_ref().filter(|g| g.starts_with(&reserved)) {
            return Err(DriverError::validation(format!(
                "storage group {} uses the reserved {} prefix",
                group, reserved
            )));
        }
        let mut cylinders = requested_cylinders(req.capacity_range.as_ref())?;
        let restore_source = requested_snapshot(req.volume_content_source.as_ref())?;
        let identifier = volume_identifier(&self.cluster_prefix, &req.name);
        let array_id = params.array_id.as_str();
        let gateway = self.arrays.gateway();

        self.arrays.ensure_logged_in(array_id).await?;

        let restore = match &restore_source {
            Some(source) => {
                let snapshot = self.resolve_restore_source(source, &params).await?;
                check_restore_size(
                    req.capacity_range.as_ref(),
                    cylinders_to_bytes(snapshot.size_cylinders),
                )?;
                cylinders = snapshot.size_cylinders;
                Some((source, snapshot))
            }
            None => None,
        };

        if let Some(existing) = self.find_volume_by_identifier(array_id, &identifier).await? {
            if existing.capacity_cylinders != cylinders {
                return Err(DriverError::AlreadyExists(format!(
                    "volume {} exists with {} cylinders, {} requested",
                    req.name, existing.capacity_cylinders, cylinders
                )));
            }
            info!(name = %req.name, device_id = %existing.device_id, "Volume already exists");
            let id = VolumeId::new(&self.cluster_prefix, &req.name, array_id, &existing.device_id)?;
            let context = self.existing_volume_context(array_id, &existing).await?;
            return Ok(Self::csi_volume(
                &id,
                &existing,
                context,
                req.volume_content_source.clone(),
            ));
        }

        let service_levels = gateway.list_service_levels(array_id).await?;
        if !service_levels.iter().any(|l| *l == params.service_level) {
            return Err(DriverError::validation(format!(
                "service level {} is not offered by array {} (valid: {})",
                params.service_level,
                array_id,
                service_levels.join(", ")
            )));
        }

        let group_id = params.storage_group_id(&self.cluster_prefix);
        let group = gateway
            .get_or_create_storage_group(
                array_id,
                &group_id,
                Some(params.storage_pool.as_str()),
                Some(params.service_level.as_str()),
            )
            .await?;
        debug!(storage_group = %group.id, "Provisioning storage group ready");

        let spec = VolumeSpec {
            identifier,
            capacity_cylinders: cylinders,
            storage_group_id: group.id.clone(),
        };
        let volume = match restore {
            Some((source, snapshot)) => {
                info!(
                    name = %req.name,
                    snapshot_id = %source,
                    "Restoring volume from snapshot"
                );
                gateway
                    .create_volume_from_snapshot(
                        array_id,
                        &spec,
                        &snapshot.source_device_id,
                        &snapshot.name,
                    )
                    .await?
            }
            None => gateway.create_volume(array_id, &spec).await?,
        };

        let id = VolumeId::new(&self.cluster_prefix, &req.name, array_id, &volume.device_id)?;
        let context = HashMap::from([
            (PARAM_ARRAY.to_string(), params.array_id.clone()),
            (PARAM_STORAGE_POOL.to_string(), params.storage_pool.clone()),
            (PARAM_SERVICE_LEVEL.to_string(), params.service_level.clone()),
            (PARAM_STORAGE_GROUP.to_string(), group.id),
        ]);
        Ok(Self::csi_volume(
            &id,
            &volume,
            context,
            req.volume_content_source.clone(),
        ))
    }

    async fn delete_volume_inner(&self, req: &csi::DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::validation("Volume ID is required"));
        }
        let id = VolumeId::decode(&req.volume_id)?;
        let array_id = id.array_id();
        let device_id = id.device_id();
        let gateway = self.arrays.gateway();

        self.arrays.ensure_logged_in(array_id).await?;

        let volume = match gateway.get_volume(array_id, device_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_missing(ObjectKind::Volume) => {
                warn!(volume_id = %id, "Volume not found, treating as already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let identifier = id.array_identifier();
        let marked = mark_for_deletion(&identifier);
        if volume.identifier != identifier && volume.identifier != marked {
            warn!(
                volume_id = %id,
                identifier = %volume.identifier,
                "Device belongs to another volume, treating as already deleted"
            );
            return Ok(());
        }

        for group_id in &volume.storage_groups {
            let group = gateway.get_storage_group(array_id, group_id).await?;
            if group.is_masked() {
                return Err(DriverError::InUse(format!(
                    "volume {} is published through masking view(s) {}",
                    id,
                    group.masking_views.join(", ")
                )));
            }
        }

        if volume.identifier == identifier {
            gateway.rename_volume(array_id, device_id, &marked).await?;
            debug!(volume_id = %id, identifier = %marked, "Marked volume for deletion");
        }

        self.deletion.request_deletion(DeletionRequest::new(
            array_id,
            device_id,
            &identifier,
            volume.capacity_cylinders,
        ));
        Ok(())
    }

    async fn publish_inner(
        &self,
        req: &csi::ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>> {
        if req.volume_id.is_empty() {
            return Err(DriverError::validation("Volume ID is required"));
        }
        if req.node_id.is_empty() {
            return Err(DriverError::validation("Node ID is required"));
        }
        let Some(capability) = &req.volume_capability else {
            return Err(DriverError::validation("Volume capability is required"));
        };
        let reasons = unsupported_capabilities(std::slice::from_ref(capability));
        if !reasons.is_empty() {
            return Err(DriverError::validation(reasons.join("; ")));
        }
        let id = VolumeId::decode(&req.volume_id)?;

        self.arrays.ensure_logged_in(id.array_id()).await?;
        let volume = self.resolve_volume(&id).await?;

        let topology = self
            .topology
            .ensure_publish_topology(id.array_id(), &req.node_id, id.device_id(), &[])
            .await?;
        let view = MaskingView {
            id: topology.masking_view_id,
            storage_group_id: topology.storage_group_id,
            host_id: topology.host_id,
            port_group_id: topology.port_group_id,
        };
        let targets = self
            .topology
            .targets_for_masking_view(id.array_id(), &view)
            .await?;

        let mut context = HashMap::new();
        context.insert(PUBLISH_CONTEXT_WWN.to_string(), volume.wwn);
        if !targets.is_empty() {
            let joined: Vec<String> = targets.iter().map(ToString::to_string).collect();
            context.insert(PUBLISH_CONTEXT_TARGETS.to_string(), joined.join(";"));
        }
        Ok(context)
    }

    async fn unpublish_inner(&self, req: &csi::ControllerUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(DriverError::validation("Volume ID is required"));
        }
        if req.node_id.is_empty() {
            return Err(DriverError::validation("Node ID is required"));
        }
        let id = VolumeId::decode(&req.volume_id)?;

        self.arrays.ensure_logged_in(id.array_id()).await?;
        match self.resolve_volume(&id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %id, "Volume not found, treating as unpublished");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let removed = self
            .topology
            .teardown_publish_topology(id.array_id(), &req.node_id, id.device_id())
            .await?;
        if !removed {
            debug!(volume_id = %id, node_id = %req.node_id, "Volume was not published to node");
        }
        Ok(())
    }

    async fn validate_inner(
        &self,
        req: &csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(DriverError::validation("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(DriverError::validation("Volume capabilities are required"));
        }
        let id = VolumeId::decode(&req.volume_id)?;

        self.arrays.ensure_logged_in(id.array_id()).await?;
        let volume = self.resolve_volume(&id).await?;

        let mut reasons = unsupported_capabilities(&req.volume_capabilities);
        let context = self.existing_volume_context(id.array_id(), &volume).await?;
        for key in [PARAM_ARRAY, PARAM_STORAGE_POOL, PARAM_SERVICE_LEVEL] {
            let Some(requested) = req.parameters.get(key) else {
                continue;
            };
            if context.get(key) != Some(requested) {
                reasons.push(format!(
                    "{} {} does not match the volume's {}",
                    key,
                    requested,
                    context.get(key).map(String::as_str).unwrap_or("(none)")
                ));
            }
        }

        if !reasons.is_empty() {
            let message = reasons.join("; ");
            warn!(volume_id = %id, message = %message, "Volume capabilities not supported");
            return Ok(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            });
        }

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context.clone(),
                volume_capabilities: req.volume_capabilities.clone(),
                parameters: req.parameters.clone(),
                mutable_parameters: req.mutable_parameters.clone(),
            }),
            message: String::new(),
        })
    }

    async fn list_volumes_inner(
        &self,
        req: &csi::ListVolumesRequest,
    ) -> Result<csi::ListVolumesResponse> {
        let owned = self.owned_volume_prefix();
        let mut arrays = self.arrays.permitted_arrays().await?;
        arrays.sort();

        let mut entries = Vec::new();
        for array_id in &arrays {
            self.arrays.ensure_logged_in(array_id).await?;
            let mut volumes = self.arrays.gateway().list_volumes(array_id).await?;
            volumes.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            for volume in volumes {
                let Some(name) = volume.identifier.strip_prefix(&owned) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let id = VolumeId::new(&self.cluster_prefix, name, array_id, &volume.device_id)?;
                let context = HashMap::from([(PARAM_ARRAY.to_string(), array_id.clone())]);
                entries.push(csi::list_volumes_response::Entry {
                    volume: Some(Self::csi_volume(&id, &volume, context, None)),
                    status: None,
                });
            }
        }

        let page = paginate(entries, req.max_entries, &req.starting_token)?;
        Ok(csi::ListVolumesResponse {
            entries: page.entries,
            next_token: page.next_token,
        })
    }

    async fn get_capacity_inner(
        &self,
        req: &csi::GetCapacityRequest,
    ) -> Result<csi::GetCapacityResponse> {
        let array_id = req
            .parameters
            .get(PARAM_ARRAY)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DriverError::validation(format!("parameter {} is required", PARAM_ARRAY)))?;
        let pool_id = req
            .parameters
            .get(PARAM_STORAGE_POOL)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                DriverError::validation(format!("parameter {} is required", PARAM_STORAGE_POOL))
            })?;

        self.arrays.ensure_logged_in(array_id).await?;
        let pool = self
            .arrays
            .gateway()
            .get_storage_pool(array_id, pool_id)
            .await?;

        Ok(csi::GetCapacityResponse {
            available_capacity: cylinders_to_bytes(pool.available_cylinders()),
            maximum_volume_size: Some(MAX_VOLUME_SIZE),
            minimum_volume_size: Some(MIN_VOLUME_SIZE),
        })
    }

    async fn create_snapshot_inner(
        &self,
        req: &csi::CreateSnapshotRequest,
    ) -> Result<csi::Snapshot> {
        if req.source_volume_id.is_empty() {
            return Err(DriverError::validation("Source volume ID is required"));
        }
        if req.name.is_empty() {
            return Err(DriverError::validation("Snapshot name is required"));
        }
        let source = VolumeId::decode(&req.source_volume_id)?;
        let array_id = source.array_id();
        let gateway = self.arrays.gateway();

        self.arrays.ensure_logged_in(array_id).await?;
        self.resolve_volume(&source).await?;

        let snapshot_name = snapshot_identifier(&self.cluster_prefix, &req.name);
        let existing = gateway
            .list_snapshots(array_id)
            .await?
            .into_iter()
            .find(|s| s.name == snapshot_name);

        let snapshot = match existing {
            Some(s) if s.source_device_id == source.device_id() => {
                info!(name = %req.name, "Snapshot already exists");
                s
            }
            Some(s) => {
                return Err(DriverError::AlreadyExists(format!(
                    "snapshot {} already exists for device {}",
                    req.name, s.source_device_id
                )));
            }
            None => match gateway
                .create_snapshot(array_id, source.device_id(), &snapshot_name)
                .await
            {
                Ok(s) => s,
                Err(e) if is_already_exists(&e) => gateway
                    .list_snapshots(array_id)
                    .await?
                    .into_iter()
                    .find(|s| s.name == snapshot_name && s.source_device_id == source.device_id())
                    .ok_or_else(|| DriverError::Array(e))?,
                Err(e) => return Err(e.into()),
            },
        };

        self.csi_snapshot(array_id, &source, &req.name, &snapshot)
    }

    async fn delete_snapshot_inner(&self, req: &csi::DeleteSnapshotRequest) -> Result<()> {
        if req.snapshot_id.is_empty() {
            return Err(DriverError::validation("Snapshot ID is required"));
        }
        let id = SnapshotId::decode(&req.snapshot_id)?;

        self.arrays.ensure_logged_in(id.array_id()).await?;
        match self
            .arrays
            .gateway()
            .delete_snapshot(id.array_id(), id.source_device_id(), &id.array_identifier())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(snapshot_id = %id, "Snapshot not found, treating as already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_snapshots_inner(
        &self,
        req: &csi::ListSnapshotsRequest,
    ) -> Result<csi::ListSnapshotsResponse> {
        let empty = csi::ListSnapshotsResponse {
            entries: vec![],
            next_token: String::new(),
        };

        // An ID that does not decode matches nothing
        let snapshot_filter = if req.snapshot_id.is_empty() {
            None
        } else {
            match SnapshotId::decode(&req.snapshot_id) {
                Ok(id) => Some(id),
                Err(_) => return Ok(empty),
            }
        };
        let source_filter = if req.source_volume_id.is_empty() {
            None
        } else {
            match VolumeId::decode(&req.source_volume_id) {
                Ok(id) => Some(id),
                Err(_) => return Ok(empty),
            }
        };

        let mut arrays = match (&snapshot_filter, &source_filter) {
            (Some(id), _) => vec![id.array_id().to_string()],
            (None, Some(id)) => vec![id.array_id().to_string()],
            (None, None) => self.arrays.permitted_arrays().await?,
        };
        arrays.sort();

        let owned_volumes = self.owned_volume_prefix();
        let owned_snapshots = self.owned_snapshot_prefix();
        let mut entries = Vec::new();
        for array_id in &arrays {
            if !self.arrays.is_permitted(array_id).await {
                continue;
            }
            self.arrays.ensure_logged_in(array_id).await?;
            let gateway = self.arrays.gateway();

            let names: HashMap<String, String> = gateway
                .list_volumes(array_id)
                .await?
                .into_iter()
                .filter_map(|v| {
                    let identifier = strip_deletion_marker(&v.identifier).unwrap_or(v.identifier.as_str());
                    let name = identifier.strip_prefix(&owned_volumes)?;
                    (!name.is_empty()).then(|| (v.device_id.clone(), name.to_string()))
                })
                .collect();

            let mut snapshots = gateway.list_snapshots(array_id).await?;
            snapshots.sort_by(|a, b| {
                (&a.source_device_id, &a.name).cmp(&(&b.source_device_id, &b.name))
            });
            for snapshot in snapshots {
                let Some(name) = snapshot.name.strip_prefix(&owned_snapshots) else {
                    continue;
                };
                let Some(volume_name) = names.get(&snapshot.source_device_id) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let source = VolumeId::new(
                    &self.cluster_prefix,
                    volume_name,
                    array_id,
                    &snapshot.source_device_id,
                )?;
                if source_filter.as_ref().is_some_and(|f| *f != source) {
                    continue;
                }
                let entry = self.csi_snapshot(array_id, &source, name, &snapshot)?;
                if snapshot_filter
                    .as_ref()
                    .is_some_and(|f| f.to_string() != entry.snapshot_id)
                {
                    continue;
                }
                entries.push(csi::list_snapshots_response::Entry {
                    snapshot: Some(entry),
                });
            }
        }

        let page = paginate(entries, req.max_entries, &req.starting_token)?;
        Ok(csi::ListSnapshotsResponse {
            entries: page.entries,
            next_token: page.next_token,
        })
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    #[instrument(skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();
        let _permit = self.acquire_permit("create_volume")?;
        let _pending = self.begin_create(&req.name)?;

        info!(name = %req.name, "CreateVolume request");

        let result = self
            .arrays
            .with_timeout("CreateVolume", self.create_volume_inner(&req))
            .await
            .map(|volume| {
                info!(
                    volume_id = %volume.volume_id,
                    capacity_bytes = volume.capacity_bytes,
                    "Volume created successfully"
                );
                csi::CreateVolumeResponse {
                    volume: Some(volume),
                }
            });
        Self::finish(timer, result)
    }

    /// Mark a volume for deletion and queue it for reclamation.
    #[instrument(skip(self, request))]
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let _permit = self.acquire_permit("delete_volume")?;

        info!(volume_id = %req.volume_id, "DeleteVolume request");

        let result = self
            .arrays
            .with_timeout("DeleteVolume", self.delete_volume_inner(&req))
            .await
            .map(|()| {
                info!(volume_id = %req.volume_id, "Volume queued for deletion");
                csi::DeleteVolumeResponse {}
            });
        Self::finish(timer, result)
    }

    /// Expand a volume (not implemented).
    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerExpandVolume is not supported",
        ))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    #[instrument(skip(self, request))]
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let req = request.into_inner();
        let _permit = self.acquire_permit("create_snapshot")?;

        info!(
            source_volume_id = %req.source_volume_id,
            name = %req.name,
            "CreateSnapshot request"
        );

        let result = self
            .arrays
            .with_timeout("CreateSnapshot", self.create_snapshot_inner(&req))
            .await
            .map(|snapshot| {
                info!(snapshot_id = %snapshot.snapshot_id, "Snapshot created successfully");
                csi::CreateSnapshotResponse {
                    snapshot: Some(snapshot),
                }
            });
        Self::finish(timer, result)
    }

    /// Delete a snapshot.
    #[instrument(skip(self, request))]
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let req = request.into_inner();
        let _permit = self.acquire_permit("delete_snapshot")?;

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");

        let result = self
            .arrays
            .with_timeout("DeleteSnapshot", self.delete_snapshot_inner(&req))
            .await
            .map(|()| csi::DeleteSnapshotResponse {});
        Self::finish(timer, result)
    }

    /// Validate volume capabilities.
    ///
    /// Returns "confirmed" only if every requested capability is supported
    /// and any storage parameters given match the volume.
    #[instrument(skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let timer = OperationTimer::new("validate_volume_capabilities");
        let req = request.into_inner();

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        let result = self
            .arrays
            .with_timeout("ValidateVolumeCapabilities", self.validate_inner(&req))
            .await;
        Self::finish(timer, result)
    }

    /// Publish a volume to a node through the node's masking view.
    #[instrument(skip(self, request))]
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_publish_volume");
        let req = request.into_inner();
        let _permit = self.acquire_permit("controller_publish_volume")?;

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerPublishVolume request");

        let result = self
            .arrays
            .with_timeout("ControllerPublishVolume", self.publish_inner(&req))
            .await
            .map(|publish_context| {
                info!(volume_id = %req.volume_id, node_id = %req.node_id, "Volume published");
                csi::ControllerPublishVolumeResponse { publish_context }
            });
        Self::finish(timer, result)
    }

    /// Remove a volume from a node's storage group.
    #[instrument(skip(self, request))]
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_unpublish_volume");
        let req = request.into_inner();
        let _permit = self.acquire_permit("controller_unpublish_volume")?;

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerUnpublishVolume request");

        let result = self
            .arrays
            .with_timeout("ControllerUnpublishVolume", self.unpublish_inner(&req))
            .await
            .map(|()| csi::ControllerUnpublishVolumeResponse {});
        Self::finish(timer, result)
    }

    /// List volumes owned by this cluster across permitted arrays.
    #[instrument(skip(self, request))]
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        let timer = OperationTimer::new("list_volumes");
        let req = request.into_inner();

        info!(
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListVolumes request"
        );

        let result = self
            .arrays
            .with_timeout("ListVolumes", self.list_volumes_inner(&req))
            .await;
        if let Ok(response) = &result {
            info!(count = response.entries.len(), "ListVolumes completed");
        }
        Self::finish(timer, result)
    }

    /// Free capacity of a storage pool.
    #[instrument(skip(self, request))]
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        let timer = OperationTimer::new("get_capacity");
        let req = request.into_inner();

        info!(parameters = ?req.parameters, "GetCapacity request");

        let result = self
            .arrays
            .with_timeout("GetCapacity", self.get_capacity_inner(&req))
            .await;
        if let Ok(response) = &result {
            info!(available_capacity = response.available_capacity, "GetCapacity completed");
        }
        Self::finish(timer, result)
    }

    /// List snapshots.
    ///
    /// Returns snapshots with optional filtering by snapshot or source volume
    /// and pagination.
    #[instrument(skip(self, request))]
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        let timer = OperationTimer::new("list_snapshots");
        let req = request.into_inner();

        info!(
            source_volume_id = %req.source_volume_id,
            snapshot_id = %req.snapshot_id,
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListSnapshots request"
        );

        let result = self
            .arrays
            .with_timeout("ListSnapshots", self.list_snapshots_inner(&req))
            .await;
        if let Ok(response) = &result {
            info!(count = response.entries.len(), "ListSnapshots completed");
        }
        Self::finish(timer, result)
    }

    /// Get volume (not implemented).
    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerGetVolume is not supported",
        ))
    }
}
