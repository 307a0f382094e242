//! The narrow operation set the driver needs from the array management API.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Host, HostType, Job, JobId, MaskingView, Port, PortGroup, PortKey, Snapshot, StorageGroup,
    StoragePool, Volume, VolumeSpec,
};

/// Array management API as seen by the driver.
///
/// Every call is scoped to one array. Implementations must be safe to share
/// between concurrently running RPC handlers and the deletion worker.
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Array IDs visible through the management endpoint.
    async fn list_arrays(&self) -> Result<Vec<String>>;

    /// Establish an authenticated session for the array.
    async fn login(&self, array_id: &str) -> Result<()>;

    async fn logout(&self, array_id: &str) -> Result<()>;

    // ------------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------------

    async fn get_volume(&self, array_id: &str, device_id: &str) -> Result<Volume>;

    /// All devices on the array, ordered by device ID.
    async fn list_volumes(&self, array_id: &str) -> Result<Vec<Volume>>;

    /// Create a device and place it in `spec.storage_group_id`.
    async fn create_volume(&self, array_id: &str, spec: &VolumeSpec) -> Result<Volume>;

    /// Create a device from the contents of snapshot `snapshot_name` taken
    /// of `source_device_id`. The target size must equal the snapshot size.
    async fn create_volume_from_snapshot(
        &self,
        array_id: &str,
        spec: &VolumeSpec,
        source_device_id: &str,
        snapshot_name: &str,
    ) -> Result<Volume>;

    /// Change the identifier stored on the device.
    async fn rename_volume(
        &self,
        array_id: &str,
        device_id: &str,
        identifier: &str,
    ) -> Result<Volume>;

    /// Start deleting a device. The device must not belong to any storage
    /// group. Returns the job tracking the deletion.
    async fn delete_volume(&self, array_id: &str, device_id: &str) -> Result<JobId>;

    async fn get_job(&self, array_id: &str, job_id: &str) -> Result<Job>;

    // ------------------------------------------------------------------------
    // Storage groups
    // ------------------------------------------------------------------------

    async fn get_storage_group(&self, array_id: &str, group_id: &str) -> Result<StorageGroup>;

    /// Return the group, creating it with the given pool and service level
    /// if it does not exist. An existing group is returned unchanged.
    async fn get_or_create_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        storage_pool: Option<&str>,
        service_level: Option<&str>,
    ) -> Result<StorageGroup>;

    /// Delete an empty storage group that no masking view references.
    async fn delete_storage_group(&self, array_id: &str, group_id: &str) -> Result<()>;

    async fn add_volume_to_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        device_id: &str,
    ) -> Result<()>;

    async fn remove_volume_from_storage_group(
        &self,
        array_id: &str,
        group_id: &str,
        device_id: &str,
    ) -> Result<()>;

    // ------------------------------------------------------------------------
    // Hosts and masking
    // ------------------------------------------------------------------------

    async fn get_host(&self, array_id: &str, host_id: &str) -> Result<Host>;

    async fn create_host(
        &self,
        array_id: &str,
        host_id: &str,
        host_type: HostType,
        initiators: &[String],
    ) -> Result<Host>;

    /// Add initiators to an existing host. Initiators already present are
    /// left alone.
    async fn add_host_initiators(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: &[String],
    ) -> Result<Host>;

    async fn get_masking_view(&self, array_id: &str, view_id: &str) -> Result<MaskingView>;

    async fn create_masking_view(&self, array_id: &str, view: &MaskingView) -> Result<MaskingView>;

    async fn delete_masking_view(&self, array_id: &str, view_id: &str) -> Result<()>;

    async fn list_port_groups(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_port_group(&self, array_id: &str, group_id: &str) -> Result<PortGroup>;

    async fn get_port(&self, array_id: &str, key: &PortKey) -> Result<Port>;

    // ------------------------------------------------------------------------
    // Capacity and service levels
    // ------------------------------------------------------------------------

    async fn get_storage_pool(&self, array_id: &str, pool_id: &str) -> Result<StoragePool>;

    async fn list_service_levels(&self, array_id: &str) -> Result<Vec<String>>;

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    async fn create_snapshot(
        &self,
        array_id: &str,
        source_device_id: &str,
        name: &str,
    ) -> Result<Snapshot>;

    async fn delete_snapshot(
        &self,
        array_id: &str,
        source_device_id: &str,
        name: &str,
    ) -> Result<()>;

    async fn list_snapshots(&self, array_id: &str) -> Result<Vec<Snapshot>>;
}
