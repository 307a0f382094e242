//! Block Array CSI Driver Library
//!
//! Controller side of a Kubernetes CSI driver for a networked block-storage
//! array. Volume and snapshot requests are translated into operations on
//! the array's object model (storage pools, storage groups, hosts, port
//! groups, masking views and asynchronous jobs) through the
//! [`array_gateway::ArrayGateway`] contract.
//!
//! This library provides:
//! - CSI Identity and Controller service implementations
//! - The composite volume/snapshot identifier codec
//! - Masking topology management and port group selection
//! - Cursor pagination for list RPCs
//! - The background volume deletion worker

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod arrays;
pub mod config;
pub mod controller;
pub mod deletion;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod pagination;
pub mod port_group;
pub mod topology;
pub mod volume_id;

pub use arrays::ArrayContext;
pub use config::DriverConfig;
pub use controller::ControllerService;
pub use deletion::{DeletionConfig, DeletionRequest, DeletionWorker};
pub use error::{DriverError, Result};
pub use identity::IdentityService;
pub use topology::{EmptyGroupPolicy, TopologyManager};
pub use volume_id::{SnapshotId, VolumeId, decode_volume_id, encode_volume_id};
