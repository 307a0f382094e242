//! Masking topology management.
//!
//! A compute node reaches a volume through three array objects: a host
//! holding the node's initiators, a storage group holding the volumes
//! published to the node, and a masking view binding the two to a port
//! group. Their names are derived from the node name alone, so every
//! controller instance computes the same triple for the same node.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use array_gateway::{ArrayGateway, Host, HostType, MaskingView, ObjectKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::port_group::PortGroupSelector;

const HOST_PREFIX: &str = "csi-node";
const STORAGE_GROUP_SUFFIX: &str = "-SG";
const MASKING_VIEW_SUFFIX: &str = "-MV";

/// What unpublish does with a node storage group it leaves empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyGroupPolicy {
    /// Keep the group and its masking view for the next publish
    #[default]
    Retain,
    /// Remove the masking view and then the group
    Delete,
}

impl FromStr for EmptyGroupPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(EmptyGroupPolicy::Retain),
            "delete" => Ok(EmptyGroupPolicy::Delete),
            other => Err(format!("unknown empty group policy '{}'", other)),
        }
    }
}

impl fmt::Display for EmptyGroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyGroupPolicy::Retain => write!(f, "retain"),
            EmptyGroupPolicy::Delete => write!(f, "delete"),
        }
    }
}

/// Array object names derived from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    pub host_id: String,
    pub storage_group_id: String,
    pub masking_view_id: String,
}

/// The objects granting a node access to its volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskingTopology {
    pub host_id: String,
    pub storage_group_id: String,
    pub masking_view_id: String,
    pub port_group_id: String,
}

/// An iSCSI target reachable through a masking view.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IscsiTarget {
    pub target: String,
    pub portal: String,
}

impl fmt::Display for IscsiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.portal, self.target)
    }
}

/// Classify a set of initiators. All must be of one protocol.
pub fn host_type_for(initiators: &[String]) -> Result<HostType> {
    let mut detected = None;
    for initiator in initiators {
        let Some(kind) = HostType::of_initiator(initiator) else {
            return Err(DriverError::validation(format!(
                "initiator '{}' is neither an iSCSI name nor a WWPN",
                initiator
            )));
        };
        match detected {
            None => detected = Some(kind),
            Some(existing) if existing != kind => {
                return Err(DriverError::validation(
                    "iSCSI and Fibre Channel initiators cannot share a host",
                ));
            }
            Some(_) => {}
        }
    }
    detected.ok_or_else(|| DriverError::configuration("at least one initiator is required"))
}

pub struct TopologyManager {
    gateway: Arc<dyn ArrayGateway>,
    cluster_prefix: String,
    port_groups: PortGroupSelector,
    empty_group_policy: EmptyGroupPolicy,
}

impl TopologyManager {
    pub fn new(
        gateway: Arc<dyn ArrayGateway>,
        cluster_prefix: &str,
        port_groups: PortGroupSelector,
        empty_group_policy: EmptyGroupPolicy,
    ) -> Self {
        Self {
            gateway,
            cluster_prefix: cluster_prefix.to_string(),
            port_groups,
            empty_group_policy,
        }
    }

    /// Host name for a node: `csi-node-{prefix}-{node}`.
    pub fn host_id(&self, node_id: &str) -> String {
        format!("{}-{}-{}", HOST_PREFIX, self.cluster_prefix, node_id)
    }

    pub fn names(&self, node_id: &str) -> TopologyNames {
        let host_id = self.host_id(node_id);
        TopologyNames {
            storage_group_id: format!("{}{}", host_id, STORAGE_GROUP_SUFFIX),
            masking_view_id: format!("{}{}", host_id, MASKING_VIEW_SUFFIX),
            host_id,
        }
    }

    /// Return the host, creating it with `initiators` if it is missing.
    ///
    /// An existing host gains any initiator it lacks. Initiators it already
    /// has are never removed.
    #[instrument(skip(self, initiators))]
    pub async fn get_or_create_host(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: &[String],
    ) -> Result<Host> {
        if host_id.is_empty() {
            return Err(DriverError::configuration("host ID must not be empty"));
        }
        if initiators.is_empty() {
            return Err(DriverError::configuration(format!(
                "host {} needs at least one initiator",
                host_id
            )));
        }
        let host_type = host_type_for(initiators)?;

        match self.gateway.get_host(array_id, host_id).await {
            Ok(host) => {
                if host.host_type != host_type {
                    warn!(
                        host_id = %host_id,
                        existing = %host.host_type,
                        requested = %host_type,
                        "Host protocol differs from requested initiators"
                    );
                }
                let missing: Vec<String> = initiators
                    .iter()
                    .filter(|i| !host.initiators.contains(i))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    debug!(host_id = %host_id, "Host initiators already up to date");
                    return Ok(host);
                }
                info!(host_id = %host_id, added = ?missing, "Adding initiators to host");
                Ok(self
                    .gateway
                    .add_host_initiators(array_id, host_id, &missing)
                    .await?)
            }
            Err(e) if e.is_missing(ObjectKind::Host) => {
                info!(host_id = %host_id, host_type = %host_type, "Creating host");
                Ok(self
                    .gateway
                    .create_host(array_id, host_id, host_type, initiators)
                    .await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the node's host, storage group and masking view exist and
    /// that `device_id` is a member of the node storage group.
    ///
    /// With no `initiators` the host must already exist.
    #[instrument(skip(self, initiators))]
    pub async fn ensure_publish_topology(
        &self,
        array_id: &str,
        node_id: &str,
        device_id: &str,
        initiators: &[String],
    ) -> Result<MaskingTopology> {
        let names = self.names(node_id);

        if initiators.is_empty() {
            match self.gateway.get_host(array_id, &names.host_id).await {
                Ok(_) => {}
                Err(e) if e.is_missing(ObjectKind::Host) => {
                    return Err(DriverError::NotFound(format!(
                        "host {} does not exist on array {}; node {} has not registered its initiators",
                        names.host_id, array_id, node_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.get_or_create_host(array_id, &names.host_id, initiators)
                .await?;
        }

        let group = self
            .gateway
            .get_or_create_storage_group(array_id, &names.storage_group_id, None, None)
            .await?;
        if group.contains(device_id) {
            debug!(device_id = %device_id, storage_group = %group.id, "Volume already in node storage group");
        } else {
            self.gateway
                .add_volume_to_storage_group(array_id, &group.id, device_id)
                .await?;
            info!(device_id = %device_id, storage_group = %group.id, "Added volume to node storage group");
        }

        let view = match self
            .gateway
            .get_masking_view(array_id, &names.masking_view_id)
            .await
        {
            Ok(view) => {
                if view.storage_group_id != names.storage_group_id
                    || view.host_id != names.host_id
                {
                    return Err(DriverError::configuration(format!(
                        "masking view {} binds storage group {} and host {}, expected {} and {}",
                        view.id,
                        view.storage_group_id,
                        view.host_id,
                        names.storage_group_id,
                        names.host_id
                    )));
                }
                view
            }
            Err(e) if e.is_missing(ObjectKind::MaskingView) => {
                let port_group_id = self.port_groups.select()?.to_string();
                let view = MaskingView {
                    id: names.masking_view_id.clone(),
                    storage_group_id: names.storage_group_id.clone(),
                    host_id: names.host_id.clone(),
                    port_group_id,
                };
                info!(
                    masking_view = %view.id,
                    port_group = %view.port_group_id,
                    "Creating masking view"
                );
                self.gateway.create_masking_view(array_id, &view).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(MaskingTopology {
            host_id: names.host_id,
            storage_group_id: names.storage_group_id,
            masking_view_id: names.masking_view_id,
            port_group_id: view.port_group_id,
        })
    }

    /// Remove `device_id` from the node storage group. Returns whether the
    /// device was a member.
    #[instrument(skip(self))]
    pub async fn teardown_publish_topology(
        &self,
        array_id: &str,
        node_id: &str,
        device_id: &str,
    ) -> Result<bool> {
        let names = self.names(node_id);

        let group = match self
            .gateway
            .get_storage_group(array_id, &names.storage_group_id)
            .await
        {
            Ok(group) => group,
            Err(e) if e.is_missing(ObjectKind::StorageGroup) => {
                debug!(storage_group = %names.storage_group_id, "Node storage group absent");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let was_member = group.contains(device_id);
        if was_member {
            self.gateway
                .remove_volume_from_storage_group(array_id, &group.id, device_id)
                .await?;
            info!(device_id = %device_id, storage_group = %group.id, "Removed volume from node storage group");
        }

        let now_empty = group.volume_ids.iter().all(|id| id == device_id);
        if now_empty && self.empty_group_policy == EmptyGroupPolicy::Delete {
            match self
                .gateway
                .delete_masking_view(array_id, &names.masking_view_id)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_missing(ObjectKind::MaskingView) => {}
                Err(e) => return Err(e.into()),
            }
            self.gateway
                .delete_storage_group(array_id, &group.id)
                .await?;
            info!(storage_group = %group.id, "Deleted empty node storage group");
        }

        Ok(was_member)
    }

    /// Register the node's initiators on every given array.
    pub async fn node_host_setup(
        &self,
        array_ids: &[String],
        node_id: &str,
        initiators: &[String],
    ) -> Result<Vec<Host>> {
        let host_id = self.host_id(node_id);
        let mut hosts = Vec::with_capacity(array_ids.len());
        for array_id in array_ids {
            hosts.push(self.get_or_create_host(array_id, &host_id, initiators).await?);
        }
        Ok(hosts)
    }

    /// iSCSI targets served by the ports of the view's port group, one per
    /// (target, portal) pair.
    pub async fn targets_for_masking_view(
        &self,
        array_id: &str,
        view: &MaskingView,
    ) -> Result<Vec<IscsiTarget>> {
        let group = self
            .gateway
            .get_port_group(array_id, &view.port_group_id)
            .await?;

        let mut targets = Vec::new();
        for key in &group.ports {
            let port = self.gateway.get_port(array_id, key).await?;
            let Some(target) = port.iscsi_target else {
                continue;
            };
            for address in &port.ip_addresses {
                let entry = IscsiTarget {
                    target: target.clone(),
                    portal: address.clone(),
                };
                if !targets.contains(&entry) {
                    targets.push(entry);
                }
            }
        }
        Ok(targets)
    }
}
