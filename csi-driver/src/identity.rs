//! CSI Identity Service Implementation
//!
//! Provides plugin identification, capability reporting and a readiness
//! probe backed by the array sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::arrays::ArrayContext;
use crate::csi;

pub const DRIVER_NAME: &str = "blockarray.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    driver_name: String,
    node_name: String,
    arrays: Arc<ArrayContext>,
}

/// Manifest key naming the controller instance that answered.
pub const MANIFEST_NODE: &str = "node";

impl IdentityService {
    pub fn new(driver_name: &str, node_name: &str, arrays: Arc<ArrayContext>) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            node_name: node_name.to_string(),
            arrays,
        }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let mut manifest = HashMap::new();
        if !self.node_name.is_empty() {
            manifest.insert(MANIFEST_NODE.to_string(), self.node_name.clone());
        }
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest,
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                },
            )),
        }];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Ready once a session exists with at least one permitted array.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = match self.arrays.ensure_logged_into_every_array().await {
            Ok(arrays) => !arrays.is_empty(),
            Err(e) => {
                warn!(error = %e, "Probe could not log into every array");
                !self.arrays.logged_in_arrays().await.is_empty()
            }
        };
        debug!(ready, "Probe");
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}
