//! Integration tests for csi-driver
//!
//! These tests drive the CSI service implementations against an in-memory
//! simulated array, one per test.
//! Tests focus on:
//! - Volume lifecycle and identifier round-tripping
//! - Pagination across list RPCs
//! - Request validation before array calls
//! - Publish/unpublish masking topology
//! - Deferred deletion
//! - Concurrent operations, timeouts and array faults

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use array_gateway::{ArrayGateway, JobBehavior, Operation, SimulatedArray, VolumeSpec};
use tonic::{Code, Request};

use csi_driver::csi;
use csi_driver::csi::controller_server::Controller;
use csi_driver::csi::identity_server::Identity;
use csi_driver::controller::{
    PARAM_ARRAY, PARAM_SERVICE_LEVEL, PARAM_STORAGE_POOL, PUBLISH_CONTEXT_TARGETS,
    PUBLISH_CONTEXT_WWN,
};
use csi_driver::identity::DRIVER_NAME;
use csi_driver::{
    ArrayContext, ControllerService, DeletionConfig, DeletionWorker, DriverConfig,
    IdentityService, decode_volume_id,
};

const ARRAY: &str = "000197900046";
const NODE: &str = "worker-1";
const NODE_IQN: &str = "iqn.1993-08.org.debian:01:5ae293b352a2";

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    sim: Arc<SimulatedArray>,
    arrays: Arc<ArrayContext>,
    deletion: Arc<DeletionWorker>,
    controller: ControllerService,
}

fn fast_deletion() -> DeletionConfig {
    DeletionConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(20),
        job_poll_interval: Duration::from_millis(5),
        job_poll_attempts: 5,
        history_capacity: 50,
    }
}

fn test_config() -> DriverConfig {
    DriverConfig {
        node_name: NODE.to_string(),
        port_groups: vec!["portgroup1".to_string(), "portgroup2".to_string()],
        cluster_prefix: "TST".to_string(),
        array_timeout: Duration::from_secs(5),
        deletion: fast_deletion(),
        ..Default::default()
    }
}

async fn harness_with(sim: SimulatedArray, config: DriverConfig) -> Harness {
    let sim = Arc::new(sim);
    let arrays = Arc::new(ArrayContext::new(sim.clone(), config.array_timeout));
    arrays.init(&config.array_whitelist).await;
    let deletion = Arc::new(DeletionWorker::new(
        sim.clone(),
        &config.cluster_prefix,
        config.deletion.clone(),
    ));
    let controller = ControllerService::new(&config, arrays.clone(), deletion.clone());
    Harness {
        sim,
        arrays,
        deletion,
        controller,
    }
}

async fn harness() -> Harness {
    harness_with(SimulatedArray::sample(), test_config()).await
}

fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
                volume_mount_group: String::new(),
            },
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn rwo() -> csi::VolumeCapability {
    mount_capability(csi::volume_capability::access_mode::Mode::SingleNodeWriter)
}

fn create_request(name: &str) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.to_string(),
        volume_capabilities: vec![rwo()],
        parameters: [
            (PARAM_ARRAY.to_string(), ARRAY.to_string()),
            (PARAM_STORAGE_POOL.to_string(), "SRP_1".to_string()),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    }
}

async fn create(h: &Harness, name: &str) -> csi::Volume {
    h.controller
        .create_volume(Request::new(create_request(name)))
        .await
        .expect("create volume")
        .into_inner()
        .volume
        .expect("volume in response")
}

async fn delete(h: &Harness, volume_id: &str) -> Result<(), tonic::Status> {
    h.controller
        .delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: volume_id.to_string(),
            ..Default::default()
        }))
        .await
        .map(|_| ())
}

async fn list(h: &Harness, max_entries: i32, token: &str) -> Result<csi::ListVolumesResponse, tonic::Status> {
    h.controller
        .list_volumes(Request::new(csi::ListVolumesRequest {
            max_entries,
            starting_token: token.to_string(),
        }))
        .await
        .map(|r| r.into_inner())
}

fn publish_request(volume_id: &str) -> csi::ControllerPublishVolumeRequest {
    csi::ControllerPublishVolumeRequest {
        volume_id: volume_id.to_string(),
        node_id: NODE.to_string(),
        volume_capability: Some(rwo()),
        ..Default::default()
    }
}

async fn register_node(h: &Harness) {
    h.controller
        .topology()
        .node_host_setup(&[ARRAY.to_string()], NODE, &[NODE_IQN.to_string()])
        .await
        .expect("node host setup");
}

// ============================================================================
// Volume Lifecycle Tests
// ============================================================================

/// Create vol1 under prefix TST, delete it, and delete it again
#[tokio::test]
async fn test_end_to_end_create_and_delete() {
    let h = harness().await;
    h.deletion.start();

    let volume = create(&h, "vol1").await;
    assert_eq!(volume.volume_id, "csi-TST-vol1-000197900046-00501");
    assert_eq!(
        decode_volume_id(&volume.volume_id).unwrap(),
        (
            "vol1".to_string(),
            ARRAY.to_string(),
            "00501".to_string()
        )
    );
    assert_eq!(volume.volume_context.get(PARAM_SERVICE_LEVEL).unwrap(), "Optimized");
    assert_eq!(volume.volume_context.get(PARAM_STORAGE_POOL).unwrap(), "SRP_1");
    assert!(volume.capacity_bytes >= 1024 * 1024 * 1024);

    delete(&h, &volume.volume_id).await.expect("first delete");
    let done = h
        .deletion
        .wait_for_completion("csi-TST-vol1", Duration::from_secs(5))
        .await
        .expect("deletion finished");
    assert!(done.succeeded());
    assert!(h.sim.get_volume(ARRAY, "00501").await.unwrap_err().is_not_found());

    delete(&h, &volume.volume_id).await.expect("second delete");
}

/// Deleting twice before the worker runs queues a single request
#[tokio::test]
async fn test_delete_twice_while_pending() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;

    delete(&h, &volume.volume_id).await.unwrap();
    delete(&h, &volume.volume_id).await.unwrap();

    assert_eq!(h.deletion.pending_requests().len(), 1);
    assert_eq!(h.sim.call_count(Operation::RenameVolume), 1);
    let device = h.sim.get_volume(ARRAY, "00501").await.unwrap();
    assert_eq!(device.identifier, "_DELcsi-TST-vol1");

    // Marked volumes are no longer listed
    assert!(list(&h, 0, "").await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_delete_nonexistent_volume_succeeds() {
    let h = harness().await;
    delete(&h, "csi-TST-gone-000197900046-0FFFF")
        .await
        .expect("missing volume deletes successfully");
    assert!(h.deletion.pending_requests().is_empty());
}

#[tokio::test]
async fn test_delete_malformed_id_is_invalid_argument() {
    let h = harness().await;
    for id in ["", "not-a-volume", "csi-TST-vol1", "pvc-1234"] {
        let err = delete(&h, id).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "id {:?}", id);
    }
    assert_eq!(h.sim.call_count(Operation::GetVolume), 0);
}

/// A reused device is not touched by a stale ID
#[tokio::test]
async fn test_delete_with_stale_name_leaves_device() {
    let h = harness().await;
    create(&h, "vol1").await;

    delete(&h, "csi-TST-other-000197900046-00501").await.unwrap();
    let device = h.sim.get_volume(ARRAY, "00501").await.unwrap();
    assert_eq!(device.identifier, "csi-TST-vol1");
    assert!(h.deletion.pending_requests().is_empty());
}

#[tokio::test]
async fn test_create_volume_idempotent() {
    let h = harness().await;
    let first = create(&h, "vol1").await;
    let second = create(&h, "vol1").await;
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 1);

    // A different service level is ignored in favour of the existing volume
    let mut request = create_request("vol1");
    request
        .parameters
        .insert(PARAM_SERVICE_LEVEL.to_string(), "Gold".to_string());
    let third = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(third.volume_id, first.volume_id);
    assert_eq!(third.volume_context.get(PARAM_SERVICE_LEVEL).unwrap(), "Optimized");

    // A different size is a conflict
    let mut request = create_request("vol1");
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: 10 * 1024 * 1024 * 1024,
        limit_bytes: 0,
    });
    let err = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 1);
}

#[tokio::test]
async fn test_create_volume_validation() {
    let h = harness().await;

    let mut missing_array = create_request("vol1");
    missing_array.parameters.remove(PARAM_ARRAY);

    let mut missing_pool = create_request("vol1");
    missing_pool.parameters.remove(PARAM_STORAGE_POOL);

    let mut no_capabilities = create_request("vol1");
    no_capabilities.volume_capabilities.clear();

    let mut zero = create_request("vol1");
    zero.capacity_range = Some(csi::CapacityRange {
        required_bytes: 0,
        limit_bytes: 0,
    });

    let mut negative = create_request("vol1");
    negative.capacity_range = Some(csi::CapacityRange {
        required_bytes: -1,
        limit_bytes: 0,
    });

    for request in [
        create_request(""),
        missing_array,
        missing_pool,
        no_capabilities,
        zero,
        negative,
    ] {
        let err = h
            .controller
            .create_volume(Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().starts_with("validation error"), "{}", err.message());
    }
    assert_eq!(h.sim.call_count(Operation::Login), 0);

    let mut unknown_level = create_request("vol1");
    unknown_level
        .parameters
        .insert(PARAM_SERVICE_LEVEL.to_string(), "Titanium".to_string());
    let err = h
        .controller
        .create_volume(Request::new(unknown_level))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 0);
}

#[tokio::test]
async fn test_create_volume_application_prefix_group() {
    let h = harness().await;
    let mut request = create_request("vol1");
    request
        .parameters
        .insert("ApplicationPrefix".to_string(), "DB".to_string());
    request
        .parameters
        .insert(PARAM_SERVICE_LEVEL.to_string(), "Gold".to_string());

    let volume = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(
        volume.volume_context.get("StorageGroup").unwrap(),
        "csi-TST-DB-Gold-SRP_1-SG"
    );
    let group = h
        .sim
        .get_storage_group(ARRAY, "csi-TST-DB-Gold-SRP_1-SG")
        .await
        .unwrap();
    assert_eq!(group.service_level.as_deref(), Some("Gold"));
}

// ============================================================================
// Pagination Tests
// ============================================================================

/// 12 volumes listed 5 at a time come back as 5, 5, 2
#[tokio::test]
async fn test_list_volumes_pages_of_five() {
    let h = harness().await;
    for i in 0..12 {
        create(&h, &format!("vol{:02}", i)).await;
    }

    let first = list(&h, 5, "").await.unwrap();
    assert_eq!(first.entries.len(), 5);
    assert!(!first.next_token.is_empty());

    let second = list(&h, 5, &first.next_token).await.unwrap();
    assert_eq!(second.entries.len(), 5);
    assert!(!second.next_token.is_empty());

    let third = list(&h, 5, &second.next_token).await.unwrap();
    assert_eq!(third.entries.len(), 2);
    assert!(third.next_token.is_empty());

    let ids: HashSet<String> = first
        .entries
        .iter()
        .chain(&second.entries)
        .chain(&third.entries)
        .map(|e| e.volume.as_ref().unwrap().volume_id.clone())
        .collect();
    assert_eq!(ids.len(), 12);
}

/// Every page size enumerates the inventory once, in the same order
#[tokio::test]
async fn test_list_volumes_any_page_size() {
    let h = harness().await;
    for i in 0..7 {
        create(&h, &format!("vol{}", i)).await;
    }
    let all: Vec<String> = list(&h, 0, "")
        .await
        .unwrap()
        .entries
        .into_iter()
        .map(|e| e.volume.unwrap().volume_id)
        .collect();
    assert_eq!(all.len(), 7);

    for page_size in 1..=7 {
        let mut seen = Vec::new();
        let mut token = String::new();
        loop {
            let page = list(&h, page_size, &token).await.unwrap();
            assert!(page.entries.len() <= page_size as usize);
            seen.extend(page.entries.into_iter().map(|e| e.volume.unwrap().volume_id));
            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }
        assert_eq!(seen, all, "page size {}", page_size);
    }
}

#[tokio::test]
async fn test_list_volumes_rejects_bad_tokens() {
    let h = harness().await;
    create(&h, "vol1").await;

    for token in ["abc", "-1", "99"] {
        let err = list(&h, 5, token).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "token {:?}", token);
    }
}

/// Only volumes carrying this cluster's prefix are listed
#[tokio::test]
async fn test_list_volumes_skips_foreign_volumes() {
    let h = harness().await;
    create(&h, "vol1").await;
    h.sim
        .create_volume(
            ARRAY,
            &VolumeSpec {
                identifier: "csi-XYZ-other".to_string(),
                capacity_cylinders: 100,
                storage_group_id: "csi-TST-Optimized-SRP_1-SG".to_string(),
            },
        )
        .await
        .unwrap();

    let response = list(&h, 0, "").await.unwrap();
    assert_eq!(response.entries.len(), 1);
    assert_eq!(
        response.entries[0].volume.as_ref().unwrap().volume_id,
        "csi-TST-vol1-000197900046-00501"
    );
}

// ============================================================================
// Publish / Unpublish Tests
// ============================================================================

/// Missing fields are rejected before any array call
#[tokio::test]
async fn test_publish_validation_makes_no_array_calls() {
    let h = harness().await;
    let volume_id = "csi-TST-vol1-000197900046-00501";

    let mut no_node = publish_request(volume_id);
    no_node.node_id.clear();

    let mut no_capability = publish_request(volume_id);
    no_capability.volume_capability = None;

    let mut no_mode = publish_request(volume_id);
    no_mode.volume_capability = Some(csi::VolumeCapability {
        access_type: rwo().access_type,
        access_mode: None,
    });

    let mut no_type = publish_request(volume_id);
    no_type.volume_capability = Some(csi::VolumeCapability {
        access_type: None,
        access_mode: rwo().access_mode,
    });

    for request in [publish_request(""), no_node, no_capability, no_mode, no_type] {
        let err = h
            .controller
            .controller_publish_volume(Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    let err = h
        .controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    assert_eq!(h.sim.call_count(Operation::Login), 0);
    assert_eq!(h.sim.call_count(Operation::GetVolume), 0);
}

#[tokio::test]
async fn test_publish_and_unpublish() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;
    register_node(&h).await;

    let context = h
        .controller
        .controller_publish_volume(Request::new(publish_request(&volume.volume_id)))
        .await
        .unwrap()
        .into_inner()
        .publish_context;

    let device = h.sim.get_volume(ARRAY, "00501").await.unwrap();
    assert_eq!(context.get(PUBLISH_CONTEXT_WWN).unwrap(), &device.wwn);
    let targets = context.get(PUBLISH_CONTEXT_TARGETS).unwrap();
    assert!(targets.contains("192.168.1.50,iqn.1992-04.com.emc:"));
    assert_eq!(targets.split(';').count(), 2);

    let view = h
        .sim
        .get_masking_view(ARRAY, "csi-node-TST-worker-1-MV")
        .await
        .unwrap();
    assert_eq!(view.port_group_id, "portgroup1");
    let group = h
        .sim
        .get_storage_group(ARRAY, "csi-node-TST-worker-1-SG")
        .await
        .unwrap();
    assert!(group.contains("00501"));

    // Publishing again is a no-op
    h.controller
        .controller_publish_volume(Request::new(publish_request(&volume.volume_id)))
        .await
        .unwrap();
    assert_eq!(h.sim.call_count(Operation::CreateMaskingView), 1);
    assert_eq!(h.sim.call_count(Operation::AddToStorageGroup), 1);

    let unpublish = || csi::ControllerUnpublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        node_id: NODE.to_string(),
        ..Default::default()
    };
    h.controller
        .controller_unpublish_volume(Request::new(unpublish()))
        .await
        .unwrap();
    let group = h
        .sim
        .get_storage_group(ARRAY, "csi-node-TST-worker-1-SG")
        .await
        .unwrap();
    assert!(!group.contains("00501"));
    // The emptied group and its view are retained
    assert!(group.is_masked());

    h.controller
        .controller_unpublish_volume(Request::new(unpublish()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_publish_to_unregistered_node_is_not_found() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;

    let err = h
        .controller
        .controller_publish_volume(Request::new(publish_request(&volume.volume_id)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_publish_missing_volume_is_not_found() {
    let h = harness().await;
    register_node(&h).await;
    let err = h
        .controller
        .controller_publish_volume(Request::new(publish_request(
            "csi-TST-vol1-000197900046-00501",
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

/// A published volume cannot be deleted until it is unpublished
#[tokio::test]
async fn test_delete_published_volume_fails_precondition() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;
    register_node(&h).await;
    h.controller
        .controller_publish_volume(Request::new(publish_request(&volume.volume_id)))
        .await
        .unwrap();

    let err = delete(&h, &volume.volume_id).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(h.deletion.pending_requests().is_empty());

    h.controller
        .controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: NODE.to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
    delete(&h, &volume.volume_id).await.unwrap();
    assert_eq!(h.deletion.pending_requests().len(), 1);
}

// ============================================================================
// Capability and Capacity Tests
// ============================================================================

#[tokio::test]
async fn test_controller_capabilities() {
    use csi::controller_service_capability::rpc::Type;

    let h = harness().await;
    let caps = h
        .controller
        .controller_get_capabilities(Request::new(csi::ControllerGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner()
        .capabilities;

    let types: Vec<i32> = caps
        .iter()
        .filter_map(|c| match &c.r#type {
            Some(csi::controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();
    assert_eq!(types.len(), 6);
    assert!(types.contains(&(Type::PublishUnpublishVolume as i32)));
    assert!(types.contains(&(Type::ListSnapshots as i32)));
    assert!(!types.contains(&(Type::ExpandVolume as i32)));
}

#[tokio::test]
async fn test_validate_volume_capabilities() {
    use csi::volume_capability::access_mode::Mode;

    let h = harness().await;
    let volume = create(&h, "vol1").await;

    let request = |caps: Vec<csi::VolumeCapability>, pool: Option<&str>| {
        let mut req = csi::ValidateVolumeCapabilitiesRequest {
            volume_id: volume.volume_id.clone(),
            volume_capabilities: caps,
            ..Default::default()
        };
        if let Some(pool) = pool {
            req.parameters
                .insert(PARAM_STORAGE_POOL.to_string(), pool.to_string());
        }
        req
    };

    let ok = h
        .controller
        .validate_volume_capabilities(Request::new(request(vec![rwo()], Some("SRP_1"))))
        .await
        .unwrap()
        .into_inner();
    assert!(ok.confirmed.is_some());
    assert!(ok.message.is_empty());

    let rwx = h
        .controller
        .validate_volume_capabilities(Request::new(request(
            vec![mount_capability(Mode::MultiNodeMultiWriter)],
            None,
        )))
        .await
        .unwrap()
        .into_inner();
    assert!(rwx.confirmed.is_none());
    assert!(rwx.message.contains("MULTI_NODE_MULTI_WRITER"));

    let wrong_pool = h
        .controller
        .validate_volume_capabilities(Request::new(request(vec![rwo()], Some("SRP_2"))))
        .await
        .unwrap()
        .into_inner();
    assert!(wrong_pool.confirmed.is_none());
    assert!(wrong_pool.message.contains("SRP_2"));

    let err = h
        .controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "csi-TST-gone-000197900046-0FFFF".to_string(),
            volume_capabilities: vec![rwo()],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_get_capacity() {
    let h = harness().await;
    let request = |pool: &str| csi::GetCapacityRequest {
        parameters: [
            (PARAM_ARRAY.to_string(), ARRAY.to_string()),
            (PARAM_STORAGE_POOL.to_string(), pool.to_string()),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };

    let before = h
        .controller
        .get_capacity(Request::new(request("SRP_1")))
        .await
        .unwrap()
        .into_inner()
        .available_capacity;
    assert_eq!(before, 10_000_000 * array_gateway::CYLINDER_SIZE_BYTES);

    let volume = create(&h, "vol1").await;
    let after = h
        .controller
        .get_capacity(Request::new(request("SRP_1")))
        .await
        .unwrap()
        .into_inner()
        .available_capacity;
    assert_eq!(before - after, volume.capacity_bytes);

    let err = h
        .controller
        .get_capacity(Request::new(request("SRP_9")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = h
        .controller
        .get_capacity(Request::new(csi::GetCapacityRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

// ============================================================================
// Snapshot Tests
// ============================================================================

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;
    let other = create(&h, "vol2").await;

    let snapshot_request = |source: &str, name: &str| csi::CreateSnapshotRequest {
        source_volume_id: source.to_string(),
        name: name.to_string(),
        ..Default::default()
    };

    let snapshot = h
        .controller
        .create_snapshot(Request::new(snapshot_request(&volume.volume_id, "snap1")))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert_eq!(snapshot.snapshot_id, "snap-TST-snap1-000197900046-00501");
    assert_eq!(snapshot.source_volume_id, volume.volume_id);
    assert_eq!(snapshot.size_bytes, volume.capacity_bytes);
    assert!(snapshot.ready_to_use);

    // Same name and source returns the existing snapshot
    let again = h
        .controller
        .create_snapshot(Request::new(snapshot_request(&volume.volume_id, "snap1")))
        .await
        .unwrap()
        .into_inner()
        .snapshot
        .unwrap();
    assert_eq!(again.snapshot_id, snapshot.snapshot_id);
    assert_eq!(h.sim.call_count(Operation::CreateSnapshot), 1);

    // Same name on another source conflicts
    let err = h
        .controller
        .create_snapshot(Request::new(snapshot_request(&other.volume_id, "snap1")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    h.controller
        .create_snapshot(Request::new(snapshot_request(&other.volume_id, "snap2")))
        .await
        .unwrap();

    let list = |source: &str, id: &str| csi::ListSnapshotsRequest {
        source_volume_id: source.to_string(),
        snapshot_id: id.to_string(),
        ..Default::default()
    };
    let all = h
        .controller
        .list_snapshots(Request::new(list("", "")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.entries.len(), 2);

    let by_source = h
        .controller
        .list_snapshots(Request::new(list(&other.volume_id, "")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(by_source.entries.len(), 1);
    assert_eq!(
        by_source.entries[0].snapshot.as_ref().unwrap().snapshot_id,
        "snap-TST-snap2-000197900046-00502"
    );

    let by_id = h
        .controller
        .list_snapshots(Request::new(list("", &snapshot.snapshot_id)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(by_id.entries.len(), 1);

    let malformed = h
        .controller
        .list_snapshots(Request::new(list("", "bogus")))
        .await
        .unwrap()
        .into_inner();
    assert!(malformed.entries.is_empty());

    let delete_snapshot = || csi::DeleteSnapshotRequest {
        snapshot_id: snapshot.snapshot_id.clone(),
        ..Default::default()
    };
    h.controller
        .delete_snapshot(Request::new(delete_snapshot()))
        .await
        .unwrap();
    h.controller
        .delete_snapshot(Request::new(delete_snapshot()))
        .await
        .expect("deleting a missing snapshot succeeds");

    let all = h
        .controller
        .list_snapshots(Request::new(list("", "")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.entries.len(), 1);
}

#[tokio::test]
async fn test_snapshot_of_missing_volume_is_not_found() {
    let h = harness().await;
    let err = h
        .controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: "csi-TST-gone-000197900046-0FFFF".to_string(),
            name: "snap1".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

// ============================================================================
// Content Source Tests
// ============================================================================

async fn snapshot_of(h: &Harness, volume: &csi::Volume, name: &str) -> csi::Snapshot {
    h.controller
        .create_snapshot(Request::new(csi::CreateSnapshotRequest {
            source_volume_id: volume.volume_id.clone(),
            name: name.to_string(),
            ..Default::default()
        }))
        .await
        .expect("create snapshot")
        .into_inner()
        .snapshot
        .expect("snapshot in response")
}

fn snapshot_source(snapshot_id: &str) -> csi::VolumeContentSource {
    csi::VolumeContentSource {
        r#type: Some(csi::volume_content_source::Type::Snapshot(
            csi::volume_content_source::SnapshotSource {
                snapshot_id: snapshot_id.to_string(),
            },
        )),
    }
}

fn restore_request(name: &str, snapshot_id: &str) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        volume_content_source: Some(snapshot_source(snapshot_id)),
        ..create_request(name)
    }
}

#[tokio::test]
async fn test_restore_from_snapshot() {
    let h = harness().await;
    let source = create(&h, "vol1").await;
    let snapshot = snapshot_of(&h, &source, "snap1").await;

    let mut request = restore_request("restored", &snapshot.snapshot_id);
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: snapshot.size_bytes,
        limit_bytes: 0,
    });
    let volume = h
        .controller
        .create_volume(Request::new(request.clone()))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(volume.volume_id, "csi-TST-restored-000197900046-00502");
    assert_eq!(volume.capacity_bytes, snapshot.size_bytes);
    assert_eq!(volume.content_source, Some(snapshot_source(&snapshot.snapshot_id)));
    assert_eq!(volume.volume_context.get(PARAM_STORAGE_POOL).unwrap(), "SRP_1");

    // A repeat returns the restored volume and echoes the source again
    let again = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert_eq!(again.volume_id, volume.volume_id);
    assert_eq!(again.content_source, volume.content_source);
    assert_eq!(h.sim.call_count(Operation::CreateVolumeFromSnapshot), 1);
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 1);
}

#[tokio::test]
async fn test_restore_with_wrong_capacity_is_invalid() {
    let h = harness().await;
    let source = create(&h, "vol1").await;
    let snapshot = snapshot_of(&h, &source, "snap1").await;

    let mut request = restore_request("restored", &snapshot.snapshot_id);
    request.capacity_range = Some(csi::CapacityRange {
        required_bytes: 64 * 1024 * 1024 * 1024,
        limit_bytes: 0,
    });
    let err = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("outside the requested range"), "{}", err.message());
    assert_eq!(h.sim.call_count(Operation::CreateVolumeFromSnapshot), 0);
}

#[tokio::test]
async fn test_restore_into_other_pool_is_invalid() {
    let h = harness().await;
    let source = create(&h, "vol1").await;
    let snapshot = snapshot_of(&h, &source, "snap1").await;

    let mut request = restore_request("restored", &snapshot.snapshot_id);
    request
        .parameters
        .insert(PARAM_STORAGE_POOL.to_string(), "SRP_2".to_string());
    let err = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("storage pool SRP_1"), "{}", err.message());
    assert_eq!(h.sim.call_count(Operation::CreateVolumeFromSnapshot), 0);
}

#[tokio::test]
async fn test_restore_from_missing_snapshot_is_not_found() {
    let h = harness().await;
    create(&h, "vol1").await;

    let err = h
        .controller
        .create_volume(Request::new(restore_request(
            "restored",
            "snap-TST-never-000197900046-00501",
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_unsupported_content_sources_are_invalid() {
    let h = harness().await;
    let source = create(&h, "vol1").await;

    let clone = csi::CreateVolumeRequest {
        volume_content_source: Some(csi::VolumeContentSource {
            r#type: Some(csi::volume_content_source::Type::Volume(
                csi::volume_content_source::VolumeSource {
                    volume_id: source.volume_id.clone(),
                },
            )),
        }),
        ..create_request("clone")
    };
    let untyped = csi::CreateVolumeRequest {
        volume_content_source: Some(csi::VolumeContentSource { r#type: None }),
        ..create_request("untyped")
    };

    for request in [
        clone,
        untyped,
        restore_request("garbage", "not-a-snapshot"),
        restore_request("empty", ""),
        restore_request("elsewhere", "snap-TST-snap1-000197900099-00501"),
    ] {
        let err = h
            .controller
            .create_volume(Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "{}", err.message());
    }
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 1);
    assert_eq!(h.sim.call_count(Operation::CreateVolumeFromSnapshot), 0);
    assert_eq!(h.sim.call_count(Operation::ListSnapshots), 0);
}

#[tokio::test]
async fn test_accessibility_requirements_ignored() {
    let h = harness().await;
    let request = csi::CreateVolumeRequest {
        accessibility_requirements: Some(csi::TopologyRequirement::default()),
        ..create_request("vol1")
    };
    let volume = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert!(volume.accessible_topology.is_empty());
    assert!(volume.content_source.is_none());
}

#[tokio::test]
async fn test_reserved_storage_group_rejected() {
    let h = harness().await;
    let mut request = create_request("vol1");
    request
        .parameters
        .insert("StorageGroup".to_string(), "csi-TST-app-team-sg".to_string());
    let err = h
        .controller
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(h
        .sim
        .get_storage_group(ARRAY, "csi-TST-app-team-sg")
        .await
        .unwrap_err()
        .is_not_found());
}

// ============================================================================
// Array Context Tests
// ============================================================================

#[tokio::test]
async fn test_whitelist_hides_arrays() {
    let config = DriverConfig {
        array_whitelist: vec!["000197900099".to_string()],
        ..test_config()
    };
    let h = harness_with(SimulatedArray::sample(), config).await;

    let err = h
        .controller
        .create_volume(Request::new(create_request("vol1")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(h.sim.call_count(Operation::Login), 0);
    assert!(list(&h, 0, "").await.unwrap().entries.is_empty());

    h.arrays.set_array_whitelist(ARRAY).await;
    create(&h, "vol1").await;
    assert_eq!(list(&h, 0, "").await.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn test_slow_array_times_out() {
    let config = DriverConfig {
        array_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let h = harness_with(SimulatedArray::sample(), config).await;
    h.sim.set_latency(Duration::from_millis(200));

    let err = h
        .controller
        .get_capacity(Request::new(csi::GetCapacityRequest {
            parameters: [
                (PARAM_ARRAY.to_string(), ARRAY.to_string()),
                (PARAM_STORAGE_POOL.to_string(), "SRP_1".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(err.message().starts_with("timeout"));
}

/// Transient array errors on synchronous paths reach the caller unretried
#[tokio::test]
async fn test_transient_array_error_is_unavailable() {
    let h = harness().await;
    create(&h, "vol1").await;
    h.sim.fail(Operation::GetVolume, true, Some(1));

    let err = h
        .controller
        .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
            volume_id: "csi-TST-vol1-000197900046-00501".to_string(),
            volume_capabilities: vec![rwo()],
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(h.sim.call_count(Operation::GetVolume), 1);
}

#[tokio::test]
async fn test_identity_probe_and_info() {
    let h = harness().await;
    let identity = IdentityService::new(DRIVER_NAME, NODE, h.arrays.clone());

    let info = identity
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, DRIVER_NAME);
    assert_eq!(info.manifest.get("node").map(String::as_str), Some(NODE));

    let probe = identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(probe.ready, Some(true));
    assert!(h.sim.is_logged_in(ARRAY));
}

// ============================================================================
// Deletion Worker Tests
// ============================================================================

/// Volumes marked before a restart are found and reclaimed by a new worker
#[tokio::test]
async fn test_marked_volumes_recovered_after_restart() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;
    delete(&h, &volume.volume_id).await.unwrap();

    // The original worker never ran; a fresh one takes over
    let worker = DeletionWorker::new(h.sim.clone(), "TST", fast_deletion());
    let queued = worker
        .recover_marked_volumes(&[ARRAY.to_string()])
        .await
        .unwrap();
    assert_eq!(queued, 1);

    worker.start();
    let done = worker
        .wait_for_completion("csi-TST-vol1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(done.succeeded());
    assert!(h.sim.get_volume(ARRAY, "00501").await.unwrap_err().is_not_found());
    worker.stop().await;
}

/// A failing array job ends in the history as failed, never retried
#[tokio::test]
async fn test_failed_job_recorded() {
    let h = harness().await;
    h.sim
        .set_job_behavior(JobBehavior::Fail("device locked".to_string()));
    h.deletion.start();

    let volume = create(&h, "vol1").await;
    delete(&h, &volume.volume_id).await.unwrap();

    let done = h
        .deletion
        .wait_for_completion("csi-TST-vol1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!done.succeeded());
    assert_eq!(done.request.attempts, 1);
    assert!(done.request.last_error.unwrap().contains("device locked"));
}

// ============================================================================
// Concurrency Tests
// ============================================================================

/// Test concurrent creates of distinct volumes
#[tokio::test]
async fn test_concurrent_creates() {
    let h = harness().await;

    let requests = (0..8).map(|i| {
        h.controller
            .create_volume(Request::new(create_request(&format!("vol{}", i))))
    });
    let results = futures::future::join_all(requests).await;

    let mut devices = HashSet::new();
    for result in results {
        let volume = result.unwrap().into_inner().volume.unwrap();
        let (_, _, device) = decode_volume_id(&volume.volume_id).unwrap();
        devices.insert(device);
    }
    assert_eq!(devices.len(), 8);
}

/// A second create for a name already in flight is aborted
#[tokio::test]
async fn test_concurrent_create_same_name_aborted() {
    let h = harness().await;
    h.sim.set_latency(Duration::from_millis(20));

    let (first, second) = tokio::join!(
        h.controller.create_volume(Request::new(create_request("vol1"))),
        h.controller.create_volume(Request::new(create_request("vol1"))),
    );
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().code(), Code::Aborted);

    // Once finished, the name can be requested again
    create(&h, "vol1").await;
    assert_eq!(h.sim.call_count(Operation::CreateVolume), 1);
}

/// Operations beyond the concurrency limit are rejected
#[tokio::test]
async fn test_rate_limited_operations() {
    let config = DriverConfig {
        max_concurrent_ops: 1,
        ..test_config()
    };
    let h = harness_with(SimulatedArray::sample(), config).await;
    h.sim.set_latency(Duration::from_millis(20));

    let (first, second) = tokio::join!(
        h.controller.create_volume(Request::new(create_request("vol1"))),
        h.controller.create_volume(Request::new(create_request("vol2"))),
    );
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().code(), Code::ResourceExhausted);
}

/// Concurrent deletes of one volume queue a single request
#[tokio::test]
async fn test_concurrent_deletes_deduplicated() {
    let h = harness().await;
    let volume = create(&h, "vol1").await;

    let deletes = (0..4).map(|_| {
        h.controller.delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            ..Default::default()
        }))
    });
    for result in futures::future::join_all(deletes).await {
        result.unwrap();
    }
    assert_eq!(h.deletion.pending_requests().len(), 1);
}
