//! Deferred volume reclamation.
//!
//! `DeleteVolume` only marks a device and hands it to the [`DeletionWorker`].
//! A single background task then drains the queue in FIFO order: it takes
//! the device out of its storage groups, drops provisioning groups left
//! empty, deletes the device and follows the array job to completion.
//! Transient failures are retried after a backoff up to a fixed number of
//! attempts; every request ends up in a bounded history as completed or
//! failed.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use array_gateway::{ArrayError, ArrayGateway, JobStatus, ObjectKind};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{DriverError, Result};
use crate::metrics;
use crate::volume_id::{mark_for_deletion, strip_deletion_marker, volume_identifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionConfig {
    /// Attempts before a request is failed for good
    pub max_attempts: u32,
    /// Delay before a retried request becomes eligible again
    pub retry_backoff: Duration,
    /// Delay between job status polls
    pub job_poll_interval: Duration,
    /// Polls per attempt before a running job counts as a transient failure
    pub job_poll_attempts: u32,
    /// Finished requests kept for inspection
    pub history_capacity: usize,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_secs(5),
            job_poll_interval: Duration::from_secs(1),
            job_poll_attempts: 10,
            history_capacity: 100,
        }
    }
}

/// A device queued for reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRequest {
    pub array_id: String,
    pub device_id: String,
    /// Array-side identifier of the volume, without the deletion marker
    pub volume_name: String,
    pub size_cylinders: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Deletion job started by an earlier attempt
    pub job_id: Option<String>,
}

impl DeletionRequest {
    pub fn new(array_id: &str, device_id: &str, volume_name: &str, size_cylinders: i64) -> Self {
        Self {
            array_id: array_id.to_string(),
            device_id: device_id.to_string(),
            volume_name: volume_name.to_string(),
            size_cylinders,
            attempts: 0,
            last_error: None,
            job_id: None,
        }
    }

    fn key(&self) -> (String, String) {
        (self.array_id.clone(), self.device_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Completed,
    Failed(String),
}

/// A request that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRequest {
    pub request: DeletionRequest,
    pub outcome: DeletionOutcome,
}

impl CompletedRequest {
    pub fn succeeded(&self) -> bool {
        self.outcome == DeletionOutcome::Completed
    }
}

/// Result of one processing attempt.
#[derive(Debug)]
enum Step {
    Completed,
    Retry(String),
    Failed(String),
}

impl Step {
    fn from_error(e: &ArrayError) -> Self {
        if e.is_retryable() {
            Step::Retry(e.to_string())
        } else {
            Step::Failed(e.to_string())
        }
    }
}

/// Whether `group_id` follows the provisioning group grammar
/// `csi-{prefix}[-{app}]-{service level}-{pool}-SG`.
fn is_provisioning_group(cluster_prefix: &str, group_id: &str) -> bool {
    let Some(rest) = group_id
        .strip_prefix(&format!("csi-{}-", cluster_prefix))
        .and_then(|r| r.strip_suffix("-SG"))
    else {
        return false;
    };
    let segments: Vec<&str> = rest.split('-').collect();
    matches!(segments.len(), 2 | 3) && segments.iter().all(|s| !s.is_empty())
}

#[derive(Debug)]
struct Queued {
    request: DeletionRequest,
    ready_at: Instant,
}

enum Next {
    Ready(DeletionRequest),
    WaitUntil(Instant),
    Idle,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Queued>,
    /// Keys of every queued or in-progress request
    tracked: HashSet<(String, String)>,
    in_progress: Option<DeletionRequest>,
    history: VecDeque<CompletedRequest>,
}

struct Shared {
    gateway: Arc<dyn ArrayGateway>,
    cluster_prefix: String,
    config: DeletionConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(state: &QueueState) {
        metrics::set_deletion_queue_depth(state.tracked.len());
    }

    /// Pop the first request whose backoff has elapsed.
    fn take_next(&self) -> Next {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(index) = state.queue.iter().position(|q| q.ready_at <= now) {
            if let Some(queued) = state.queue.remove(index) {
                state.in_progress = Some(queued.request.clone());
                return Next::Ready(queued.request);
            }
        }
        match state.queue.iter().map(|q| q.ready_at).min() {
            Some(deadline) => Next::WaitUntil(deadline),
            None => Next::Idle,
        }
    }

    fn finish(&self, mut request: DeletionRequest, step: Step) {
        let mut state = self.lock();
        state.in_progress = None;
        request.attempts += 1;

        let outcome = match step {
            Step::Completed => {
                info!(
                    array_id = %request.array_id,
                    device_id = %request.device_id,
                    volume = %request.volume_name,
                    attempts = request.attempts,
                    "Volume reclaimed"
                );
                DeletionOutcome::Completed
            }
            Step::Retry(message) if request.attempts < self.config.max_attempts => {
                warn!(
                    array_id = %request.array_id,
                    device_id = %request.device_id,
                    attempts = request.attempts,
                    error = %message,
                    "Volume deletion will be retried"
                );
                request.last_error = Some(message);
                metrics::record_deletion_retry();
                state.queue.push_back(Queued {
                    request,
                    ready_at: Instant::now() + self.config.retry_backoff,
                });
                Self::publish_depth(&state);
                return;
            }
            Step::Retry(message) => {
                let exhausted = DriverError::RetryExhausted {
                    attempts: request.attempts,
                    last_error: message.clone(),
                };
                error!(
                    array_id = %request.array_id,
                    device_id = %request.device_id,
                    error = %exhausted,
                    "Volume deletion failed"
                );
                request.last_error = Some(message);
                DeletionOutcome::Failed(exhausted.to_string())
            }
            Step::Failed(message) => {
                error!(
                    array_id = %request.array_id,
                    device_id = %request.device_id,
                    error = %message,
                    "Volume deletion failed permanently"
                );
                request.last_error = Some(message.clone());
                DeletionOutcome::Failed(message)
            }
        };

        metrics::record_deletion_outcome(match outcome {
            DeletionOutcome::Completed => "completed",
            DeletionOutcome::Failed(_) => "failed",
        });
        state.tracked.remove(&request.key());
        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(CompletedRequest { request, outcome });
        Self::publish_depth(&state);
    }

    /// Poll a job until it is terminal or `job_poll_attempts` polls have been made.
    async fn poll_job(&self, array_id: &str, job_id: &str) -> std::result::Result<JobStatus, ArrayError> {
        for poll in 0..self.config.job_poll_attempts {
            if poll > 0 {
                tokio::time::sleep(self.config.job_poll_interval).await;
            }
            let job = self.gateway.get_job(array_id, job_id).await?;
            if job.status.is_terminal() {
                return Ok(job.status);
            }
            debug!(job_id = %job_id, poll, "Deletion job still running");
        }
        Ok(JobStatus::Running)
    }

    fn job_step(job_id: &str, status: JobStatus) -> Step {
        match status {
            JobStatus::Succeeded => Step::Completed,
            JobStatus::Running => Step::Retry(format!("job {} is still running", job_id)),
            JobStatus::Failed(message) => Step::Failed(format!("job {} failed: {}", job_id, message)),
        }
    }

    /// A provisioning group created by this driver.
    fn owns_group(&self, group_id: &str) -> bool {
        is_provisioning_group(&self.cluster_prefix, group_id)
    }

    async fn attempt(&self, request: &mut DeletionRequest) -> Step {
        let gateway = &self.gateway;
        let array_id = request.array_id.as_str();
        let device_id = request.device_id.as_str();

        let volume = match gateway.get_volume(array_id, device_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_missing(ObjectKind::Volume) => {
                debug!(array_id = %array_id, device_id = %device_id, "Device already gone");
                return Step::Completed;
            }
            Err(e) => return Step::from_error(&e),
        };

        if volume.identifier != request.volume_name
            && volume.identifier != mark_for_deletion(&request.volume_name)
        {
            return Step::Failed(format!(
                "device {} now carries identifier '{}', expected '{}'",
                device_id, volume.identifier, request.volume_name
            ));
        }

        if let Some(job_id) = request.job_id.clone() {
            match self.poll_job(array_id, &job_id).await {
                Ok(status) => return Self::job_step(&job_id, status),
                Err(e) if e.is_missing(ObjectKind::Job) => {
                    debug!(job_id = %job_id, "Previous deletion job vanished; starting over");
                    request.job_id = None;
                }
                Err(e) => return Step::from_error(&e),
            }
        }

        for group_id in &volume.storage_groups {
            let group = match gateway.get_storage_group(array_id, group_id).await {
                Ok(group) => group,
                Err(e) => return Step::from_error(&e),
            };
            if group.is_masked() {
                return Step::Failed(format!(
                    "storage group {} is in masking view(s) {}; volume is still published",
                    group_id,
                    group.masking_views.join(", ")
                ));
            }
            if let Err(e) = gateway
                .remove_volume_from_storage_group(array_id, group_id, device_id)
                .await
            {
                return Step::from_error(&e);
            }
            debug!(device_id = %device_id, storage_group = %group_id, "Removed device from storage group");

            let now_empty = group.volume_ids.iter().all(|id| id == device_id);
            if now_empty && self.owns_group(group_id) {
                match gateway.delete_storage_group(array_id, group_id).await {
                    Ok(()) => info!(storage_group = %group_id, "Deleted empty storage group"),
                    Err(e) => warn!(storage_group = %group_id, error = %e, "Failed to delete empty storage group"),
                }
            }
        }

        let job_id = match gateway.delete_volume(array_id, device_id).await {
            Ok(job_id) => job_id,
            Err(e) if e.is_missing(ObjectKind::Volume) => return Step::Completed,
            Err(e) => return Step::from_error(&e),
        };
        request.job_id = Some(job_id.clone());

        match self.poll_job(array_id, &job_id).await {
            Ok(status) => Self::job_step(&job_id, status),
            Err(e) => Step::from_error(&e),
        }
    }
}

async fn run(shared: Arc<Shared>) {
    info!("Deletion worker started");
    loop {
        match shared.take_next() {
            Next::Ready(mut request) => {
                debug!(
                    array_id = %request.array_id,
                    device_id = %request.device_id,
                    attempt = request.attempts + 1,
                    "Processing deletion request"
                );
                let step = shared.attempt(&mut request).await;
                shared.finish(request, step);
            }
            Next::WaitUntil(deadline) => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            Next::Idle => shared.notify.notified().await,
        }
    }
}

/// Background reclamation of deleted volumes.
pub struct DeletionWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeletionWorker {
    pub fn new(gateway: Arc<dyn ArrayGateway>, cluster_prefix: &str, config: DeletionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                gateway,
                cluster_prefix: cluster_prefix.to_string(),
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the consumer unless one is already running. Returns whether a
    /// new consumer was spawned. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *handle = Some(tokio::spawn(run(self.shared.clone())));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the consumer. A request it was working on goes back to the head
    /// of the queue.
    pub async fn stop(&self) {
        let handle = self.handle().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Deletion worker stopped");
        }
        let mut state = self.shared.lock();
        if let Some(request) = state.in_progress.take() {
            state.queue.push_front(Queued {
                request,
                ready_at: Instant::now(),
            });
        }
    }

    /// Queue a request. A request for a device that is already queued or
    /// being processed is dropped; returns whether it was queued.
    pub fn request_deletion(&self, request: DeletionRequest) -> bool {
        let mut state = self.shared.lock();
        if !state.tracked.insert(request.key()) {
            debug!(
                array_id = %request.array_id,
                device_id = %request.device_id,
                "Deletion already pending"
            );
            return false;
        }
        info!(
            array_id = %request.array_id,
            device_id = %request.device_id,
            volume = %request.volume_name,
            "Queued volume for deletion"
        );
        state.queue.push_back(Queued {
            request,
            ready_at: Instant::now(),
        });
        Shared::publish_depth(&state);
        drop(state);
        self.shared.notify.notify_one();
        true
    }

    /// Requests not yet finished: the one in progress first, then the queue.
    pub fn pending_requests(&self) -> Vec<DeletionRequest> {
        let state = self.shared.lock();
        state
            .in_progress
            .iter()
            .cloned()
            .chain(state.queue.iter().map(|q| q.request.clone()))
            .collect()
    }

    /// Finished requests, oldest first.
    pub fn completed_requests(&self) -> Vec<CompletedRequest> {
        self.shared.lock().history.iter().cloned().collect()
    }

    /// Most recent finished request for the array-side volume name.
    pub fn find_completed(&self, volume_name: &str) -> Option<CompletedRequest> {
        self.shared
            .lock()
            .history
            .iter()
            .rev()
            .find(|c| c.request.volume_name == volume_name)
            .cloned()
    }

    /// Wait until a request for `volume_name` appears in the history.
    pub async fn wait_for_completion(
        &self,
        volume_name: &str,
        timeout: Duration,
    ) -> Option<CompletedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(done) = self.find_completed(volume_name) {
                return Some(done);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Queue every device on `array_ids` still carrying the deletion marker,
    /// e.g. after a restart. Returns how many were queued.
    pub async fn recover_marked_volumes(&self, array_ids: &[String]) -> Result<usize> {
        let owned_prefix = volume_identifier(&self.shared.cluster_prefix, "");
        let mut queued = 0;
        for array_id in array_ids {
            let volumes = self.shared.gateway.list_volumes(array_id).await?;
            for volume in volumes {
                let Some(name) = strip_deletion_marker(&volume.identifier) else {
                    continue;
                };
                if !name.starts_with(&owned_prefix) {
                    continue;
                }
                let request = DeletionRequest::new(
                    array_id,
                    &volume.device_id,
                    name,
                    volume.capacity_cylinders,
                );
                if self.request_deletion(request) {
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            info!(count = queued, "Recovered volumes marked for deletion");
        }
        Ok(queued)
    }
}

impl Drop for DeletionWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle().take() {
            handle.abort();
        }
    }
}
