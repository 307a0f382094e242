//! Array session context.
//!
//! Owns the array whitelist and the set of arrays with an established
//! session. One context belongs to one service instance; tests build a fresh
//! one per scenario.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use array_gateway::ArrayGateway;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::parse_list;
use crate::error::{DriverError, Result};
use crate::metrics;

pub struct ArrayContext {
    gateway: Arc<dyn ArrayGateway>,
    whitelist: RwLock<HashSet<String>>,
    logged_in: RwLock<HashSet<String>>,
    timeout: Duration,
}

impl ArrayContext {
    pub fn new(gateway: Arc<dyn ArrayGateway>, timeout: Duration) -> Self {
        Self {
            gateway,
            whitelist: RwLock::new(HashSet::new()),
            logged_in: RwLock::new(HashSet::new()),
            timeout,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ArrayGateway> {
        &self.gateway
    }

    /// Install the configured whitelist and forget all sessions.
    pub async fn init(&self, whitelist: &[String]) {
        {
            let mut guard = self.whitelist.write().await;
            *guard = whitelist.iter().cloned().collect();
        }
        self.reset_sessions().await;
        info!(whitelist = ?whitelist, "Array context initialized");
    }

    /// Clear the whitelist and all sessions.
    pub async fn reset(&self) {
        self.whitelist.write().await.clear();
        self.reset_sessions().await;
    }

    async fn reset_sessions(&self) {
        self.logged_in.write().await.clear();
        metrics::set_arrays_logged_in(0);
    }

    /// Replace the whitelist with a comma or space separated list of array
    /// IDs. An empty list permits every array.
    pub async fn set_array_whitelist(&self, list: &str) {
        let arrays: HashSet<String> = parse_list(list).into_iter().collect();
        info!(count = arrays.len(), "Array whitelist replaced");
        *self.whitelist.write().await = arrays;
    }

    /// Whitelisted array IDs in ascending order.
    pub async fn array_whitelist(&self) -> Vec<String> {
        let mut arrays: Vec<String> = self.whitelist.read().await.iter().cloned().collect();
        arrays.sort();
        arrays
    }

    pub async fn is_permitted(&self, array_id: &str) -> bool {
        let whitelist = self.whitelist.read().await;
        whitelist.is_empty() || whitelist.contains(array_id)
    }

    pub async fn logged_in_arrays(&self) -> Vec<String> {
        let mut arrays: Vec<String> = self.logged_in.read().await.iter().cloned().collect();
        arrays.sort();
        arrays
    }

    /// Establish a session for `array_id` unless one exists.
    pub async fn ensure_logged_in(&self, array_id: &str) -> Result<()> {
        if !self.is_permitted(array_id).await {
            return Err(DriverError::validation(format!(
                "array {} is not in the array whitelist",
                array_id
            )));
        }
        if self.logged_in.read().await.contains(array_id) {
            return Ok(());
        }

        debug!(array_id = %array_id, "Logging into array");
        self.with_timeout("login", self.gateway.login(array_id))
            .await?;

        let mut guard = self.logged_in.write().await;
        guard.insert(array_id.to_string());
        metrics::set_arrays_logged_in(guard.len());
        info!(array_id = %array_id, "Logged into array");
        Ok(())
    }

    /// Permitted arrays visible through the management endpoint.
    pub async fn permitted_arrays(&self) -> Result<Vec<String>> {
        let arrays = self
            .with_timeout("list arrays", self.gateway.list_arrays())
            .await?;
        let whitelist = self.whitelist.read().await;
        Ok(arrays
            .into_iter()
            .filter(|a| whitelist.is_empty() || whitelist.contains(a))
            .collect())
    }

    /// Log into every permitted array. Every array is attempted; the first
    /// failure is returned after the others have been tried.
    pub async fn ensure_logged_into_every_array(&self) -> Result<Vec<String>> {
        let arrays = self.permitted_arrays().await?;
        let mut first_error = None;
        let mut logged_in = Vec::with_capacity(arrays.len());

        for array_id in arrays {
            match self.ensure_logged_in(&array_id).await {
                Ok(()) => logged_in.push(array_id),
                Err(e) => {
                    warn!(array_id = %array_id, error = %e, "Failed to log into array");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(logged_in),
        }
    }

    /// Run an array call, or a sequence of them, under the configured
    /// deadline.
    pub async fn with_timeout<T, E, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<DriverError>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                warn!(operation, timeout_secs = self.timeout.as_secs(), "Array call timed out");
                Err(DriverError::Timeout {
                    operation: operation.to_string(),
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }
}
