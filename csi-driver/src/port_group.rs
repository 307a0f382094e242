//! Port group selection for new masking views.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DriverError, Result};

/// Round-robin selector over the configured port groups.
///
/// Each call advances the cursor by one. Callers select once per masking
/// view they build and reuse that choice for the rest of the construction.
#[derive(Debug)]
pub struct PortGroupSelector {
    port_groups: Vec<String>,
    next: AtomicUsize,
}

impl PortGroupSelector {
    pub fn new(port_groups: Vec<String>) -> Self {
        Self {
            port_groups,
            next: AtomicUsize::new(0),
        }
    }

    /// Return the next port group in rotation.
    pub fn select(&self) -> Result<&str> {
        if self.port_groups.is_empty() {
            return Err(DriverError::configuration("no port groups configured"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.port_groups.len();
        Ok(&self.port_groups[index])
    }
}
