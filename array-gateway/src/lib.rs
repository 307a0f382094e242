//! Array Object Gateway
//!
//! The contract between the CSI controller and a block-storage array's
//! management API, together with the array object model and an in-memory
//! implementation used by tests and by the driver when no array is attached.

pub mod error;
pub mod gateway;
pub mod simulator;
pub mod types;

pub use error::{ArrayError, Result};
pub use gateway::ArrayGateway;
pub use simulator::{Inventory, JobBehavior, Operation, SimulatedArray};
pub use types::*;
