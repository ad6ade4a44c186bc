//! The driver contract and the reference drivers.
//!
//! A driver realizes one component's behavior. It is instantiated fresh for
//! every step invocation, holds no state between runs, and talks to the
//! engine only through its return value and the [`StepContext`] handed to
//! it.

pub mod contract;
pub mod csv;
pub mod registry;
pub mod sql;

pub use contract::{Driver, DriverError, Inputs, Outputs, StepContext, StepValue, Table};
pub use registry::{default_driver_registry, DriverRegistry, DriverRegistryError};
pub use sql::{SqlClient, SqlExtractor};
