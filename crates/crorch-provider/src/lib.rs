//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Provider control-plane seam, client and simulated backend."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Provider API client for crorch.
//!
//! Handlers talk to the cloud only through [`ProviderClient`], which wraps a
//! [`ControlPlane`] implementation with retries and a per-request deadline.

pub mod client;
pub mod control_plane;
pub mod error;
pub mod model;
pub mod simulated;

pub use client::ProviderClient;
pub use control_plane::{ControlPlane, Operation};
pub use error::{classify, ProviderError, ProviderResult};
pub use simulated::{Fault, RecordedCall, SimulatedControlPlane, SimulationSettings};
