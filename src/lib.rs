//! Library surface for the sandbox control plane.
//!
//! The binary in `main.rs` wires these modules to `kube::runtime::Controller`
//! instances; everything here is pure enough to unit test without a cluster.

pub mod claim;
pub mod conditions;
pub mod crd;
pub mod hash;
pub mod labels;
pub mod sandbox;
pub mod template;
pub mod warmpool;
