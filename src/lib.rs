//! Discovers worker nodes from their manifests, supervises their processes
//! and drives them through declarative workflows over a local socket
//! protocol.
pub mod communicator;
pub mod config;
pub mod discovery;
pub mod logger;
pub mod manifest;
pub mod node;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod workflow;

pub use node_protocol;
