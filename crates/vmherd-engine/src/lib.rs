//! vmherd-engine: the orchestrator core.
//!
//! The [`engine::Engine`] sits between a transactional [`store::Store`]
//! and the host-side collaborators ([`launcher::Launcher`],
//! [`network::NetworkManager`], [`bus::EventBus`]): it owns the live
//! handle map, runs the VM lifecycle state machine, arbitrates IPs and
//! vsock CIDs, builds cloud-init seeds, and keeps deployment replica
//! counts reconciled.

pub mod bus;
pub mod cid;
pub mod deploy;
pub mod engine;
pub mod ippool;
pub mod launcher;
pub mod network;
pub mod seed;
pub mod store;
