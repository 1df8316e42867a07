//! Core agent for a mesh-VPN overlay: control-plane client, encrypted data
//! plane, a DERP-style relay, and an optional NetworkLock authority log.
//! `src/main.rs` (the `meshd` binary) and `src/bin/meshrelay.rs` are thin
//! wrappers over this library.

pub mod config;
pub mod control;
pub mod counters;
pub mod dataplane;
pub mod disco;
pub mod keymaterial;
pub mod log;
pub mod network_lock;
pub mod node_agent;
pub mod peer_path;
pub mod platform;
pub mod prober;
pub mod relay;
pub mod store;
pub mod types;
pub mod wirecodec;
