//! Control plane for a warm pool of agent VMs.
//!
//! The daemon keeps pre-cloned VMs ready for instant task dispatch, tracks
//! every running agent in a registry, and multiplexes live status + log
//! streams to operator dashboards over a single WebSocket per client.

pub mod commands;
pub mod config;
pub mod control_api;
pub mod dispatch;
pub mod driver;
pub mod hub;
pub mod log_streams;
pub mod logging;
pub mod monitor;
pub mod mounts;
pub mod pool;
pub mod pool_state;
pub mod protocol;
pub mod proxy;
pub mod registration_api;
pub mod registry;
