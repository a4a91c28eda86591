//! # railsub
//!
//! `railsub` is a real-time fan-out server for a simulated commuter train
//! fleet. Clients connect over WebSockets and receive live train positions
//! and line status for the whole fleet or for the lines they subscribe to,
//! plus personal arrival and delay notifications once authenticated.
//!
//! ## Core Modules
//!
//! - `broker`: typed topics, the topic registry and the fan-out publisher.
//! - `client`: the per-connection handle with its bounded outbound queue.
//! - `config`: layered configuration (file, environment, defaults).
//! - `persistence`: the sled-backed notification store and line topology.
//! - `simulation`: the simulated fleet that produces updates.
//! - `transport`: the WebSocket server, wire protocol and subscription
//!   manager.
//! - `utils`: error taxonomy, error sinks and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod simulation;
pub mod transport;
pub mod utils;
