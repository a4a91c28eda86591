//! The `simulation` module provides the update producer: a simulated fleet
//! that emits train, line and notification events on a fixed cadence, and
//! the feed task that hands those events to the publisher.

pub mod simulator;

pub use simulator::{FleetSimulator, run_update_feed, start_simulation_loop};
