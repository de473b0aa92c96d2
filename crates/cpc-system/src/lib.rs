//! PRIMARY-side implementation of the Co-Processor Communication
//! Protocol's system endpoint: endpoint 0, the out-of-band control
//! channel used to issue NOOP/RESET/property-get/property-set commands
//! to a SECONDARY co-processor and to observe its unsolicited status
//! stream.
//!
//! The crate is split in two layers:
//!
//! - [`engine::SystemEndpointCore`] is a synchronous, sans-I/O state
//!   machine: the Wire Codec, Command Table, Timer Manager contract,
//!   Request Engine, and Reply Router, with no locking and no
//!   suspension. It is driven by calling its `on_*` methods and
//!   executing the [`engine::Action`]s it emits.
//! - [`driver::Driver`] is the `tokio`-backed loop that actually owns a
//!   [`link::LinkLayer`] connection and real timers, and
//!   [`driver::DriverHandle`] is the cloneable handle callers use to
//!   issue commands from anywhere in an application.
//!
//! Most applications only need the `driver` feature (on by default):
//!
//! ```ignore
//! use cpc_system::driver::Driver;
//! use cpc_system::link::{HostFlags, RetryPolicy};
//! use std::time::Duration;
//!
//! let host_flags = HostFlags::new(false);
//! let (driver, handle) = Driver::open(my_link_layer, my_server_query, host_flags).await?;
//! tokio::spawn(driver.run());
//!
//! let status = handle.noop(RetryPolicy::new(2, Duration::from_millis(250))).await?;
//! ```
//!
//! Code that wants to drive the state machine itself (embedded, a
//! different async runtime, a test harness) can depend on this crate
//! with `default-features = false` and use [`engine::SystemEndpointCore`]
//! directly.

pub mod command;
pub mod engine;
pub mod error;
#[cfg(feature = "driver")]
pub mod driver;
pub mod link;
pub mod wire;

/// Fake [`link::LinkLayer`]/[`link::ServerQuery`] test doubles, recording
/// every call, for use by this crate's own unit tests and by downstream
/// integration tests exercising [`driver::Driver`].
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;

pub use engine::SystemEndpointCore;
pub use error::Error;
#[cfg(feature = "driver")]
pub use driver::{Driver, DriverHandle, Heartbeat};
pub use link::{HostFlags, LinkLayer, RetryPolicy, ServerQuery};
pub use wire::{CommandSeq, PropertyId, SystemStatus};
