//! `botflow-link` – everything between the routine engine and the robot's
//! socket.
//!
//! # Modules
//!
//! - [`protocol`] – rosbridge-style service/topic frames and the command
//!   constants of the robot's system service.
//! - [`transport`] – [`Transport`] / [`Dialer`] seams and the
//!   `tokio-tungstenite` implementation.
//! - [`device_link`] – [`DeviceLink`], the per-endpoint connection cache with
//!   cancellable calls.
//! - [`normalize`] – tolerant decoding of telemetry into
//!   [`MissionStatus`](botflow_types::MissionStatus).
//! - [`status_cache`] – [`StatusCache`], the last known telemetry value.
//! - [`subscriber`] – [`StatusSubscriber`], the reconnecting feed that keeps
//!   the cache warm.
//! - [`loopback`] – in-process device doubles for tests and dry runs.

pub mod device_link;
pub mod loopback;
pub mod normalize;
pub mod protocol;
pub mod status_cache;
pub mod subscriber;
pub mod transport;

pub use device_link::DeviceLink;
pub use status_cache::StatusCache;
pub use subscriber::{StatusSubscriber, SubscriberConfig};
pub use transport::{Dialer, Transport, WsDialer};
