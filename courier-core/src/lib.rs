#![cfg_attr(docsrs, feature(doc_cfg))]

//! Synchronous publish/subscribe over AMQP 0-9-1.
//!
//! Courier hides broker connections behind a small blocking API. Callers
//! `send`, `receive` and `receive_batch` by exchange name; the
//! [`Controller`](crate::controller::Controller) starts one background worker
//! per exchange and direction the first time it is used, and keeps it
//! connected for the life of the process.
//!
//! Features:
//! - **Thread-confined connections**: every broker connection is owned by a
//!   dedicated worker thread. Callers reach it only through a bridging queue
//!   and commands marshalled into the worker's event loop.
//! - **Automatic reconnection**: workers reconnect after a configurable delay,
//!   redeclaring their exchange, queue and binding. A negative delay turns
//!   reconnection off.
//! - **At-least-once delivery**: consumers acknowledge manually, either
//!   automatically on `receive` or explicitly with
//!   [`acknowledge_message`](crate::controller::Controller::acknowledge_message)
//!   and [`nack_message`](crate::controller::Controller::nack_message).
//!   Acknowledging a delivery whose channel was replaced is a well-defined
//!   [`CourierError::StaleDeliveryTag`].
//! - **Shared log sinks**: workers logging to the same file share one handle,
//!   reference counted by the [`LogRegistry`](crate::logging::LogRegistry).
//!
//! # How to use Courier
//!
//! ```no_run
//! use courier::{
//!     config::{ControllerOptions, ExchangeKind},
//!     controller::Controller,
//! };
//!
//! # fn main() -> courier::Result<()> {
//! let mut options = ControllerOptions::new("local", "/var/log/courier.log");
//! options.config_path = Some("courier.json".into());
//! let controller = Controller::new_or_exit(options);
//!
//! controller.send("Hello, world!", "basic", Some("q"), ExchangeKind::Fanout)?;
//! controller.send("Hello, world!", "basic", None, ExchangeKind::Fanout)?;
//!
//! for envelope in controller.receive_batch("basic", Some("q"), ExchangeKind::Fanout)? {
//!     let text: String = envelope.decode()?;
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Credentials come from a JSON file holding named profiles; see
//! [`config`]. The file path is taken from
//! [`ControllerOptions::config_path`](crate::config::ControllerOptions::config_path)
//! or the `COURIER_CFG` environment variable. Configuration failures carry a
//! process exit code (2 for a missing profile, 11 otherwise), which
//! [`Controller::new_or_exit`](crate::controller::Controller::new_or_exit)
//! exits with.
//!
//! ## Brokers
//!
//! The controller is generic over the [`Broker`](crate::broker::Broker) seam.
//! [`AmqpBroker`](crate::broker::amqp::AmqpBroker) talks to a real broker;
//! [`InMemoryBroker`](crate::broker::in_memory::InMemoryBroker) runs in
//! process and can simulate outages.
pub mod bridge;
pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod message;
pub mod serializer;
pub mod worker;

pub use controller::{Channels, Controller};
pub use error::{CourierError, Result};
pub use message::Envelope;
pub use tracing;
