// #![warn(missing_docs)]

//! Client runtime for the [EPICS Channel Access protocol].
//!
//! This crate sits between an application and whatever speaks CA on the wire. It
//! keeps track of channels, monitors and outstanding requests so that code using it
//! can read, write and watch process variables (PVs) by name, with blocking calls
//! that are always bounded by a timeout.
//!
//! The pieces, from the bottom up:
//!
//! - [`dbr`]: the ["DBR" types] that carry values and their metadata, and their
//!   byte layouts.
//! - [`transport`]: the [`Transport`](transport::Transport) trait a CA implementation
//!   provides, plus [`MemoryTransport`](transport::MemoryTransport), an in-process
//!   stand in for a server.
//! - [`context`]: a [`ContextRegistry`] of [`Context`]s. Each context owns a
//!   transport and the caches below, and dispatches transport events to them.
//! - [`channel`]: the per-context channel cache and its connection state machine.
//! - [`subscription`] and [`tracker`]: monitors, pending gets and callback puts.
//! - [`decode`]: type promotion to TIME/CTRL variants, and turning payloads into a
//!   [`Reading`].
//! - [`group`]: synchronous groups of gets and puts.
//! - [`pv`]: the [`Pv`] object, with caching, automatic monitoring and callbacks.
//! - [`ca`]: `caget`, `caput`, `camonitor` and `cainfo` conveniences.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use epicars_runtime::{
//!     ClientConfig, ContextRegistry, PvOptions, Value, dbr::DbrValue,
//!     transport::MemoryTransport,
//! };
//!
//! let server = MemoryTransport::new();
//! let temperature = server.add_pv("TEMP1", 23.4f64).unwrap();
//!
//! let registry = ContextRegistry::new(ClientConfig::default(), move || {
//!     Arc::new(server.clone())
//! });
//! let context = registry.context().unwrap();
//! let pv = context.get_pv("TEMP1", PvOptions::default()).unwrap();
//! assert_eq!(pv.get().unwrap(), Value::Float(23.4));
//!
//! pv.put(25.0, true, None).unwrap();
//! assert_eq!(temperature.load(), DbrValue::Double(vec![25.0]));
//! registry.shutdown();
//! ```
//!
//! [EPICS Channel Access protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod ca;
pub mod channel;
pub mod config;
pub mod context;
pub mod dbr;
pub mod decode;
pub mod error;
pub mod group;
pub mod pv;
pub mod subscription;
pub mod tracker;
pub mod transport;

mod utils;

pub use crate::ca::CagetOptions;
pub use crate::channel::{ChannelState, ConnectedChannel};
pub use crate::config::ClientConfig;
pub use crate::context::{Context, ContextRegistry};
pub use crate::decode::{ArrayMode, DecodeMode, Metadata, Reading, Value};
pub use crate::error::{CaError, ErrorCondition};
pub use crate::group::{GroupSlot, SyncGroup};
pub use crate::pv::{GetOptions, Pv, PvOptions, PvUpdates};
pub use crate::subscription::Subscription;
pub use crate::tracker::{GetOutcome, PutOutcome};
