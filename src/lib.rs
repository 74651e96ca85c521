// #![warn(missing_docs)]

//! Channel Access style process-variable channels, monitors and an in-process
//! PV server.
//!
//! A process variable (PV) is a named, typed value, either a scalar or a
//! fixed-length array, that can be read, written and watched for changes. This
//! crate is the client side of that model, together with the pieces needed to
//! serve PVs to it from inside the same process:
//!
//! - Representing values and their metadata (["DBR" types]) in module [dbr],
//!   and the typed snapshots handed to users in module [records].
//! - A [Context] that owns the transport, its runtime and the
//!   [`cache::NativeChannelCache`], reference counted by its users.
//! - [Channel], the per-PV facade: connection management, metadata, blocking
//!   and callback gets and puts, and [Monitor]s. Values can pass through a
//!   [`transform::ValueTransform`] between raw and physical units.
//! - [BatchGetRequest], which fetches many channels behind a single wait.
//! - [Transport](transport::Transport), the seam behind channels. The built-in
//!   [`transport::InprocTransport`] connects channels to [Provider]s attached
//!   to an [`transport::InprocBus`].
//! - A [PvServer] that publishes memory-backed PVs on a bus, and the
//!   [provisioning] helpers that bulk-register the PVs of accelerator device
//!   nodes along with their limit PVs.
//!
//! ## Example
//!
//! Serve a PV and read it back through a channel:
//!
//! ```
//! # use std::{sync::Arc, time::Duration};
//! use pvlink::{
//!     Context, ContextConfig, PvServer,
//!     dbr::DbrBasicType,
//!     transport::{InprocBus, InprocTransport},
//! };
//!
//! let bus = InprocBus::new();
//! let server = PvServer::with_host_name(&bus, "sim");
//! server.register_pv("Magnet1:I", 3.5f64, DbrBasicType::Double).unwrap();
//!
//! let context = Context::with_transport(
//!     Arc::new(InprocTransport::new(bus)),
//!     ContextConfig::from_env(),
//! );
//! let channel = pvlink::Channel::new("Magnet1:I", &context);
//! assert!(channel.connect_and_wait(Duration::from_secs(2)));
//! channel.put_val(4.0f64).unwrap();
//! assert_eq!(channel.get_value::<f64>().unwrap(), 4.0);
//! ```
//!
//! ## Configuration
//!
//! Defaults are read from the environment when a [ContextConfig] is built:
//!
//! - `PVLINK_TRANSPORT`: transport name, default `inproc`
//! - `PVLINK_IO_TIMEOUT`: seconds, default 5
//! - `PVLINK_EVENT_TIMEOUT`: seconds, default 0.1
//! - `PVLINK_MAX_SEARCH_PERIOD`: seconds between searches at most, default 60
//! - `PVLINK_TRANSPORT_THREADS`: runtime worker threads, default 2
//!
//! Logging goes through [tracing]; install any subscriber to see it.
//!
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod batch;
pub mod cache;
pub mod channel;
pub mod context;
pub mod dbr;
pub mod error;
pub mod factory;
pub mod monitor;
pub mod naming;
pub mod pending;
pub mod protocol;
pub mod providers;
pub mod provisioning;
pub mod records;
pub mod server;
pub mod transform;
pub mod transport;
mod utils;

pub use crate::batch::BatchGetRequest;
pub use crate::channel::{Channel, ConnectionEvent, ConnectionState};
pub use crate::context::{Context, ContextConfig};
pub use crate::error::{ConnectionError, GetError, MonitorError, PutError};
pub use crate::factory::ChannelFactory;
pub use crate::monitor::{Monitor, MonitorKind};
pub use crate::providers::Provider;
pub use crate::server::PvServer;
