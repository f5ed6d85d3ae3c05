#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::implicit_hasher)]

//! natfwd library: the forwarder relay and the client library that talks to it.
//!
//! - `frame` — wire frames and the async frame reader/writer
//! - `rpc` — control-plane messages carried on control streams
//! - `flow` — credit counter shared by both ends of a flow-controlled stream
//! - `forwarder` — the relay: admission, session tables, reader/writer tasks
//! - `natlayer` — `nat_waitforconn` / `nat_openconn` / `nat_stopcomm` and friends
//! - `config` — configuration loading
//! - `supervisor` — restart loop used by `natfwd supervise`

pub mod config;
pub mod error;
pub mod flow;
pub mod forwarder;
pub mod frame;
pub mod natlayer;
pub mod rpc;
pub mod supervisor;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{ConfigError, FrameError, NatError, RpcError};
pub use forwarder::{Forwarder, StatsSnapshot};
pub use frame::{Frame, Status};
pub use natlayer::{handler, ListenHandle, NatLayer, VirtualStream};
