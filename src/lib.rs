#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ondevice library: the building blocks behind the `ondevice` binary.
//!
//! - `ws`: authenticated WebSocket connections to the relay
//! - `tunnel`: frame codec, liveness and the `Tunnel` state machine
//! - `services`: echo and TCP forward handlers for incoming tunnels
//! - `daemon`: device daemon (pid lock, serve channel, reconnect loop)
//! - `control`: local control socket server and client
//! - `pipe`: stdio bridge used as an ssh `ProxyCommand`
//! - `auth` / `config` / `state`: credentials, configuration and shared state

pub mod auth;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod pipe;
pub mod services;
pub mod state;
pub mod tunnel;
pub mod util;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use error::{Error, ErrorKind, Result};
