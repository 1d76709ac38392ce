#![cfg_attr(docsrs, feature(doc_cfg))]
//! # gt06_lib
//!
//! This crate implements the protocol engine of a gateway for GT06-family GPS
//! trackers. Devices keep a TCP connection open, log in with their IMEI and
//! then stream location and status frames.
//!
//! The engine is split into layers that can be used on their own:
//!
//! - [`protocol`]: frame checksum, per-message decoders and acknowledgement encoding.
//! - [`frame`]: reassembly of frames from an arbitrarily chunked byte stream.
//! - [`session`]: per-connection login state and the merged telemetry snapshot.
//! - [`sink`]: the interface to storage and live fan-out.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `gt06-gateway` command-line tool.
//!
//! ### Server Features
//! - `tokio-server`: Enables the **asynchronous** TCP gateway built on `tokio`.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `gt06-gateway` binary executable.

/// Contains error types for the library.
mod error;
/// Reassembles raw frames from the connection byte stream.
pub mod frame;
/// Defines the GT06 wire protocol.
pub mod protocol;
/// Per-connection device state.
pub mod session;
/// Downstream consumers of telemetry.
pub mod sink;

pub use error::Error;

/// Asynchronous TCP gateway.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-server")))]
#[cfg(feature = "tokio-server")]
pub mod tokio_server;
