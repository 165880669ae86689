//! Shared model types and small runtime utilities for the connet fabric.
//!
//! Everything here is independent of the transport: the naming model
//! ([`Forward`], [`Role`], [`HostPort`]), the latched notifier used to fan
//! out state changes ([`notify::Watch`]), and networking helpers shared by
//! the client, relay and control server.

pub mod model;
pub mod net;
pub mod notify;

pub use model::{Forward, HostPort, Role, RouteOption};
