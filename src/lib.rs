//! Reliable, connection-oriented remote access to (persistent) memory over
//! RDMA-capable NICs.
//!
//! The crate wraps the verbs provider and its connection manager into a
//! small object graph: a [`Peer`] owns a protection domain and registers
//! caller buffers as [`LocalMr`]s; a [`ConnReq`] resolves and arms a
//! reliable connection which [`ConnReq::connect`] promotes into a [`Conn`];
//! an [`Endpoint`] listens for incoming requests. A connection posts
//! one-sided reads against a [`RemoteMr`] decoded from a peer's wire
//! descriptor and delivers [`Completion`]s and lifecycle [`ConnEvent`]s.
//!
//! The API is blocking. The suspension points are outgoing
//! [`ConnReq::new`], [`ConnReq::connect`], [`Endpoint::next_conn_req`],
//! [`Conn::next_event`] and [`Conn::next_completion`]; everything else is
//! bounded local work. Reactive environments are expected to wrap the
//! blocking entry points in dedicated workers.
#![deny(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces
)]

/// Communication identifier wrapper
mod cm_id;
/// Completion event channel
mod comp_channel;
/// The completion queue and completion records
mod completion_queue;
/// The connection object and its state machine
mod conn;
/// Connect/accept handshake configuration
mod conn_cfg;
/// Incoming and outgoing connection requests
mod conn_req;
/// Device context lookup
mod context;
/// The live connection endpoint for servers
mod ep;
/// Error taxonomy and the thread-local error channel
mod error;
/// Connection-manager event channel
mod event_channel;
/// Memory region abstraction
mod memory_region;
/// The peer, root of the object graph
mod peer;
/// Protection domain wrapper
mod protection_domain;
/// Read work request construction
mod work_request;

pub use completion_queue::{Completion, Op, WcError};
pub use conn::{Conn, ConnEvent};
pub use conn_cfg::{ConnCfg, ConnCfgBuilder};
pub use conn_req::{ConnReq, PRIVATE_DATA_MAX};
pub use context::Context;
pub use ep::Endpoint;
pub use error::{
    err_get_msg, err_get_provider_error, Result, RpmaError, E_INVAL, E_NOMEM, E_NOSUPP,
    E_PROVIDER, E_UNKNOWN,
};
pub use memory_region::{local::LocalMr, remote::RemoteMr, MrUsage, Placement, DESCRIPTOR_SIZE};
pub use peer::Peer;

use enumflags2::bitflags;

/// Flags modifying how a read is posted
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadFlag {
    /// Generate a completion even when the transport could elide it
    WaitForCompletion = 0b1,
}
