//! # membus
//!
//! An in-process message bus engine with kernel-bus semantics: typed,
//! structured messages between connections on named buses, well-known
//! name resolution with activator handoff, SEE/TALK/OWN policy
//! enforcement, synchronous and asynchronous request/reply, and
//! per-receiver zero-copy receive pools.
//!
//! The engine is transport-agnostic: commands arrive as method calls and
//! message payloads land as byte slices in each receiver's private pool,
//! addressed by offset. Device nodes, wire framing and handle passing are
//! the business of an outer transport layer; the core treats transferable
//! handles as opaque tokens.

pub mod bloom;
pub mod bus;
pub mod connection;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod item;
pub mod logging;
pub mod match_db;
pub mod meta;
pub mod names;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod reply;
pub mod util;

pub use bloom::{BloomFilter, BloomParams};
pub use bus::{Bus, BusLimits};
pub use connection::{
    ConnInfoRecord, Connection, InfoQuery, NameListRecord, RecvCmd, RecvMode, RecvReply, Role,
    SendReply, UpdateCmd,
};
pub use domain::{BusCreateRequest, Domain, DomainLimits};
pub use endpoint::{Endpoint, EndpointPermissions, HelloReply, HelloRequest};
pub use error::{Error, Quota, Result};
pub use item::{DeliveredMessage, Item, Message};
pub use match_db::{MatchItem, MatchRule};
pub use names::AcquireOutcome;
pub use policy::{Access, PolicyRule, Principal};

/// The current version of the bus engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default quota and sizing values
pub mod limits {
    /// Default receive pool size in bytes
    pub const DEFAULT_POOL_SIZE: usize = 64 * 1024;

    /// Total messages queued on one connection
    pub const MAX_MSGS: usize = 256;

    /// Messages queued on one connection from a single sending uid
    pub const MAX_MSGS_PER_USER: usize = 16;

    /// Outbound requests awaiting a reply per connection
    pub const MAX_REQUESTS_PENDING: usize = 128;

    /// Connections one uid may hold on a domain
    pub const MAX_CONNECTIONS_PER_USER: usize = 256;

    /// Buses one uid may create on a domain
    pub const MAX_BUSES_PER_USER: usize = 16;
}
