#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod arena;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod host;
pub mod options;
pub mod pool;
pub mod resource;
pub mod transport;

pub use error::{Error, ErrorKind, PoolFailureReason, Result};
pub use host::{Host, HostDescription, HostId, Priority};
pub use options::ConnectionPoolOptions;
pub use pool::client::ClientState;
pub use pool::core::{ActiveClientOps, ClientId, ClientLifecycle, ConnectAttempt, DrainBehavior, PoolCore};
pub use pool::{ConnectionPool, HttpConnectionPool, TcpConnectionPool};
pub use pool::http1::{FixedHttpPool, Http1CodecFactory, Http1Client, Http1Context, Http1Ops, Http1PoolCallbacks};
pub use pool::pending::{CancelHandle, CancelPolicy, PendingStream};
pub use pool::tcp::{TcpClient, TcpOps, TcpPool, TcpUpstream, TcpUpstreamCallbacks};
pub use resource::{ResourceLimit, ResourceManager};
