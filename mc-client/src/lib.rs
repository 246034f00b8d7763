//! # Memcached Client
//!
//! Purpose: Provide a blocking memcached client speaking both the classic text
//! protocol and the meta protocol, with connection pooling and per-call
//! deadlines.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Resumable Errors**: Only connections whose last exchange ended cleanly
//!    are reused; everything else is closed.
//! 3. **Table-Driven Flags**: Meta response flags are parsed through a registry
//!    built once and shared by every connection.
//! 4. **Transport Seam**: Codec and pool are generic over the byte stream, so
//!    tests run against in-memory transports.
//!
//! ## Example
//!
//! ```no_run
//! use mc_client::{Client, Item};
//!
//! let client = Client::connect("127.0.0.1:11211")?;
//! client.set(&Item::new("greeting", "hello").with_expiration(60))?;
//! let item = client.get("greeting")?;
//! assert_eq!(item.value, b"hello");
//! # Ok::<(), mc_client::ClientError>(())
//! ```

mod client;
mod conn;
mod error;
mod item;
pub mod meta;
mod pool;
mod text;

pub use client::{Client, ClientConfig};
pub use conn::{Connection, ConnectionFactory, TcpConnector, Transport};
pub use error::{is_resumable, ClientError, ClientResult};
pub use item::{legal_key, Item, MAX_KEY_LEN};
pub use meta::{
    ArithmeticMode, CasToken, FlagParser, FlagRegistry, MetaArithmeticOptions, MetaDeleteOptions,
    MetaFlag, MetaGetOptions, MetaKey, MetaResult, MetaSetMode, MetaSetOptions,
};
pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection};
