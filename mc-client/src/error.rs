//! # Client Errors
//!
//! Purpose: One error type for every public operation, split along the line
//! the pool cares about: protocol-level outcomes that leave the connection
//! synchronized, and everything else.
//!
//! ## Design Principles
//! 1. **Single Taxonomy**: Codec, connection and pool all return `ClientError`.
//! 2. **Undecorated Propagation**: Errors are never wrapped or rewritten on the
//!    way up; the pool only inspects them.
//! 3. **Verbatim Server Text**: `CLIENT_ERROR`/`SERVER_ERROR` messages are kept
//!    exactly as the server sent them.

use std::io;

use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Key absent on a read, or the target of a conditional write is absent.
    #[error("memcache: cache miss")]
    CacheMiss,

    /// The compare token did not match the item's current token.
    #[error("memcache: compare-and-swap conflict")]
    CasConflict,

    /// A conditional write's precondition was not satisfied.
    #[error("memcache: item not stored")]
    NotStored,

    /// Key is empty, longer than 250 bytes, or contains whitespace/control bytes.
    #[error("memcache: key is too long or contains invalid characters")]
    MalformedKey,

    /// Server replied `CLIENT_ERROR <message>`.
    #[error("memcache: client error: {0}")]
    Client(String),

    /// Server replied `SERVER_ERROR <message>`.
    #[error("memcache: server error: {0}")]
    Server(String),

    /// Status line did not match anything the command can produce.
    #[error("memcache: unexpected response line: {0:?}")]
    UnexpectedResponse(String),

    /// A length-prefixed payload or value header was malformed.
    #[error("memcache: corrupt response: {0}")]
    CorruptResponse(String),

    /// A recognized meta response flag carried an unparseable argument.
    #[error("memcache: invalid meta flag {code:?} argument {arg:?}")]
    InvalidFlag { code: char, arg: String },

    /// Network or IO failure while reading/writing.
    #[error("memcache: io error: {0}")]
    Io(io::Error),

    /// The call or checkout deadline elapsed.
    #[error("memcache: deadline exceeded")]
    Timeout,

    /// Pool is at capacity and configured not to wait.
    #[error("memcache: connection pool exhausted")]
    PoolExhausted,

    /// Pool was closed.
    #[error("memcache: connection pool closed")]
    PoolClosed,

    /// Address could not be resolved into a socket address.
    #[error("memcache: invalid address {0:?}")]
    InvalidAddress(String),
}

impl ClientError {
    /// Returns true if the connection that produced this error is still
    /// protocol-synchronized and may go back to the pool.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            ClientError::CacheMiss
                | ClientError::CasConflict
                | ClientError::NotStored
                | ClientError::MalformedKey
                | ClientError::Client(_)
        )
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // Socket timeouts surface as WouldBlock on Unix, TimedOut on Windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
            _ => ClientError::Io(err),
        }
    }
}

/// Reuse decision for a finished call: `Ok` or a resumable error.
pub fn is_resumable<T>(result: &ClientResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => err.is_resumable(),
    }
}
