//! # Items and Keys
//!
//! Cache records as seen by the classic commands, plus the key legality rule
//! shared by both protocol families.

/// Maximum key length accepted by the server, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// An item to be stored in, or fetched from, the cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    /// Item key (at most 250 bytes, no whitespace or control bytes).
    pub key: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Server-opaque flags; semantics are up to the application.
    pub flags: u32,
    /// Expiration in seconds: relative up to one month, absolute Unix time
    /// beyond that, `0` for never.
    pub expiration: i32,
    // Compare-and-swap id, only filled in by fetches.
    pub(crate) cas_id: u64,
}

impl Item {
    /// Creates an item with zero flags and no expiration.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            ..Item::default()
        }
    }

    /// Sets the client flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the expiration in seconds.
    pub fn with_expiration(mut self, expiration: i32) -> Self {
        self.expiration = expiration;
        self
    }

    /// Compare-and-swap id returned by the fetch that produced this item.
    ///
    /// Zero for items built by the caller or fetched with plain `get` from a
    /// server that did not report one.
    pub fn cas_id(&self) -> u64 {
        self.cas_id
    }
}

/// Returns true when `key` is safe to put on a text protocol line.
pub fn legal_key(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return false;
    }
    key.iter().all(|&b| b > b' ' && b != 0x7f)
}
