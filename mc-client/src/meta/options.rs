//! Per-command option structs for the meta protocol.
//!
//! Each struct turns into an ordered flag list. Build them with struct update
//! syntax:
//!
//! ```rust
//! use mc_client::MetaGetOptions;
//!
//! let opts = MetaGetOptions {
//!     return_value: true,
//!     return_cas: true,
//!     ..MetaGetOptions::new("user:42")
//! };
//! assert!(opts.return_value);
//! ```

use crate::meta::flags::{self, MetaFlag};
use crate::meta::{CasToken, MetaKey};

/// Options for `mg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaGetOptions {
    pub key: MetaKey,
    pub return_cas: bool,
    pub return_flags: bool,
    pub return_hit: bool,
    pub return_key: bool,
    pub return_last_access: bool,
    pub return_size: bool,
    /// Remaining TTL in seconds, `-1` for unlimited.
    pub return_ttl: bool,
    pub return_value: bool,
    /// Don't bump the item in the LRU.
    pub no_bump: bool,
    /// Update the remaining TTL.
    pub set_ttl: Option<i64>,
    /// On miss, create an empty item with this TTL and hand the caller the
    /// `won` flag.
    pub vivify_ttl: Option<i64>,
    /// Win for recache if the remaining TTL is below this many seconds.
    pub recache_ttl: Option<i64>,
    pub opaque: Option<String>,
    pub quiet: bool,
}

impl MetaGetOptions {
    pub fn new(key: impl Into<MetaKey>) -> Self {
        MetaGetOptions {
            key: key.into(),
            ..Default::default()
        }
    }

    pub(crate) fn flags(&self) -> Vec<MetaFlag> {
        let mut fs = Vec::new();
        if let Some(ttl) = self.vivify_ttl {
            fs.push(flags::vivify(ttl));
        }
        if self.return_cas {
            fs.push(flags::return_cas());
        }
        if self.return_flags {
            fs.push(flags::return_flags());
        }
        if self.return_hit {
            fs.push(flags::return_hit());
        }
        if self.return_key {
            fs.push(flags::return_key());
        }
        if self.return_last_access {
            fs.push(flags::return_last_access());
        }
        if self.return_size {
            fs.push(flags::return_size());
        }
        if self.return_ttl {
            fs.push(flags::return_ttl());
        }
        if self.return_value {
            fs.push(flags::return_value());
        }
        if self.no_bump {
            fs.push(flags::no_bump());
        }
        if let Some(ttl) = self.set_ttl {
            fs.push(flags::set_ttl(ttl));
        }
        if let Some(ttl) = self.recache_ttl {
            fs.push(flags::recache(ttl));
        }
        push_common(&mut fs, self.opaque.as_deref(), self.quiet);
        fs
    }
}

/// Storage mode for `ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSetMode {
    /// Store only if the key is absent.
    Add,
    Append,
    Prepend,
    /// Store only if the key is present.
    Replace,
    Set,
}

impl MetaSetMode {
    fn token(self) -> u8 {
        match self {
            MetaSetMode::Add => b'E',
            MetaSetMode::Append => b'A',
            MetaSetMode::Prepend => b'P',
            MetaSetMode::Replace => b'R',
            MetaSetMode::Set => b'S',
        }
    }
}

/// Options for `ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSetOptions {
    pub key: MetaKey,
    pub value: Vec<u8>,
    pub cas: CasToken,
    /// Return the new CAS token when stored.
    pub return_cas: bool,
    pub set_ttl: Option<i64>,
    pub set_flags: Option<u32>,
    /// Set-to-invalid if the supplied CAS is older than the item's.
    pub invalidate: bool,
    pub mode: Option<MetaSetMode>,
    pub opaque: Option<String>,
    pub quiet: bool,
}

impl MetaSetOptions {
    pub fn new(key: impl Into<MetaKey>, value: impl Into<Vec<u8>>) -> Self {
        MetaSetOptions {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub(crate) fn flags(&self) -> Vec<MetaFlag> {
        let mut fs = Vec::new();
        if self.return_cas {
            fs.push(flags::return_cas());
        }
        if let Some(value) = self.set_flags {
            fs.push(flags::set_flags(value));
        }
        if self.invalidate {
            fs.push(flags::invalidate());
        }
        if let Some(mode) = self.mode {
            fs.push(flags::mode(mode.token()));
        }
        if let Some(ttl) = self.set_ttl {
            fs.push(flags::set_ttl(ttl));
        }
        fs.extend(self.cas.flag());
        push_common(&mut fs, self.opaque.as_deref(), self.quiet);
        fs
    }
}

/// Options for `md`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaDeleteOptions {
    pub key: MetaKey,
    pub cas: CasToken,
    /// New TTL; only meaningful together with `invalidate`.
    pub set_ttl: Option<i64>,
    /// Mark stale and bump the CAS instead of removing.
    pub invalidate: bool,
    pub opaque: Option<String>,
    pub quiet: bool,
}

impl MetaDeleteOptions {
    pub fn new(key: impl Into<MetaKey>) -> Self {
        MetaDeleteOptions {
            key: key.into(),
            ..Default::default()
        }
    }

    pub(crate) fn flags(&self) -> Vec<MetaFlag> {
        let mut fs = Vec::new();
        if self.invalidate {
            fs.push(flags::invalidate());
        }
        if let Some(ttl) = self.set_ttl {
            fs.push(flags::set_ttl(ttl));
        }
        fs.extend(self.cas.flag());
        push_common(&mut fs, self.opaque.as_deref(), self.quiet);
        fs
    }
}

/// Direction for `ma`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticMode {
    Increment,
    Decrement,
}

impl ArithmeticMode {
    fn token(self) -> u8 {
        match self {
            ArithmeticMode::Increment => b'I',
            ArithmeticMode::Decrement => b'D',
        }
    }
}

/// Options for `ma`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaArithmeticOptions {
    pub key: MetaKey,
    pub cas: CasToken,
    pub return_cas: bool,
    pub return_ttl: bool,
    /// Return the new counter value; see `MetaResult::counter`.
    pub return_value: bool,
    pub set_ttl: Option<i64>,
    /// Create the counter on miss with this TTL.
    pub vivify_ttl: Option<i64>,
    /// Value used when the counter is created on miss (server default 0).
    pub initial_value: Option<u64>,
    /// Amount to apply (server default 1).
    pub delta: Option<u64>,
    pub mode: Option<ArithmeticMode>,
    pub opaque: Option<String>,
    pub quiet: bool,
}

impl MetaArithmeticOptions {
    pub fn new(key: impl Into<MetaKey>) -> Self {
        MetaArithmeticOptions {
            key: key.into(),
            ..Default::default()
        }
    }

    pub(crate) fn flags(&self) -> Vec<MetaFlag> {
        let mut fs = Vec::new();
        if let Some(ttl) = self.vivify_ttl {
            fs.push(flags::vivify(ttl));
        }
        if self.return_cas {
            fs.push(flags::return_cas());
        }
        if let Some(delta) = self.delta {
            fs.push(flags::delta(delta));
        }
        if let Some(value) = self.initial_value {
            fs.push(flags::initial_value(value));
        }
        if self.return_ttl {
            fs.push(flags::return_ttl());
        }
        if self.return_value {
            fs.push(flags::return_value());
        }
        if let Some(mode) = self.mode {
            fs.push(flags::mode(mode.token()));
        }
        if let Some(ttl) = self.set_ttl {
            fs.push(flags::set_ttl(ttl));
        }
        fs.extend(self.cas.flag());
        push_common(&mut fs, self.opaque.as_deref(), self.quiet);
        fs
    }
}

fn push_common(fs: &mut Vec<MetaFlag>, opaque: Option<&str>, quiet: bool) {
    if let Some(token) = opaque {
        fs.push(flags::opaque(token));
    }
    if quiet {
        fs.push(flags::quiet());
    }
}
