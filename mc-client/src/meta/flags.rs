//! # Meta Flag Registry
//!
//! Purpose: Describe meta protocol flags in one place: how a request flag is
//! written, and how a response flag updates a `MetaResult`.
//!
//! ## Design Principles
//! 1. **Table-Driven Dispatch**: Response codes index a fixed array of parsers,
//!    so new flags never touch the parsing loop.
//! 2. **Build Once, Share Read-Only**: The table is constructed before any
//!    connection exists and then only read through an `Arc`.
//! 3. **Forward Compatible**: Unknown response codes are skipped, not rejected.
//!
//! ## Standard Response Flags
//!
//! ```text
//! W won        Z sent-won    X stale       k key       O opaque
//! c cas (i64)  f flags (u32) h hit (0/1)   l last-access (u64)
//! s size (u64) t ttl (i64, -1 = no expiration)
//! ```

use std::fmt;

use crate::conn::{push_i64, push_u64};
use crate::error::{ClientError, ClientResult};
use crate::meta::{CasToken, MetaResult};

/// Parses one response flag argument into the result.
pub type FlagParser = fn(&mut MetaResult, &str) -> ClientResult<()>;

/// A request flag: single ASCII code plus an optional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFlag {
    code: u8,
    arg: Option<Vec<u8>>,
}

impl MetaFlag {
    /// Flag without an argument.
    pub fn new(code: u8) -> Self {
        MetaFlag { code, arg: None }
    }

    /// Flag carrying a token argument, e.g. `O<opaque>` or `Mx`.
    pub fn with_token(code: u8, token: impl AsRef<[u8]>) -> Self {
        MetaFlag {
            code,
            arg: Some(token.as_ref().to_vec()),
        }
    }

    /// Flag carrying an unsigned decimal argument.
    pub fn with_u64(code: u8, value: u64) -> Self {
        let mut arg = Vec::with_capacity(20);
        push_u64(&mut arg, value);
        MetaFlag {
            code,
            arg: Some(arg),
        }
    }

    /// Flag carrying a signed decimal argument.
    pub fn with_i64(code: u8, value: i64) -> Self {
        let mut arg = Vec::with_capacity(20);
        push_i64(&mut arg, value);
        MetaFlag {
            code,
            arg: Some(arg),
        }
    }

    pub fn code(&self) -> char {
        self.code as char
    }

    pub fn arg(&self) -> Option<&[u8]> {
        self.arg.as_deref()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.code);
        if let Some(arg) = &self.arg {
            out.extend_from_slice(arg);
        }
    }
}

// Request flag constructors, named after the option they implement.

/// b: key is base64-encoded binary.
pub(crate) fn binary_key() -> MetaFlag {
    MetaFlag::new(b'b')
}

/// c: return CAS token.
pub(crate) fn return_cas() -> MetaFlag {
    MetaFlag::new(b'c')
}

/// f: return client flags.
pub(crate) fn return_flags() -> MetaFlag {
    MetaFlag::new(b'f')
}

/// h: return whether the item has been hit before.
pub(crate) fn return_hit() -> MetaFlag {
    MetaFlag::new(b'h')
}

/// k: return the key.
pub(crate) fn return_key() -> MetaFlag {
    MetaFlag::new(b'k')
}

/// l: return seconds since last access.
pub(crate) fn return_last_access() -> MetaFlag {
    MetaFlag::new(b'l')
}

/// O: opaque token echoed back in the response.
pub(crate) fn opaque(token: &str) -> MetaFlag {
    MetaFlag::with_token(b'O', token)
}

/// q: noreply semantics for uninteresting return codes.
pub(crate) fn quiet() -> MetaFlag {
    MetaFlag::new(b'q')
}

/// s: return item size.
pub(crate) fn return_size() -> MetaFlag {
    MetaFlag::new(b's')
}

/// t: return remaining TTL.
pub(crate) fn return_ttl() -> MetaFlag {
    MetaFlag::new(b't')
}

/// u: don't bump the item in the LRU.
pub(crate) fn no_bump() -> MetaFlag {
    MetaFlag::new(b'u')
}

/// v: return the value.
pub(crate) fn return_value() -> MetaFlag {
    MetaFlag::new(b'v')
}

/// N: vivify on miss with the given TTL.
pub(crate) fn vivify(ttl: i64) -> MetaFlag {
    MetaFlag::with_i64(b'N', ttl)
}

/// R: win for recache if the remaining TTL is below the given seconds.
pub(crate) fn recache(ttl: i64) -> MetaFlag {
    MetaFlag::with_i64(b'R', ttl)
}

/// T: update the TTL.
pub(crate) fn set_ttl(ttl: i64) -> MetaFlag {
    MetaFlag::with_i64(b'T', ttl)
}

/// C: compare CAS value before applying the command.
pub(crate) fn compare_cas(token: i64) -> MetaFlag {
    MetaFlag::with_i64(b'C', token)
}

/// F: set client flags.
pub(crate) fn set_flags(flags: u32) -> MetaFlag {
    MetaFlag::with_u64(b'F', u64::from(flags))
}

/// I: invalidate (mark stale) instead of removing or overwriting.
pub(crate) fn invalidate() -> MetaFlag {
    MetaFlag::new(b'I')
}

/// M: mode switch.
pub(crate) fn mode(token: u8) -> MetaFlag {
    MetaFlag::with_token(b'M', [token])
}

/// J: initial value on vivify.
pub(crate) fn initial_value(value: u64) -> MetaFlag {
    MetaFlag::with_u64(b'J', value)
}

/// D: arithmetic delta.
pub(crate) fn delta(value: u64) -> MetaFlag {
    MetaFlag::with_u64(b'D', value)
}

const TABLE_SIZE: usize = 128;

/// Response flag table indexed by ASCII code.
#[derive(Clone)]
pub struct FlagRegistry {
    parsers: [Option<FlagParser>; TABLE_SIZE],
}

impl FlagRegistry {
    /// Registry with no recognized flags; every response flag is skipped.
    pub fn empty() -> Self {
        FlagRegistry {
            parsers: [None; TABLE_SIZE],
        }
    }

    /// Registry with the standard response flags.
    pub fn standard() -> Self {
        let mut registry = FlagRegistry::empty();
        registry.register(b'W', parse_won);
        registry.register(b'Z', parse_sent_won);
        registry.register(b'X', parse_stale);
        registry.register(b'k', parse_key);
        registry.register(b'O', parse_opaque);
        registry.register(b'c', parse_cas);
        registry.register(b'f', parse_flags);
        registry.register(b'h', parse_hit);
        registry.register(b'l', parse_last_access);
        registry.register(b's', parse_size);
        registry.register(b't', parse_ttl);
        registry
    }

    /// Installs `parser` for `code`, replacing any previous entry.
    ///
    /// Returns false (and installs nothing) for non-ASCII codes.
    pub fn register(&mut self, code: u8, parser: FlagParser) -> bool {
        match self.parsers.get_mut(code as usize) {
            Some(slot) => {
                *slot = Some(parser);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, code: u8) -> bool {
        matches!(self.parsers.get(code as usize), Some(Some(_)))
    }

    /// Applies one `<code><argument>` response token.
    pub(crate) fn apply(&self, token: &str, result: &mut MetaResult) -> ClientResult<()> {
        let Some(&code) = token.as_bytes().first() else {
            return Ok(());
        };
        match self.parsers.get(code as usize) {
            Some(Some(parser)) => parser(result, &token[1..]),
            _ => Ok(()),
        }
    }
}

impl Default for FlagRegistry {
    fn default() -> Self {
        FlagRegistry::standard()
    }
}

impl fmt::Debug for FlagRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: String = (0..TABLE_SIZE as u8)
            .filter(|&code| self.is_registered(code))
            .map(char::from)
            .collect();
        f.debug_struct("FlagRegistry").field("codes", &codes).finish()
    }
}

fn invalid(code: u8, arg: &str) -> ClientError {
    ClientError::InvalidFlag {
        code: code as char,
        arg: arg.to_string(),
    }
}

fn parse_num<N: std::str::FromStr>(code: u8, arg: &str) -> ClientResult<N> {
    arg.parse().map_err(|_| invalid(code, arg))
}

fn parse_won(result: &mut MetaResult, _: &str) -> ClientResult<()> {
    result.won = true;
    Ok(())
}

fn parse_sent_won(result: &mut MetaResult, _: &str) -> ClientResult<()> {
    result.sent_won = true;
    Ok(())
}

fn parse_stale(result: &mut MetaResult, _: &str) -> ClientResult<()> {
    result.stale = true;
    Ok(())
}

fn parse_key(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.key = Some(arg.to_string());
    Ok(())
}

fn parse_opaque(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.opaque = Some(arg.to_string());
    Ok(())
}

fn parse_cas(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.cas_token = CasToken::Compare(parse_num(b'c', arg)?);
    Ok(())
}

fn parse_flags(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.flags = Some(parse_num(b'f', arg)?);
    Ok(())
}

fn parse_hit(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.hit = Some(match arg {
        "0" => false,
        "1" => true,
        _ => return Err(invalid(b'h', arg)),
    });
    Ok(())
}

fn parse_last_access(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.last_access = Some(parse_num(b'l', arg)?);
    Ok(())
}

fn parse_size(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.size = Some(parse_num(b's', arg)?);
    Ok(())
}

fn parse_ttl(result: &mut MetaResult, arg: &str) -> ClientResult<()> {
    result.ttl = Some(parse_num(b't', arg)?);
    Ok(())
}
