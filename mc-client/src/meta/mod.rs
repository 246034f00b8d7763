//! # Meta Protocol Codec
//!
//! Purpose: Encode `mg`/`ms`/`md`/`ma`/`mn` requests and parse their flag-driven
//! responses into `MetaResult`.
//!
//! ## Design Principles
//! 1. **One Envelope**: All four commands share one encoder and one parser.
//! 2. **Registry Dispatch**: Response flags go through `FlagRegistry`.
//! 3. **Absence Is Not Zero**: Result fields are `Option`s filled only when the
//!    server returned the matching flag.
//! 4. **Stay Synchronized**: Quiet requests are always fenced by `mn` and the
//!    fence is consumed before returning.
//!
//! ## Wire Format
//!
//! ```text
//! request:  <cmd> <key> [<datalen>] <flag>*\r\n[<data>\r\n][mn\r\n]
//! response: HD <flag>*\r\n
//!           VA <size> <flag>*\r\n<data>\r\n
//!           NS | EX | EN | NF | MN\r\n
//! ```

pub mod flags;
pub mod options;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::conn::{parse_ascii, push_u64, Connection, Transport, CRLF};
use crate::error::{ClientError, ClientResult};
use crate::item::legal_key;
use crate::text::unexpected;

pub use flags::{FlagParser, FlagRegistry, MetaFlag};
pub use options::{
    ArithmeticMode, MetaArithmeticOptions, MetaDeleteOptions, MetaGetOptions, MetaSetMode,
    MetaSetOptions,
};

const NOOP: &[u8] = b"mn\r\n";

/// Compare-and-swap token for meta writes.
///
/// `Unset` writes unconditionally. `Compare(v)` always emits `C<v>`, including
/// `Compare(0)`, which no live item can match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CasToken {
    #[default]
    Unset,
    Compare(i64),
}

impl CasToken {
    /// Token that only succeeds when the item does not carry a CAS value yet.
    pub const NOT_EXISTS: CasToken = CasToken::Compare(0);

    pub fn is_set(&self) -> bool {
        matches!(self, CasToken::Compare(_))
    }

    pub fn value(&self) -> Option<i64> {
        match self {
            CasToken::Unset => None,
            CasToken::Compare(value) => Some(*value),
        }
    }

    pub(crate) fn flag(&self) -> Option<MetaFlag> {
        self.value().map(flags::compare_cas)
    }
}

/// Key for a meta command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaKey {
    /// Sent as-is; must satisfy the text key rules.
    Text(String),
    /// Sent base64-encoded together with the `b` flag.
    Binary(Vec<u8>),
}

impl MetaKey {
    /// Wire form of the key and whether the `b` flag is needed.
    fn encode(&self) -> ClientResult<(String, bool)> {
        let (wire, binary) = match self {
            MetaKey::Text(key) => (key.clone(), false),
            MetaKey::Binary(bytes) => (BASE64.encode(bytes), true),
        };
        if !legal_key(wire.as_bytes()) {
            return Err(ClientError::MalformedKey);
        }
        Ok((wire, binary))
    }
}

impl Default for MetaKey {
    fn default() -> Self {
        MetaKey::Text(String::new())
    }
}

impl From<&str> for MetaKey {
    fn from(key: &str) -> Self {
        MetaKey::Text(key.to_string())
    }
}

impl From<String> for MetaKey {
    fn from(key: String) -> Self {
        MetaKey::Text(key)
    }
}

impl From<Vec<u8>> for MetaKey {
    fn from(key: Vec<u8>) -> Self {
        MetaKey::Binary(key)
    }
}

impl From<&[u8]> for MetaKey {
    fn from(key: &[u8]) -> Self {
        MetaKey::Binary(key.to_vec())
    }
}

/// Parsed meta response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaResult {
    /// Set on every parsed response: the returned `c` value, or `Compare(0)`
    /// when the server sent none. Feeding it into a later write therefore
    /// never degrades into an unconditional write.
    pub cas_token: CasToken,
    pub flags: Option<u32>,
    pub key: Option<String>,
    pub last_access: Option<u64>,
    pub opaque: Option<String>,
    pub size: Option<u64>,
    /// Remaining TTL in seconds, `-1` for no expiration.
    pub ttl: Option<i64>,
    pub value: Option<Vec<u8>>,
    pub hit: Option<bool>,
    /// This caller created the item on miss and should populate it.
    pub won: bool,
    /// Another caller already won; this one should wait or serve stale.
    pub sent_won: bool,
    pub stale: bool,
    no_op: bool,
}

impl MetaResult {
    /// True when the server answered only with the `MN` fence, i.e. a quiet
    /// request whose reply was suppressed.
    pub fn is_no_op(&self) -> bool {
        self.no_op
    }

    /// Returned value parsed as a decimal counter, as produced by `ma ... v`.
    pub fn counter(&self) -> Option<u64> {
        self.value.as_deref().and_then(parse_ascii)
    }
}

impl<T: Transport> Connection<T> {
    /// `mg`: fetch an item's value and/or metadata.
    pub fn meta_get(&mut self, opts: &MetaGetOptions) -> ClientResult<MetaResult> {
        self.meta_command(b"mg", &opts.key, &opts.flags(), None, opts.quiet)
    }

    /// `ms`: store a value.
    pub fn meta_set(&mut self, opts: &MetaSetOptions) -> ClientResult<MetaResult> {
        self.meta_command(b"ms", &opts.key, &opts.flags(), Some(opts.value.as_slice()), opts.quiet)
    }

    /// `md`: delete or invalidate an item.
    pub fn meta_delete(&mut self, opts: &MetaDeleteOptions) -> ClientResult<MetaResult> {
        self.meta_command(b"md", &opts.key, &opts.flags(), None, opts.quiet)
    }

    /// `ma`: increment or decrement a counter.
    pub fn meta_arithmetic(&mut self, opts: &MetaArithmeticOptions) -> ClientResult<MetaResult> {
        self.meta_command(b"ma", &opts.key, &opts.flags(), None, opts.quiet)
    }

    /// `mn`: round trip a no-op.
    pub fn meta_noop(&mut self) -> ClientResult<()> {
        self.request().extend_from_slice(NOOP);
        self.send()?;
        self.expect_noop()
    }

    fn meta_command(
        &mut self,
        cmd: &[u8],
        key: &MetaKey,
        flags: &[MetaFlag],
        data: Option<&[u8]>,
        quiet: bool,
    ) -> ClientResult<MetaResult> {
        let (key, binary) = key.encode()?;

        let buf = self.request();
        buf.extend_from_slice(cmd);
        buf.push(b' ');
        buf.extend_from_slice(key.as_bytes());
        if let Some(data) = data {
            buf.push(b' ');
            push_u64(buf, data.len() as u64);
        }
        if binary {
            buf.push(b' ');
            flags::binary_key().encode(buf);
        }
        for flag in flags {
            buf.push(b' ');
            flag.encode(buf);
        }
        buf.extend_from_slice(CRLF);
        if let Some(data) = data {
            buf.extend_from_slice(data);
            buf.extend_from_slice(CRLF);
        }
        if quiet {
            buf.extend_from_slice(NOOP);
        }
        self.send()?;

        let result = self.read_meta_response();
        if quiet {
            // A real reply came back, so the fence is still in the buffer.
            let fenced = match &result {
                Ok(parsed) => !parsed.no_op,
                Err(err) => err.is_resumable(),
            };
            if fenced {
                self.expect_noop()?;
            }
        }
        result
    }

    fn read_meta_response(&mut self) -> ClientResult<MetaResult> {
        let line = self.read_line()?;
        let line = match std::str::from_utf8(line) {
            Ok(line) => line.to_string(),
            Err(_) => return Err(unexpected(line)),
        };

        let mut tokens = line.split_ascii_whitespace();
        let mut result = MetaResult::default();
        let mut size = None;
        match tokens.next().unwrap_or_default() {
            "HD" => {}
            "VA" => {
                let announced = tokens.next().and_then(|raw| raw.parse::<usize>().ok());
                match announced {
                    Some(len) => size = Some(len),
                    None => {
                        return Err(ClientError::CorruptResponse(format!(
                            "bad value size in {line:?}"
                        )))
                    }
                }
            }
            "MN" => {
                result.no_op = true;
                return Ok(result);
            }
            "NS" => return Err(ClientError::NotStored),
            "EX" => return Err(ClientError::CasConflict),
            "EN" | "NF" => return Err(ClientError::CacheMiss),
            _ => return Err(unexpected(line.as_bytes())),
        }

        if let Some(size) = size {
            result.value = Some(self.read_payload(size)?);
        }

        result.cas_token = CasToken::NOT_EXISTS;
        let registry = self.registry();
        for token in tokens {
            registry.apply(token, &mut result)?;
        }
        Ok(result)
    }

    fn expect_noop(&mut self) -> ClientResult<()> {
        let line = self.read_line()?;
        if line == b"MN" {
            Ok(())
        } else {
            Err(unexpected(line))
        }
    }
}
