//! # Classic Text Protocol
//!
//! Purpose: Encode the fixed-verb commands (`get`, `set`, `incr`, ...) and map
//! their status lines onto `ClientError`.
//!
//! ## Design Principles
//! 1. **Validate Before Writing**: Keys are checked before a single byte is
//!    buffered, so a `MalformedKey` never leaves a half-written request.
//! 2. **Exact Framing**: Value blocks are read by their announced length and
//!    must end in CRLF.
//! 3. **Server Semantics**: Counter wraparound and floor-at-zero are whatever
//!    the server answers; the client only parses the number.

use std::collections::HashMap;

use crate::conn::{parse_ascii, push_i64, push_u64, Connection, Transport, CRLF};
use crate::error::{ClientError, ClientResult};
use crate::item::{legal_key, Item};

const RESULT_OK: &[u8] = b"OK";
const RESULT_STORED: &[u8] = b"STORED";
const RESULT_NOT_STORED: &[u8] = b"NOT_STORED";
const RESULT_EXISTS: &[u8] = b"EXISTS";
const RESULT_NOT_FOUND: &[u8] = b"NOT_FOUND";
const RESULT_DELETED: &[u8] = b"DELETED";
const RESULT_END: &[u8] = b"END";
const RESULT_TOUCHED: &[u8] = b"TOUCHED";

const PREFIX_VALUE: &[u8] = b"VALUE ";
const PREFIX_VERSION: &[u8] = b"VERSION ";
const PREFIX_CLIENT_ERROR: &[u8] = b"CLIENT_ERROR ";
const PREFIX_SERVER_ERROR: &[u8] = b"SERVER_ERROR ";

const VERB_SET: &[u8] = b"set";
const VERB_ADD: &[u8] = b"add";
const VERB_REPLACE: &[u8] = b"replace";
const VERB_APPEND: &[u8] = b"append";
const VERB_PREPEND: &[u8] = b"prepend";
const VERB_CAS: &[u8] = b"cas";
const VERB_INCR: &[u8] = b"incr";
const VERB_DECR: &[u8] = b"decr";

impl<T: Transport> Connection<T> {
    /// Fetches one item. A missing key is `CacheMiss`.
    pub fn get(&mut self, key: &str) -> ClientResult<Item> {
        check_key(key)?;
        let buf = self.request();
        buf.extend_from_slice(b"get ");
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(CRLF);
        self.send()?;

        let mut items = self.read_items()?;
        items.remove(key).ok_or(ClientError::CacheMiss)
    }

    /// Fetches several items with one `gets`, CAS ids included.
    ///
    /// Missing keys are simply absent from the returned map.
    pub fn get_multi<K: AsRef<str>>(&mut self, keys: &[K]) -> ClientResult<HashMap<String, Item>> {
        for key in keys {
            check_key(key.as_ref())?;
        }
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let buf = self.request();
        buf.extend_from_slice(b"gets");
        for key in keys {
            buf.push(b' ');
            buf.extend_from_slice(key.as_ref().as_bytes());
        }
        buf.extend_from_slice(CRLF);
        self.send()?;

        self.read_items()
    }

    /// Stores the item unconditionally.
    pub fn set(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_SET, item)
    }

    /// Stores the item only if the key is absent; `NotStored` otherwise.
    pub fn add(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_ADD, item)
    }

    /// Stores the item only if the key is present; `NotStored` otherwise.
    pub fn replace(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_REPLACE, item)
    }

    /// Appends the item's value to the existing value.
    pub fn append(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_APPEND, item)
    }

    /// Prepends the item's value to the existing value.
    pub fn prepend(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_PREPEND, item)
    }

    /// Stores an item previously fetched with its CAS id, if nobody changed it
    /// in between. `CasConflict` if modified, `NotStored`/`CacheMiss` if evicted.
    pub fn compare_and_swap(&mut self, item: &Item) -> ClientResult<()> {
        self.populate_one(VERB_CAS, item)
    }

    /// Deletes a key. `CacheMiss` if it did not exist.
    pub fn delete(&mut self, key: &str) -> ClientResult<()> {
        check_key(key)?;
        let buf = self.request();
        buf.extend_from_slice(b"delete ");
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(CRLF);
        self.expect_status(RESULT_DELETED)
    }

    /// Increments a decimal counter; wraps around on 64-bit overflow.
    pub fn increment(&mut self, key: &str, delta: u64) -> ClientResult<u64> {
        self.incr_decr(VERB_INCR, key, delta)
    }

    /// Decrements a decimal counter; stops at zero.
    pub fn decrement(&mut self, key: &str, delta: u64) -> ClientResult<u64> {
        self.incr_decr(VERB_DECR, key, delta)
    }

    /// Updates the expiration of a key. `CacheMiss` if it does not exist.
    pub fn touch(&mut self, key: &str, seconds: i32) -> ClientResult<()> {
        check_key(key)?;
        let buf = self.request();
        buf.extend_from_slice(b"touch ");
        buf.extend_from_slice(key.as_bytes());
        buf.push(b' ');
        push_i64(buf, i64::from(seconds));
        buf.extend_from_slice(CRLF);
        self.expect_status(RESULT_TOUCHED)
    }

    /// Invalidates every item on the server.
    pub fn flush_all(&mut self) -> ClientResult<()> {
        self.request().extend_from_slice(b"flush_all\r\n");
        self.expect_status(RESULT_OK)
    }

    /// Returns the server's version string.
    pub fn version(&mut self) -> ClientResult<String> {
        self.request().extend_from_slice(b"version\r\n");
        self.send()?;
        let line = self.read_line()?;
        match line.strip_prefix(PREFIX_VERSION) {
            Some(version) => Ok(String::from_utf8_lossy(version).into_owned()),
            None => Err(unexpected(line)),
        }
    }

    fn populate_one(&mut self, verb: &[u8], item: &Item) -> ClientResult<()> {
        check_key(&item.key)?;

        let buf = self.request();
        buf.extend_from_slice(verb);
        buf.push(b' ');
        buf.extend_from_slice(item.key.as_bytes());
        buf.push(b' ');
        push_u64(buf, u64::from(item.flags));
        buf.push(b' ');
        push_i64(buf, i64::from(item.expiration));
        buf.push(b' ');
        push_u64(buf, item.value.len() as u64);
        if verb == VERB_CAS {
            buf.push(b' ');
            push_u64(buf, item.cas_id);
        }
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(&item.value);
        buf.extend_from_slice(CRLF);
        self.send()?;

        let line = self.read_line()?;
        match line {
            RESULT_STORED => Ok(()),
            RESULT_NOT_STORED => Err(ClientError::NotStored),
            RESULT_EXISTS => Err(ClientError::CasConflict),
            RESULT_NOT_FOUND => Err(ClientError::CacheMiss),
            _ => Err(unexpected(line)),
        }
    }

    fn incr_decr(&mut self, verb: &[u8], key: &str, delta: u64) -> ClientResult<u64> {
        check_key(key)?;
        let buf = self.request();
        buf.extend_from_slice(verb);
        buf.push(b' ');
        buf.extend_from_slice(key.as_bytes());
        buf.push(b' ');
        push_u64(buf, delta);
        buf.extend_from_slice(CRLF);
        self.send()?;

        let line = self.read_line()?;
        if line == RESULT_NOT_FOUND {
            return Err(ClientError::CacheMiss);
        }
        // Some servers pad decr results with trailing spaces.
        parse_ascii(line.trim_ascii_end()).ok_or_else(|| unexpected(line))
    }

    /// Sends the buffered request and expects `ok` as the only status line.
    fn expect_status(&mut self, ok: &[u8]) -> ClientResult<()> {
        self.send()?;
        let line = self.read_line()?;
        if line == ok {
            return Ok(());
        }
        match line {
            RESULT_NOT_STORED => Err(ClientError::NotStored),
            RESULT_EXISTS => Err(ClientError::CasConflict),
            RESULT_NOT_FOUND => Err(ClientError::CacheMiss),
            _ => Err(unexpected(line)),
        }
    }

    /// Reads `VALUE` blocks up to `END`.
    fn read_items(&mut self) -> ClientResult<HashMap<String, Item>> {
        let mut items = HashMap::new();
        loop {
            let line = self.read_line()?;
            if line == RESULT_END {
                return Ok(items);
            }
            if !line.starts_with(PREFIX_VALUE) {
                return Err(unexpected(line));
            }
            let (mut item, size) = scan_value_line(line)?;
            item.value = self.read_payload(size)?;
            items.insert(item.key.clone(), item);
        }
    }
}

/// Parses `VALUE <key> <flags> <bytes> [<cas unique>]` into an empty-valued
/// item and the announced size.
fn scan_value_line(line: &[u8]) -> ClientResult<(Item, usize)> {
    let corrupt = || {
        ClientError::CorruptResponse(format!(
            "unexpected line in get response: {:?}",
            String::from_utf8_lossy(line)
        ))
    };

    let fields: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    if fields.len() != 4 && fields.len() != 5 {
        return Err(corrupt());
    }
    let key = std::str::from_utf8(fields[1]).map_err(|_| corrupt())?;
    let flags = parse_ascii(fields[2]).ok_or_else(corrupt)?;
    let size = parse_ascii(fields[3]).ok_or_else(corrupt)?;
    let cas_id = match fields.get(4) {
        Some(raw) => parse_ascii(raw).ok_or_else(corrupt)?,
        None => 0,
    };

    let item = Item {
        key: key.to_string(),
        flags,
        cas_id,
        ..Item::default()
    };
    Ok((item, size))
}

fn check_key(key: &str) -> ClientResult<()> {
    if legal_key(key.as_bytes()) {
        Ok(())
    } else {
        Err(ClientError::MalformedKey)
    }
}

/// Maps a status line no command-specific rule matched.
pub(crate) fn unexpected(line: &[u8]) -> ClientError {
    let text = |rest: &[u8]| String::from_utf8_lossy(rest).into_owned();
    if let Some(rest) = line.strip_prefix(PREFIX_CLIENT_ERROR) {
        return ClientError::Client(text(rest));
    }
    if let Some(rest) = line.strip_prefix(PREFIX_SERVER_ERROR) {
        return ClientError::Server(text(rest));
    }
    ClientError::UnexpectedResponse(text(line))
}
