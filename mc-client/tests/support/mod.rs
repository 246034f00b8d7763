//! In-process fake memcached speaking enough of the text and meta protocols
//! for the integration tests.
//!
//! A key named `poison` answers every read with a bogus status line.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mc_client::{Client, ClientConfig};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub const POISON_KEY: &str = "poison";
const NON_NUMERIC: &str = "CLIENT_ERROR cannot increment or decrement non-numeric value";

struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    expires: Option<Instant>,
    // A vivify winner was handed out and nobody has stored a value yet.
    win_sent: bool,
}

impl Entry {
    fn ttl(&self) -> i64 {
        match self.expires {
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
            None => -1,
        }
    }
}

#[derive(Default)]
struct Store {
    items: HashMap<String, Entry>,
    next_cas: u64,
}

impl Store {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .items
            .get(key)
            .and_then(|entry| entry.expires)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.items.remove(key);
        }
        self.items.get_mut(key)
    }

    fn bump_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    fn put(&mut self, key: &str, value: Vec<u8>, flags: u32, expires: Option<Instant>) -> u64 {
        let cas = self.bump_cas();
        self.items.insert(
            key.to_string(),
            Entry {
                value,
                flags,
                cas,
                expires,
                win_sent: false,
            },
        );
        cas
    }
}

/// Handle to a running fake server.
pub struct FakeMemcached {
    addr: String,
    accepted: Arc<AtomicUsize>,
}

impl FakeMemcached {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(Mutex::new(Store::default()));

        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let _ = serve(stream, store);
                });
            }
        });

        FakeMemcached { addr, accepted }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> Client {
        self.client_with(|_| {})
    }

    pub fn client_with(&self, tweak: impl FnOnce(&mut ClientConfig)) -> Client {
        init_tracing();
        let mut config = ClientConfig {
            addr: self.addr.clone(),
            min_idle: 0,
            max_size: 4,
            timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        tweak(&mut config);
        Client::with_config(config).expect("client")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn expires_in(seconds: i64) -> Option<Instant> {
    match seconds {
        0 => None,
        s if s < 0 => Some(Instant::now()),
        s => Some(Instant::now() + Duration::from_secs(s as u64)),
    }
}

fn serve(stream: TcpStream, store: Arc<Mutex<Store>>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let request = line.trim_end_matches("\r\n").to_string();
        let tokens: Vec<&str> = request.split(' ').collect();
        let mut out = Vec::new();
        match tokens[0] {
            "get" | "gets" => get(&tokens, &store, &mut out),
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let data = read_block(&mut reader, &tokens, 4)?;
                store_cmd(&tokens, data, &store, &mut out);
            }
            "delete" => {
                let removed = store.lock().live(tokens[1]).is_some();
                if removed {
                    store.lock().items.remove(tokens[1]);
                    reply(&mut out, "DELETED");
                } else {
                    reply(&mut out, "NOT_FOUND");
                }
            }
            "incr" | "decr" => incr_decr(&tokens, &store, &mut out),
            "touch" => {
                let seconds: i64 = tokens[2].parse().unwrap_or(0);
                match store.lock().live(tokens[1]) {
                    Some(entry) => {
                        entry.expires = expires_in(seconds);
                        reply(&mut out, "TOUCHED");
                    }
                    None => reply(&mut out, "NOT_FOUND"),
                }
            }
            "flush_all" => {
                store.lock().items.clear();
                reply(&mut out, "OK");
            }
            "version" => reply(&mut out, "VERSION 1.6.21-fake"),
            "mn" => reply(&mut out, "MN"),
            "mg" => meta_get(&tokens, &store, &mut out),
            "ms" => {
                let data = read_block(&mut reader, &tokens, 2)?;
                meta_set(&tokens, data, &store, &mut out);
            }
            "md" => meta_delete(&tokens, &store, &mut out),
            "ma" => meta_arithmetic(&tokens, &store, &mut out),
            _ => reply(&mut out, "ERROR"),
        }
        writer.write_all(&out)?;
        writer.flush()?;
    }
}

fn reply(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn read_block(reader: &mut BufReader<TcpStream>, tokens: &[&str], len_at: usize) -> io::Result<Vec<u8>> {
    let len: usize = tokens
        .get(len_at)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "length"))?;
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data)?;
    data.truncate(len);
    Ok(data)
}

fn get(tokens: &[&str], store: &Mutex<Store>, out: &mut Vec<u8>) {
    let with_cas = tokens[0] == "gets";
    let mut store = store.lock();
    for key in &tokens[1..] {
        if *key == POISON_KEY {
            reply(out, "BOGUS");
            return;
        }
        if let Some(entry) = store.live(key) {
            let mut header = format!("VALUE {key} {} {}", entry.flags, entry.value.len());
            if with_cas {
                header.push_str(&format!(" {}", entry.cas));
            }
            reply(out, &header);
            out.extend_from_slice(&entry.value);
            out.extend_from_slice(b"\r\n");
        }
    }
    reply(out, "END");
}

fn store_cmd(tokens: &[&str], data: Vec<u8>, store: &Mutex<Store>, out: &mut Vec<u8>) {
    let (verb, key) = (tokens[0], tokens[1]);
    let flags: u32 = tokens[2].parse().unwrap_or(0);
    let expires = expires_in(tokens[3].parse().unwrap_or(0));
    let mut store = store.lock();
    let existing = store.live(key).map(|entry| (entry.cas, entry.value.clone()));

    let value = match (verb, existing) {
        ("add", Some(_)) | ("replace", None) | ("append", None) | ("prepend", None) => {
            return reply(out, "NOT_STORED");
        }
        ("cas", None) => return reply(out, "NOT_FOUND"),
        ("cas", Some((cas, _))) if tokens.get(5).and_then(|raw| raw.parse().ok()) != Some(cas) => {
            return reply(out, "EXISTS");
        }
        ("append", Some((_, mut old))) => {
            old.extend_from_slice(&data);
            old
        }
        ("prepend", Some((_, old))) => {
            let mut value = data;
            value.extend_from_slice(&old);
            value
        }
        _ => data,
    };
    store.put(key, value, flags, expires);
    reply(out, "STORED");
}

fn incr_decr(tokens: &[&str], store: &Mutex<Store>, out: &mut Vec<u8>) {
    let delta: u64 = tokens[2].parse().unwrap_or(0);
    let mut store = store.lock();
    let Some(entry) = store.live(tokens[1]) else {
        return reply(out, "NOT_FOUND");
    };
    let Some(current) = std::str::from_utf8(&entry.value)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
    else {
        return reply(out, NON_NUMERIC);
    };
    let next = if tokens[0] == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    entry.value = next.to_string().into_bytes();
    reply(out, &next.to_string());
}

/// Splits meta request flags into `(code, argument)` pairs.
fn meta_flags<'a>(tokens: &[&'a str]) -> Vec<(char, &'a str)> {
    tokens
        .iter()
        .filter_map(|&token| {
            let mut chars = token.chars();
            chars.next().map(|code| (code, chars.as_str()))
        })
        .collect()
}

fn flag<'a>(flags: &[(char, &'a str)], code: char) -> Option<&'a str> {
    flags.iter().find(|(c, _)| *c == code).map(|(_, arg)| *arg)
}

/// Echoes the return flags the request asked for.
fn return_flags(flags: &[(char, &str)], key: &str, entry: &Entry) -> String {
    let mut ret = String::new();
    for (code, arg) in flags {
        let token = match code {
            'c' => format!("c{}", entry.cas),
            'f' => format!("f{}", entry.flags),
            't' => format!("t{}", entry.ttl()),
            's' => format!("s{}", entry.value.len()),
            'k' => format!("k{key}"),
            'O' => format!("O{arg}"),
            _ => continue,
        };
        ret.push(' ');
        ret.push_str(&token);
    }
    ret
}

fn meta_get(tokens: &[&str], store: &Mutex<Store>, out: &mut Vec<u8>) {
    let key = tokens[1];
    let flags = meta_flags(&tokens[2..]);
    let quiet = flag(&flags, 'q').is_some();
    let mut store = store.lock();

    if key == POISON_KEY {
        return reply(out, "BOGUS");
    }

    let mut extra = String::new();
    if store.live(key).is_none() {
        let Some(ttl) = flag(&flags, 'N').and_then(|raw| raw.parse::<i64>().ok()) else {
            if !quiet {
                reply(out, "EN");
            }
            return;
        };
        let cas = store.bump_cas();
        store.items.insert(
            key.to_string(),
            Entry {
                value: Vec::new(),
                flags: 0,
                cas,
                expires: expires_in(ttl),
                win_sent: true,
            },
        );
        extra.push_str(" W");
    } else if store.live(key).is_some_and(|entry| entry.win_sent) {
        extra.push_str(" Z");
    }

    let Some(entry) = store.live(key) else {
        return reply(out, "EN");
    };
    if let Some(ttl) = flag(&flags, 'T').and_then(|raw| raw.parse::<i64>().ok()) {
        entry.expires = expires_in(ttl);
    }
    let ret = return_flags(&flags, key, entry);
    if flag(&flags, 'v').is_some() {
        reply(out, &format!("VA {}{ret}{extra}", entry.value.len()));
        out.extend_from_slice(&entry.value);
        out.extend_from_slice(b"\r\n");
    } else {
        reply(out, &format!("HD{ret}{extra}"));
    }
}

fn meta_set(tokens: &[&str], data: Vec<u8>, store: &Mutex<Store>, out: &mut Vec<u8>) {
    let key = tokens[1];
    let flags = meta_flags(&tokens[3..]);
    let quiet = flag(&flags, 'q').is_some();
    let mut store = store.lock();
    let existing = store
        .live(key)
        .map(|entry| (entry.cas, entry.value.clone(), entry.flags));

    if let Some(compare) = flag(&flags, 'C').and_then(|raw| raw.parse::<u64>().ok()) {
        match &existing {
            None => return reply(out, "NF"),
            Some((cas, _, _)) if *cas != compare => return reply(out, "EX"),
            Some(_) => {}
        }
    }

    let mode = flag(&flags, 'M').unwrap_or("S");
    let value = match (mode, existing.clone()) {
        ("E", Some(_)) | ("R", None) | ("A", None) | ("P", None) => return reply(out, "NS"),
        ("A", Some((_, mut old, _))) => {
            old.extend_from_slice(&data);
            old
        }
        ("P", Some((_, old, _))) => {
            let mut value = data;
            value.extend_from_slice(&old);
            value
        }
        _ => data,
    };
    let item_flags = flag(&flags, 'F')
        .and_then(|raw| raw.parse().ok())
        .or(existing.map(|(_, _, old_flags)| old_flags))
        .unwrap_or(0);
    let expires = expires_in(flag(&flags, 'T').and_then(|raw| raw.parse().ok()).unwrap_or(0));
    store.put(key, value, item_flags, expires);

    if quiet {
        return;
    }
    let entry = store.live(key).expect("just stored");
    let ret = return_flags(&flags, key, entry);
    reply(out, &format!("HD{ret}"));
}

fn meta_delete(tokens: &[&str], store: &Mutex<Store>, out: &mut Vec<u8>) {
    let key = tokens[1];
    let flags = meta_flags(&tokens[2..]);
    let quiet = flag(&flags, 'q').is_some();
    let mut store = store.lock();
    let Some(entry) = store.live(key) else {
        return reply(out, "NF");
    };
    if let Some(compare) = flag(&flags, 'C').and_then(|raw| raw.parse::<u64>().ok()) {
        if entry.cas != compare {
            return reply(out, "EX");
        }
    }
    store.items.remove(key);
    if !quiet {
        reply(out, "HD");
    }
}

fn meta_arithmetic(tokens: &[&str], store: &Mutex<Store>, out: &mut Vec<u8>) {
    let key = tokens[1];
    let flags = meta_flags(&tokens[2..]);
    let quiet = flag(&flags, 'q').is_some();
    let delta: u64 = flag(&flags, 'D').and_then(|raw| raw.parse().ok()).unwrap_or(1);
    let decrement = matches!(flag(&flags, 'M'), Some("D") | Some("-"));
    let mut store = store.lock();

    if store.live(key).is_none() {
        let Some(ttl) = flag(&flags, 'N').and_then(|raw| raw.parse::<i64>().ok()) else {
            return reply(out, "NF");
        };
        let initial: u64 = flag(&flags, 'J').and_then(|raw| raw.parse().ok()).unwrap_or(0);
        store.put(key, initial.to_string().into_bytes(), 0, expires_in(ttl));
    } else {
        let cas = store.bump_cas();
        let Some(entry) = store.live(key) else {
            return reply(out, "NF");
        };
        if let Some(compare) = flag(&flags, 'C').and_then(|raw| raw.parse::<u64>().ok()) {
            if entry.cas != compare {
                return reply(out, "EX");
            }
        }
        let Some(current) = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
        else {
            return reply(out, NON_NUMERIC);
        };
        let next = if decrement {
            current.saturating_sub(delta)
        } else {
            current.wrapping_add(delta)
        };
        entry.value = next.to_string().into_bytes();
        entry.cas = cas;
    }

    let entry = store.live(key).expect("counter present");
    let ret = return_flags(&flags, key, entry);
    if flag(&flags, 'v').is_some() {
        reply(out, &format!("VA {}{ret}", entry.value.len()));
        out.extend_from_slice(&entry.value);
        out.extend_from_slice(b"\r\n");
    } else if !quiet {
        reply(out, &format!("HD{ret}"));
    }
}

/// Server that answers every request with `reply`, one byte per `gap`.
pub struct TricklingServer {
    addr: String,
}

impl TricklingServer {
    pub fn start(reply: &'static [u8], gap: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let _ = trickle(stream, reply, gap);
                });
            }
        });
        TricklingServer { addr }
    }

    pub fn client(&self, timeout: Duration) -> Client {
        init_tracing();
        Client::with_config(ClientConfig {
            addr: self.addr.clone(),
            min_idle: 0,
            max_size: 1,
            timeout,
            ..ClientConfig::default()
        })
        .expect("client")
    }
}

fn trickle(stream: TcpStream, reply: &[u8], gap: Duration) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        line.clear();
        for byte in reply {
            thread::sleep(gap);
            writer.write_all(std::slice::from_ref(byte))?;
            writer.flush()?;
        }
    }
    Ok(())
}
