//! In-memory stand-ins for a phone link
//!
//! [`ScriptedTransport`] replays canned replies and releases straggling
//! reply segments only when the idle clock ticks. [`MockPhone`] understands
//! the command set and serves a small file system, so client and
//! certificate workflows can run end to end without hardware.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};

use crate::codec::{concat, decode_utf16le, read_u16_be};
use crate::dirent::{self, DirectoryEntry, EntryKind};
use crate::protocol::{opcode, BLOCK_SIZE, HEADER_LEN, INIT_ACK};
use crate::protocol_core::remote_dir;
use crate::transport::{IdleClock, Transport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clock that never sleeps and only counts how often it was asked to
#[derive(Clone, Default)]
pub struct InstantClock {
    pub sleeps: Arc<AtomicUsize>,
}

impl IdleClock for InstantClock {
    fn sleep(&mut self, _d: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Reply segments; the first is readable at once, each later one after an idle tick
    Data(Vec<Vec<u8>>),
    /// The peer hangs up instead of answering
    Eof,
}

impl ScriptedReply {
    pub fn data(bytes: Vec<u8>) -> Self {
        ScriptedReply::Data(vec![bytes])
    }

    pub fn segments(segments: Vec<Vec<u8>>) -> Self {
        ScriptedReply::Data(segments)
    }
}

#[derive(Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    readable: VecDeque<u8>,
    queued: VecDeque<Vec<u8>>,
    request: Vec<u8>,
    closed: bool,
}

impl Script {
    fn release_next(&mut self) {
        if let Some(seg) = self.queued.pop_front() {
            self.readable.extend(seg);
        }
    }
}

/// Transport that answers each flushed request with the next scripted reply
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    sleeps: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

/// Idle clock tied to a [`ScriptedTransport`]: each tick releases one queued segment
pub struct ScriptedClock {
    script: Arc<Mutex<Script>>,
    sleeps: Arc<AtomicUsize>,
}

impl IdleClock for ScriptedClock {
    fn sleep(&mut self, _d: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        lock(&self.script).release_next();
    }
}

impl ScriptedTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                replies: replies.into(),
                ..Script::default()
            })),
            sent: Arc::default(),
            sleeps: Arc::default(),
            closes: Arc::default(),
        }
    }

    pub fn clock(&self) -> ScriptedClock {
        ScriptedClock {
            script: Arc::clone(&self.script),
            sleeps: Arc::clone(&self.sleeps),
        }
    }

    /// Every frame written so far, one entry per flush
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent)
    }

    pub fn sleep_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.sleeps)
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = lock(&self.script);
        if s.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        // A blocking read waits for the next segment
        while s.readable.is_empty() && !s.queued.is_empty() {
            s.release_next();
        }
        let n = buf.len().min(s.readable.len());
        for (dst, src) in buf.iter_mut().zip(s.readable.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = lock(&self.script);
        if s.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        s.request.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut s = lock(&self.script);
        if s.request.is_empty() {
            return Ok(());
        }
        let request = std::mem::take(&mut s.request);
        lock(&self.sent).push(request);
        match s.replies.pop_front() {
            Some(ScriptedReply::Data(mut segments)) => {
                if !segments.is_empty() {
                    let first = segments.remove(0);
                    s.readable.extend(first);
                }
                s.queued = segments.into();
            }
            Some(ScriptedReply::Eof) | None => {}
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(lock(&self.script).readable.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        lock(&self.script).closed = true;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum Node {
    File { data: Vec<u8>, modified: NaiveDateTime },
    Directory { modified: NaiveDateTime },
}

/// Fault switches for exercising error paths
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Read-block replies carry one byte less than requested
    pub short_blocks: bool,
    /// The link drops instead of answering a close-handle request
    pub drop_on_close: bool,
}

#[derive(Debug)]
struct Handle {
    path: String,
}

/// Observable state of a [`MockPhone`]
#[derive(Debug)]
pub struct PhoneState {
    pub nodes: BTreeMap<String, Node>,
    pub imei: String,
    pub firmware: (String, String, String),
    pub faults: Faults,
    pub rebooted: bool,
    pub closed: bool,
    /// Requests received, as (opcode, payload)
    pub requests: Vec<(u8, Vec<u8>)>,
    handles: HashMap<u16, Handle>,
    next_fd: u16,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    hang_up: bool,
}

impl PhoneState {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        match self.nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Number of handles opened but not yet closed
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

pub fn sample_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2010, 3, 14)
        .and_then(|d| d.and_hms_opt(9, 26, 53))
        .unwrap_or_default()
}

/// Simulated phone speaking the file protocol over an in-memory link
#[derive(Clone)]
pub struct MockPhone {
    state: Arc<Mutex<PhoneState>>,
}

impl Default for MockPhone {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPhone {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PhoneState {
                nodes: BTreeMap::new(),
                imei: "356938035643809".to_string(),
                firmware: (
                    "V 07.21".to_string(),
                    "17-11-09".to_string(),
                    "RM-356".to_string(),
                ),
                faults: Faults::default(),
                rebooted: false,
                closed: false,
                requests: Vec::new(),
                handles: HashMap::new(),
                next_fd: 0x0100,
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                hang_up: false,
            })),
        }
    }

    /// A phone with a couple of folders and files, like a freshly dumped handset
    pub fn with_sample_data() -> Self {
        let phone = Self::new();
        phone.add_dir("/c");
        phone.add_dir("/c/Images");
        phone.add_dir("/c/Images/Camera");
        phone.add_file("/c/Images/logo.gif", vec![0x47; 300]);
        phone.add_file("/c/Images/Camera/img001.jpg", (0..=255u8).cycle().take(700).collect());
        phone.add_file("/c/readme.txt", b"hello from the phone".to_vec());
        phone
    }

    pub fn state(&self) -> MutexGuard<'_, PhoneState> {
        lock(&self.state)
    }

    pub fn add_dir(&self, path: &str) {
        self.state().nodes.insert(
            path.to_string(),
            Node::Directory {
                modified: sample_time(),
            },
        );
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state().nodes.insert(
            path.to_string(),
            Node::File {
                data,
                modified: sample_time(),
            },
        );
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }
}

fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
    concat(&[
        &[0x19, 0x10, 0x00, kind][..],
        &(body.len() as u16).to_be_bytes()[..],
        body,
    ])
}

// Reply whose u16 field lands at reply offset 14
fn word_reply(value: u16, tail: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 8];
    body.extend_from_slice(&value.to_be_bytes());
    body.extend_from_slice(tail);
    frame(opcode::FILE, &body)
}

fn entry_for(name: &str, node: Option<&Node>) -> DirectoryEntry {
    match node {
        Some(Node::File { data, modified }) => DirectoryEntry {
            name: name.to_string(),
            size_bytes: data.len() as u32,
            modified_at: Some(*modified),
            kind: EntryKind::File,
        },
        Some(Node::Directory { modified }) => DirectoryEntry {
            name: name.to_string(),
            size_bytes: 0,
            modified_at: Some(*modified),
            kind: EntryKind::Directory,
        },
        None => DirectoryEntry {
            name: String::new(),
            size_bytes: 0,
            modified_at: None,
            kind: EntryKind::Other,
        },
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl PhoneState {
    fn handle_frame(&mut self, op: u8, payload: &[u8]) {
        self.requests.push((op, payload.to_vec()));
        let reply = match op {
            opcode::INIT => INIT_ACK.to_vec(),
            opcode::DEVICE_INFO if payload.get(3) == Some(&0x07) => {
                let (v, d, m) = &self.firmware;
                let mut body = vec![0u8; 12];
                body.extend_from_slice(format!("{}\n{}\n{}\n", v, d, m).as_bytes());
                frame(opcode::DEVICE_INFO, &body)
            }
            opcode::DEVICE_INFO => {
                let mut body = vec![0u8; 10];
                body.extend_from_slice(self.imei.as_bytes());
                body.push(0);
                frame(opcode::DEVICE_INFO, &body)
            }
            opcode::RESET => {
                self.rebooted = true;
                frame(opcode::RESET, &[0x00, 0x01])
            }
            opcode::FILE => self.handle_file(payload),
            _ => frame(op, &[0x00]),
        };
        self.outbox.extend(reply);
    }

    fn handle_file(&mut self, p: &[u8]) -> Vec<u8> {
        match p.get(3).copied() {
            Some(0x68) => {
                let path = decode_utf16le(p.get(7..).unwrap_or_default());
                match path.strip_suffix('*') {
                    Some(dir) => self.list(dir),
                    None => {
                        let name = base_name(&path).to_string();
                        dirent::encode(&entry_for(&name, self.nodes.get(&path)))
                    }
                }
            }
            Some(0x72) if p.get(4) == Some(&0x11) => {
                let path = decode_utf16le(p.get(8..).unwrap_or_default());
                self.nodes.insert(
                    path.clone(),
                    Node::File {
                        data: Vec::new(),
                        modified: sample_time(),
                    },
                );
                let fd = self.open(path);
                word_reply(fd, &[])
            }
            Some(0x72) => {
                let path = decode_utf16le(p.get(9..).unwrap_or_default());
                let fd = self.open(path);
                word_reply(fd, &[])
            }
            Some(0x5e) => {
                let fd = read_u16_be(p, 8).unwrap_or_default();
                let block = read_u16_be(p, 11).unwrap_or_default() as usize;
                let mut wanted = read_u16_be(p, 20).unwrap_or_default() as usize;
                if self.faults.short_blocks {
                    wanted = wanted.saturating_sub(1);
                }
                let data = self
                    .handles
                    .get(&fd)
                    .and_then(|h| self.file(&h.path))
                    .map(|d| {
                        let start = (block * BLOCK_SIZE).min(d.len());
                        let end = (start + wanted).min(d.len());
                        d[start..end].to_vec()
                    })
                    .unwrap_or_default();
                word_reply(data.len() as u16, &data)
            }
            Some(0x58) => {
                let fd = read_u16_be(p, 8).unwrap_or_default();
                let len = read_u16_be(p, 12).unwrap_or_default() as usize;
                let chunk = p.get(14..14 + len).unwrap_or_default().to_vec();
                if let Some(path) = self.handles.get(&fd).map(|h| h.path.clone()) {
                    if let Some(Node::File { data, .. }) = self.nodes.get_mut(&path) {
                        data.extend_from_slice(&chunk);
                    }
                }
                word_reply(len as u16, &[])
            }
            Some(0x74) => {
                let fd = read_u16_be(p, 8).unwrap_or_default();
                self.handles.remove(&fd);
                if self.faults.drop_on_close {
                    self.hang_up = true;
                    return Vec::new();
                }
                word_reply(0, &[])
            }
            Some(0x62) => {
                let path = decode_utf16le(p.get(6..).unwrap_or_default());
                self.nodes.remove(&path);
                word_reply(0, &[])
            }
            _ => word_reply(0xffff, &[]),
        }
    }

    fn open(&mut self, path: String) -> u16 {
        let fd = self.next_fd;
        self.next_fd = self.next_fd.wrapping_add(1);
        self.handles.insert(fd, Handle { path });
        fd
    }

    fn list(&self, dir: &str) -> Vec<u8> {
        let prefix = remote_dir(dir);
        let mut out = Vec::new();
        for (path, node) in &self.nodes {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    out.extend(dirent::encode(&entry_for(rest, Some(node))));
                }
            }
        }
        if out.is_empty() {
            // Empty folders answer with a single blank record
            out = dirent::encode(&entry_for("", None));
        }
        out
    }

    fn process_inbox(&mut self) {
        while self.inbox.len() >= HEADER_LEN {
            let len = read_u16_be(&self.inbox, 4).unwrap_or_default() as usize;
            if self.inbox.len() < HEADER_LEN + len {
                break;
            }
            let frame: Vec<u8> = self.inbox.drain(..HEADER_LEN + len).collect();
            self.handle_frame(frame[3], &frame[HEADER_LEN..]);
        }
    }
}

impl Read for MockPhone {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self.state();
        if s.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if s.outbox.is_empty() && s.hang_up {
            return Ok(0);
        }
        let n = buf.len().min(s.outbox.len());
        for (dst, src) in buf.iter_mut().zip(s.outbox.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MockPhone {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.state();
        if s.closed || s.hang_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        s.inbox.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state().process_inbox();
        Ok(())
    }
}

impl Transport for MockPhone {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.state().outbox.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state().closed = true;
        Ok(())
    }
}
