//! Multi-viewer coordinator: one master owns the disk, slaves route writes
//! through it.
//!
//! Role negotiation runs over three files in the cache directory: an
//! exclusive `flock` on `coordinator.lock` elects the master, which records
//! its pid in `coordinator.pid` and listens on `coordinator.sock`. Losers
//! of the lock race connect as slaves. A slave that loses its master (EOF,
//! `MASTER_EXIT`) re-races the lock and either promotes itself or
//! reconnects to the new winner.
//!
//! Only the master writes shard or index files. Slaves read shards
//! directly (they are append-only, so already-written ranges are stable)
//! and send `WRITE_REQ` frames for anything that must reach disk; the
//! master allocates `(shard, offset)`, appends, acks, and broadcasts an
//! `INDEX_UPDATE` carrying its index sequence number so slaves can detect
//! missed broadcasts and re-request a snapshot.
//!
//! Framing: every message is a 4-byte big-endian length followed by
//! `(type byte || payload)`.

use crate::error::PersistError;
use crate::index::IndexEntry;
use crate::store::PersistentStore;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rfb_cache::key::QualityCode;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const LOCK_FILE: &str = "coordinator.lock";
pub const PID_FILE: &str = "coordinator.pid";
pub const SOCK_FILE: &str = "coordinator.sock";

const PROTOCOL_VERSION: u32 = 1;
const MAX_FRAME_LEN: u32 = 128 * 1024 * 1024;

/// Coordinator role held by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Wire messages of the coordinator protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordMessage {
    Hello { version: u32, pid: u32 },
    Welcome {
        current_shard: u32,
        index_seq: u64,
        entries: Vec<IndexEntry>,
    },
    WriteReq { entry: IndexEntry, payload: Vec<u8> },
    WriteAck { entry: IndexEntry },
    WriteNack { reason: String },
    IndexUpdate { seq: u64, entries: Vec<IndexEntry> },
    Ping,
    Pong,
    SlaveExit,
    QueryIndex { hash: [u8; 16] },
    QueryResp { entry: Option<IndexEntry> },
    MasterExit,
}

impl CoordMessage {
    fn type_byte(&self) -> u8 {
        match self {
            CoordMessage::Hello { .. } => 1,
            CoordMessage::Welcome { .. } => 2,
            CoordMessage::WriteReq { .. } => 3,
            CoordMessage::WriteAck { .. } => 4,
            CoordMessage::WriteNack { .. } => 5,
            CoordMessage::IndexUpdate { .. } => 6,
            CoordMessage::Ping => 7,
            CoordMessage::Pong => 8,
            CoordMessage::SlaveExit => 9,
            CoordMessage::QueryIndex { .. } => 10,
            CoordMessage::QueryResp { .. } => 11,
            CoordMessage::MasterExit => 12,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            CoordMessage::Hello { version, pid } => {
                out.write_u32::<BigEndian>(*version).unwrap();
                out.write_u32::<BigEndian>(*pid).unwrap();
            }
            CoordMessage::Welcome {
                current_shard,
                index_seq,
                entries,
            } => {
                out.write_u32::<BigEndian>(*current_shard).unwrap();
                out.write_u64::<BigEndian>(*index_seq).unwrap();
                write_entries(out, entries);
            }
            CoordMessage::WriteReq { entry, payload } => {
                entry.write_to(out);
                out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
                out.extend_from_slice(payload);
            }
            CoordMessage::WriteAck { entry } => entry.write_to(out),
            CoordMessage::WriteNack { reason } => {
                let bytes = reason.as_bytes();
                out.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
                out.extend_from_slice(bytes);
            }
            CoordMessage::IndexUpdate { seq, entries } => {
                out.write_u64::<BigEndian>(*seq).unwrap();
                write_entries(out, entries);
            }
            CoordMessage::Ping
            | CoordMessage::Pong
            | CoordMessage::SlaveExit
            | CoordMessage::MasterExit => {}
            CoordMessage::QueryIndex { hash } => out.extend_from_slice(hash),
            CoordMessage::QueryResp { entry } => match entry {
                Some(entry) => {
                    out.push(1);
                    entry.write_to(out);
                }
                None => out.push(0),
            },
        }
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self, PersistError> {
        let mut cursor = Cursor::new(payload);
        let msg = match type_byte {
            1 => CoordMessage::Hello {
                version: cursor.read_u32::<BigEndian>()?,
                pid: cursor.read_u32::<BigEndian>()?,
            },
            2 => CoordMessage::Welcome {
                current_shard: cursor.read_u32::<BigEndian>()?,
                index_seq: cursor.read_u64::<BigEndian>()?,
                entries: read_entries(&mut cursor)?,
            },
            3 => {
                let entry = IndexEntry::read_from(&mut cursor, 2)?;
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                CoordMessage::WriteReq {
                    entry,
                    payload: data,
                }
            }
            4 => CoordMessage::WriteAck {
                entry: IndexEntry::read_from(&mut cursor, 2)?,
            },
            5 => {
                let len = cursor.read_u16::<BigEndian>()? as usize;
                let mut bytes = vec![0u8; len];
                cursor.read_exact(&mut bytes)?;
                CoordMessage::WriteNack {
                    reason: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
            6 => CoordMessage::IndexUpdate {
                seq: cursor.read_u64::<BigEndian>()?,
                entries: read_entries(&mut cursor)?,
            },
            7 => CoordMessage::Ping,
            8 => CoordMessage::Pong,
            9 => CoordMessage::SlaveExit,
            10 => {
                let mut hash = [0u8; 16];
                cursor.read_exact(&mut hash)?;
                CoordMessage::QueryIndex { hash }
            }
            11 => {
                let found = cursor.read_u8()?;
                let entry = if found == 1 {
                    Some(IndexEntry::read_from(&mut cursor, 2)?)
                } else {
                    None
                };
                CoordMessage::QueryResp { entry }
            }
            12 => CoordMessage::MasterExit,
            other => {
                return Err(PersistError::Coordinator(format!(
                    "unknown message type {}",
                    other
                )))
            }
        };
        Ok(msg)
    }
}

fn write_entries(out: &mut Vec<u8>, entries: &[IndexEntry]) {
    out.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    for entry in entries {
        entry.write_to(out);
    }
}

fn read_entries(cursor: &mut Cursor<&[u8]>) -> Result<Vec<IndexEntry>, PersistError> {
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut entries = Vec::with_capacity(count.min(65_536));
    for _ in 0..count {
        entries.push(IndexEntry::read_from(cursor, 2)?);
    }
    Ok(entries)
}

/// Write one length-prefixed frame.
pub fn write_frame(stream: &mut impl Write, msg: &CoordMessage) -> std::io::Result<()> {
    let mut body = vec![msg.type_byte()];
    msg.encode_payload(&mut body);
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.write_u32::<BigEndian>(body.len() as u32).unwrap();
    frame.extend_from_slice(&body);
    stream.write_all(&frame)
}

/// Read one length-prefixed frame.
pub fn read_frame(stream: &mut impl Read) -> Result<CoordMessage, PersistError> {
    let len = stream.read_u32::<BigEndian>()?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(PersistError::Coordinator(format!(
            "frame length {} out of range",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    CoordMessage::decode(body[0], &body[1..])
}

/// Exclusive advisory lock on `coordinator.lock`; dropped on process exit
/// or explicit release.
struct LockGuard {
    _file: File,
}

fn try_lock(dir: &Path) -> std::io::Result<Option<LockGuard>> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(Some(LockGuard { _file: file }))
    } else {
        Ok(None)
    }
}

/// A write to be routed through the master.
struct WriteRequest {
    entry: IndexEntry,
    payload: Vec<u8>,
    reply: Sender<Result<IndexEntry, String>>,
}

enum Backend {
    /// Role not yet decided (during startup and re-election).
    Idle,
    Master {
        _lock: LockGuard,
        slaves: Arc<Mutex<Vec<UnixStream>>>,
    },
    Slave {
        requests: Sender<WriteRequest>,
        stream: Arc<Mutex<UnixStream>>,
    },
}

/// Coordinates one shared cache directory across viewer processes.
pub struct CacheCoordinator {
    store: Arc<PersistentStore>,
    dir: PathBuf,
    keepalive: Duration,
    backend: Mutex<Backend>,
    role: Mutex<Role>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Elect a role for this process and start the I/O threads.
    pub fn start(
        store: Arc<PersistentStore>,
        keepalive: Duration,
    ) -> Result<Arc<Self>, PersistError> {
        let dir = store.directory().to_path_buf();
        let coordinator = Arc::new(Self {
            store,
            dir,
            keepalive,
            backend: Mutex::new(Backend::Idle),
            role: Mutex::new(Role::Slave),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });
        Self::elect(&coordinator)?;
        Ok(coordinator)
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Race the lock; winner becomes master, loser connects to it. A stale
    /// socket (lock free but socket present) is removed before binding.
    fn elect(this: &Arc<Self>) -> Result<(), PersistError> {
        for attempt in 0..5 {
            if let Some(lock) = try_lock(&this.dir)? {
                Self::become_master(this, lock)?;
                return Ok(());
            }
            match Self::connect_as_slave(this) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!("slave connect attempt {} failed: {}", attempt, err);
                    std::thread::sleep(Duration::from_millis(50 << attempt));
                }
            }
        }
        Err(PersistError::Coordinator(
            "could not acquire lock or reach a master".into(),
        ))
    }

    fn become_master(this: &Arc<Self>, lock: LockGuard) -> Result<(), PersistError> {
        let sock_path = this.dir.join(SOCK_FILE);
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path)?;
        listener.set_nonblocking(true)?;
        std::fs::write(this.dir.join(PID_FILE), std::process::id().to_string())?;

        let slaves: Arc<Mutex<Vec<UnixStream>>> = Arc::new(Mutex::new(Vec::new()));
        *this.backend.lock() = Backend::Master {
            _lock: lock,
            slaves: Arc::clone(&slaves),
        };
        *this.role.lock() = Role::Master;
        tracing::info!("coordinator: elected master (pid {})", std::process::id());

        // The master owns the directory now; reclaim anything a previous
        // holder stranded.
        if let Err(err) = this.store.cleanup_orphan_shards() {
            tracing::warn!("orphan cleanup after election failed: {}", err);
        }

        let accept_this = Arc::clone(this);
        let shutdown = Arc::clone(&this.shutdown);
        let handle = std::thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let conn_this = Arc::clone(&accept_this);
                        let conn_handle = std::thread::spawn(move || {
                            conn_this.serve_slave(stream);
                        });
                        accept_this.threads.lock().push(conn_handle);
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(err) => {
                        tracing::warn!("coordinator accept failed: {}", err);
                        break;
                    }
                }
            }
        });
        this.threads.lock().push(handle);
        Ok(())
    }

    /// Master side: serve one slave connection until it exits or goes
    /// silent for two keepalive intervals.
    fn serve_slave(&self, stream: UnixStream) {
        let _ = stream.set_read_timeout(Some(self.keepalive));
        let mut reader = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let broadcast_copy = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        if let Backend::Master { slaves, .. } = &*self.backend.lock() {
            slaves.lock().push(broadcast_copy);
        }
        let mut writer = stream;
        let mut missed_pongs = 0u32;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let msg = match read_frame(&mut reader) {
                Ok(msg) => {
                    missed_pongs = 0;
                    msg
                }
                Err(PersistError::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    missed_pongs += 1;
                    if missed_pongs >= 2 {
                        tracing::info!("coordinator: slave went silent, dropping");
                        return;
                    }
                    let _ = write_frame(&mut writer, &CoordMessage::Ping);
                    continue;
                }
                Err(_) => return, // closed or corrupt stream
            };

            match msg {
                CoordMessage::Hello { version, pid } => {
                    if version != PROTOCOL_VERSION {
                        tracing::warn!("slave pid {} speaks version {}", pid, version);
                        return;
                    }
                    let (current_shard, index_seq, entries) = self.store.snapshot();
                    let _ = write_frame(
                        &mut writer,
                        &CoordMessage::Welcome {
                            current_shard,
                            index_seq,
                            entries,
                        },
                    );
                }
                CoordMessage::WriteReq { entry, payload } => {
                    let response = match self.store.append_payload(
                        entry.hash,
                        entry.width,
                        entry.height,
                        entry.canonical_hash,
                        entry.quality,
                        &payload,
                    ) {
                        Ok(completed) => {
                            self.broadcast(&CoordMessage::IndexUpdate {
                                seq: self.store.index_seq(),
                                entries: vec![completed.clone()],
                            });
                            CoordMessage::WriteAck { entry: completed }
                        }
                        Err(err) => CoordMessage::WriteNack {
                            reason: err.to_string(),
                        },
                    };
                    let _ = write_frame(&mut writer, &response);
                }
                CoordMessage::QueryIndex { hash } => {
                    let _ = write_frame(
                        &mut writer,
                        &CoordMessage::QueryResp {
                            entry: self.store.index_entry(&hash),
                        },
                    );
                }
                CoordMessage::Ping => {
                    let _ = write_frame(&mut writer, &CoordMessage::Pong);
                }
                CoordMessage::Pong => {}
                CoordMessage::SlaveExit => return,
                other => {
                    tracing::warn!("coordinator: unexpected message from slave: {:?}", other);
                }
            }
        }
    }

    /// Broadcast an index update to every connected slave, pruning dead
    /// connections.
    fn broadcast(&self, msg: &CoordMessage) {
        if let Backend::Master { slaves, .. } = &*self.backend.lock() {
            slaves
                .lock()
                .retain_mut(|stream| write_frame(stream, msg).is_ok());
        }
    }

    fn connect_as_slave(this: &Arc<Self>) -> Result<(), PersistError> {
        let mut stream = UnixStream::connect(this.dir.join(SOCK_FILE))?;
        write_frame(
            &mut stream,
            &CoordMessage::Hello {
                version: PROTOCOL_VERSION,
                pid: std::process::id(),
            },
        )?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        match read_frame(&mut stream)? {
            CoordMessage::Welcome {
                current_shard,
                index_seq,
                entries,
            } => {
                this.store.apply_snapshot(current_shard, index_seq, entries);
            }
            other => {
                return Err(PersistError::Coordinator(format!(
                    "expected WELCOME, got {:?}",
                    other
                )))
            }
        }

        let (tx, rx) = bounded::<WriteRequest>(64);
        let shared_stream = Arc::new(Mutex::new(stream.try_clone()?));
        *this.backend.lock() = Backend::Slave {
            requests: tx,
            stream: Arc::clone(&shared_stream),
        };
        *this.role.lock() = Role::Slave;
        tracing::info!("coordinator: connected as slave");

        let io_this = Arc::clone(this);
        let handle = std::thread::spawn(move || {
            Self::slave_io_loop(&io_this, stream, rx);
        });
        this.threads.lock().push(handle);
        Ok(())
    }

    /// Slave side: one thread owns the socket. Outbound requests are
    /// drained from the channel; inbound frames are applied to the store.
    /// Write acks are matched to requests in FIFO order because the master
    /// serves each connection sequentially.
    fn slave_io_loop(this: &Arc<Self>, mut stream: UnixStream, requests: Receiver<WriteRequest>) {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
        let mut pending: std::collections::VecDeque<Sender<Result<IndexEntry, String>>> =
            std::collections::VecDeque::new();

        loop {
            if this.shutdown.load(Ordering::SeqCst) {
                let _ = write_frame(&mut stream, &CoordMessage::SlaveExit);
                return;
            }

            while let Ok(request) = requests.try_recv() {
                let frame = CoordMessage::WriteReq {
                    entry: request.entry,
                    payload: request.payload,
                };
                if write_frame(&mut stream, &frame).is_ok() {
                    pending.push_back(request.reply);
                } else {
                    let _ = request.reply.send(Err("master connection lost".into()));
                }
            }

            match read_frame(&mut stream) {
                Ok(CoordMessage::WriteAck { entry }) => {
                    // Apply without advancing the sequence; the broadcast
                    // that follows carries the authoritative number.
                    this.store
                        .apply_index_update(this.store.index_seq(), vec![entry.clone()], false);
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Ok(entry));
                    }
                }
                Ok(CoordMessage::WriteNack { reason }) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(reason));
                    }
                }
                Ok(CoordMessage::IndexUpdate { seq, entries }) => {
                    if !this.store.apply_index_update(seq, entries, true) {
                        // Missed a broadcast: ask for a fresh snapshot.
                        let _ = write_frame(
                            &mut stream,
                            &CoordMessage::Hello {
                                version: PROTOCOL_VERSION,
                                pid: std::process::id(),
                            },
                        );
                    }
                }
                Ok(CoordMessage::Welcome {
                    current_shard,
                    index_seq,
                    entries,
                }) => {
                    this.store.apply_snapshot(current_shard, index_seq, entries);
                }
                Ok(CoordMessage::Ping) => {
                    let _ = write_frame(&mut stream, &CoordMessage::Pong);
                }
                Ok(CoordMessage::Pong) => {}
                Ok(CoordMessage::MasterExit) => {
                    Self::reelect(this, pending);
                    return;
                }
                Ok(other) => {
                    tracing::warn!("coordinator: unexpected message from master: {:?}", other);
                }
                Err(PersistError::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(_) => {
                    // Master died without MASTER_EXIT.
                    Self::reelect(this, pending);
                    return;
                }
            }
        }
    }

    /// The master is gone: fail outstanding writes and race the lock again.
    fn reelect(
        this: &Arc<Self>,
        pending: std::collections::VecDeque<Sender<Result<IndexEntry, String>>>,
    ) {
        for reply in pending {
            let _ = reply.send(Err("master exited".into()));
        }
        if this.shutdown.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("coordinator: master lost, re-electing");
        if let Err(err) = Self::elect(this) {
            tracing::warn!("coordinator re-election failed: {}", err);
        }
    }

    /// Persist a payload through whatever role this process holds. Masters
    /// write directly; slaves round-trip through the master. A refusal
    /// (e.g. disk full) leaves the entry memory-only.
    pub fn write_through(
        &self,
        hash: [u8; 16],
        width: u16,
        height: u16,
        actual_hash: u64,
        quality: QualityCode,
        payload: Vec<u8>,
    ) -> Result<IndexEntry, PersistError> {
        enum Routed {
            Local,
            Remote(Receiver<Result<IndexEntry, String>>),
        }

        let routed = {
            let backend = self.backend.lock();
            match &*backend {
                Backend::Idle => {
                    return Err(PersistError::Coordinator(
                        "no role established yet".into(),
                    ))
                }
                Backend::Master { .. } => Routed::Local,
                Backend::Slave { requests, .. } => {
                    let (reply_tx, reply_rx) = bounded(1);
                    let entry = IndexEntry {
                        hash,
                        shard_id: 0,
                        payload_offset: 0, // master allocates
                        payload_size: payload.len() as u32,
                        width,
                        height,
                        stride_pixels: width,
                        pixel_format: rfb_protocol::messages::types::PixelFormat {
                            bits_per_pixel: 32,
                            depth: 24,
                            big_endian: 0,
                            true_color: 1,
                            red_max: 255,
                            green_max: 255,
                            blue_max: 255,
                            red_shift: 16,
                            green_shift: 8,
                            blue_shift: 0,
                        },
                        canonical_hash: actual_hash,
                        payload_check: 0,
                        quality,
                        flags: 0,
                    };
                    requests
                        .send(WriteRequest {
                            entry,
                            payload: payload.clone(),
                            reply: reply_tx,
                        })
                        .map_err(|_| {
                            PersistError::Coordinator("coordinator thread gone".into())
                        })?;
                    Routed::Remote(reply_rx)
                }
            }
        };

        match routed {
            Routed::Local => {
                self.store
                    .append_payload(hash, width, height, actual_hash, quality, &payload)
            }
            Routed::Remote(reply_rx) => reply_rx
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| PersistError::Coordinator("write request timed out".into()))?
                .map_err(PersistError::Coordinator),
        }
    }

    /// Graceful shutdown: the master flushes the store it owns, notifies
    /// slaves, and releases the lock; slaves say goodbye.
    pub fn shutdown(&self) {
        if self.role() == Role::Master {
            if let Err(err) = self.store.flush_dirty() {
                tracing::warn!("flush on coordinator shutdown failed: {}", err);
            }
            if let Err(err) = self.store.cleanup_orphan_shards() {
                tracing::warn!("orphan cleanup on coordinator shutdown failed: {}", err);
            }
            self.broadcast(&CoordMessage::MasterExit);
            let _ = std::fs::remove_file(self.dir.join(SOCK_FILE));
            let _ = std::fs::remove_file(self.dir.join(PID_FILE));
        } else if let Backend::Slave { stream, .. } = &*self.backend.lock() {
            let _ = write_frame(&mut *stream.lock(), &CoordMessage::SlaveExit);
        }
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// [`PersistentTier`] over a coordinated store: reads go straight to the
/// shared shards, writes are routed by role so only the master ever
/// touches the disk.
///
/// [`PersistentTier`]: rfb_cache::viewer::PersistentTier
pub struct CoordinatedTier {
    store: Arc<PersistentStore>,
    coordinator: Arc<CacheCoordinator>,
}

impl CoordinatedTier {
    pub fn new(store: Arc<PersistentStore>, coordinator: Arc<CacheCoordinator>) -> Self {
        Self { store, coordinator }
    }
}

impl rfb_cache::viewer::PersistentTier for CoordinatedTier {
    fn lookup(
        &self,
        hash: &[u8; 16],
        width: u16,
        height: u16,
    ) -> Option<rfb_cache::viewer::TierEntry> {
        rfb_cache::viewer::PersistentTier::lookup(&self.store, hash, width, height)
    }

    fn insert(&self, hash: [u8; 16], entry: rfb_cache::viewer::TierEntry, persistable: bool) {
        let persist = persistable && self.store.should_persist(&hash, entry.quality);
        let (width, height, actual_hash, quality) =
            (entry.width, entry.height, entry.actual_hash, entry.quality);
        let payload = if persist { Some(entry.pixels.clone()) } else { None };
        self.store.insert_memory(hash, entry);

        if let Some(payload) = payload {
            // write_through appends locally on the master and round-trips
            // through it on a slave; a refusal leaves the entry
            // memory-only.
            if let Err(err) = self
                .coordinator
                .write_through(hash, width, height, actual_hash, quality, payload)
            {
                tracing::warn!("coordinated write refused, entry stays memory-only: {}", err);
            }
        }
    }

    fn contains(&self, hash: &[u8; 16]) -> bool {
        rfb_cache::viewer::PersistentTier::contains(&self.store, hash)
    }

    fn take_evicted(&self) -> Vec<[u8; 16]> {
        rfb_cache::viewer::PersistentTier::take_evicted(&self.store)
    }

    fn inventory(&self) -> Vec<[u8; 16]> {
        rfb_cache::viewer::PersistentTier::inventory(&self.store)
    }
}
