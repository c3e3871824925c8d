//! Durable operation queue — append-only, disk-backed, crash-safe
//!
//! ## File Layout
//!
//! Per container directory:
//!
//! ```text
//! ops-{first_sequence:016x}.log    append-only segment files
//! ack.json                         persisted ack mark (atomic replace)
//! .lock                            advisory lock file
//! ```
//!
//! Segment file:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "TKOP" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - first_sequence: u64 LE         │
//! ├──────────────────────────────────┤
//! │ Entry frame 0                    │
//! │ - data_length: u32 LE            │
//! │ - sequence: u64 LE               │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: bincode(Operation)       │
//! ├──────────────────────────────────┤
//! │ Entry frame 1 ...                │
//! └──────────────────────────────────┘
//! ```
//!
//! Crash tolerance: every frame is individually CRC32-checksummed. A frame
//! that fails its checksum is discarded; when its claimed length is still
//! plausible the scan resumes at the next frame boundary, otherwise the
//! remainder of that segment is abandoned. Later segments always recover.
//! Appends are fsynced before a sequence number is returned, so a returned
//! sequence survives an immediate crash.

use crate::config::QueueConfig;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{BufReader, Error as IoError, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Segment file magic number
pub const SEGMENT_MAGIC: [u8; 4] = *b"TKOP";
/// Current segment format version
pub const SEGMENT_VERSION: u8 = 1;
/// Header size in bytes
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// Frame overhead: data_length(4) + sequence(8) + checksum(4) = 16 bytes
pub const FRAME_OVERHEAD: usize = 16;
/// Persisted ack mark file name
pub const ACK_FILE_NAME: &str = "ack.json";
/// Advisory lock file name
pub const LOCK_FILE_NAME: &str = ".lock";
/// Upper bound on a single frame's payload; larger claimed lengths are
/// treated as corruption rather than allocated
const MAX_FRAME_DATA_BYTES: usize = 64 * 1024 * 1024;

/// Error type for durable queue operations
#[derive(Debug)]
pub enum QueueError {
    /// I/O error
    Io(IoError),
    /// Corruption detected where none is tolerable (bad header, bad codec)
    Corruption(String),
    /// Another live process holds the container's advisory lock
    Locked(String),
    /// The queue handle has been closed
    Closed,
    /// No unacknowledged entries exist — a control-flow signal, not a failure
    Empty,
    /// Disk full
    DiskFull,
    /// An ack was requested beyond the append mark
    SequenceAhead { requested: u64, append_mark: u64 },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Io(e) => write!(f, "queue I/O error: {}", e),
            QueueError::Corruption(msg) => write!(f, "queue corruption: {}", msg),
            QueueError::Locked(msg) => write!(f, "queue locked: {}", msg),
            QueueError::Closed => write!(f, "queue is closed"),
            QueueError::Empty => write!(f, "queue empty: no unacknowledged entries"),
            QueueError::DiskFull => write!(f, "queue disk full"),
            QueueError::SequenceAhead {
                requested,
                append_mark,
            } => {
                write!(
                    f,
                    "ack of sequence {} beyond append mark {}",
                    requested, append_mark
                )
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<IoError> for QueueError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::StorageFull => QueueError::DiskFull,
            _ if e.to_string().contains("No space left") => QueueError::DiskFull,
            _ => QueueError::Io(e),
        }
    }
}

/// One queued operation with its assigned sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Sequence assigned at append time; starts at 1, strictly increasing
    pub sequence: u64,
    /// The decoded operation
    pub operation: Operation,
    /// Serialized payload length in bytes (batch sizing uses this)
    pub size: usize,
}

// ============================================================================
// Frame codec
// ============================================================================

/// A single on-disk frame: a serialized operation plus sequence and checksum
#[derive(Debug, Clone)]
pub struct EntryFrame {
    /// bincode-serialized Operation
    pub data: Vec<u8>,
    /// Sequence number of the entry
    pub sequence: u64,
    /// CRC32 checksum of data
    pub checksum: u32,
}

impl EntryFrame {
    /// Build a frame from an operation
    pub fn from_operation(sequence: u64, operation: &Operation) -> Result<Self, QueueError> {
        let data = bincode::serialize(operation)
            .map_err(|e| QueueError::Corruption(format!("serialize: {}", e)))?;
        let checksum = crc32fast::hash(&data);

        debug_assert!(!data.is_empty(), "Postcondition: serialized data must not be empty");

        Ok(EntryFrame {
            data,
            sequence,
            checksum,
        })
    }

    /// Deserialize the payload back into an operation
    pub fn to_operation(&self) -> Result<Operation, QueueError> {
        bincode::deserialize(&self.data)
            .map_err(|e| QueueError::Corruption(format!("deserialize: {}", e)))
    }

    /// Validate the frame checksum
    pub fn validate(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    /// Total size on disk (overhead + data)
    pub fn disk_size(&self) -> usize {
        FRAME_OVERHEAD
            .checked_add(self.data.len())
            .expect("frame size overflow is unreachable for data < u32::MAX")
    }

    /// Encode the frame to bytes for writing
    pub fn encode(&self) -> Vec<u8> {
        let data_len = self.data.len() as u32;
        let total_size = self.disk_size();
        let mut buf = Vec::with_capacity(total_size);

        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.data);

        debug_assert_eq!(
            buf.len(),
            total_size,
            "Postcondition: encoded size must match expected"
        );

        buf
    }

    /// Parse the fixed 16-byte frame header: (sequence, checksum, data_length)
    fn decode_header(buf: &[u8; FRAME_OVERHEAD]) -> (u64, u32, usize) {
        let data_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let sequence = u64::from_le_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let checksum = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        (sequence, checksum, data_len)
    }

    /// Decode a frame from bytes. Returns None if truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < FRAME_OVERHEAD {
            return None;
        }
        let mut header = [0u8; FRAME_OVERHEAD];
        header.copy_from_slice(&data[..FRAME_OVERHEAD]);
        let (sequence, checksum, data_len) = Self::decode_header(&header);

        let total_size = FRAME_OVERHEAD.checked_add(data_len)?;
        if data.len() < total_size {
            return None; // Truncated frame
        }

        let entry_data = data[FRAME_OVERHEAD..total_size].to_vec();
        if crc32fast::hash(&entry_data) != checksum {
            return None; // Corrupted frame
        }

        Some((
            EntryFrame {
                data: entry_data,
                sequence,
                checksum,
            },
            total_size,
        ))
    }
}

// ============================================================================
// Segment naming and header
// ============================================================================

/// Segment file naming: ops-{first_sequence:016x}.log
fn segment_file_name(first_sequence: u64) -> String {
    format!("ops-{:016x}.log", first_sequence)
}

/// Parse the first sequence number from a segment file name
pub(crate) fn parse_segment_sequence(name: &str) -> Option<u64> {
    let name = name.strip_prefix("ops-")?.strip_suffix(".log")?;
    u64::from_str_radix(name, 16).ok()
}

fn encode_segment_header(first_sequence: u64) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4] = SEGMENT_VERSION;
    header[5] = 0; // flags
    // header[6..8] reserved
    header[8..16].copy_from_slice(&first_sequence.to_le_bytes());
    header
}

fn decode_segment_header(buf: &[u8]) -> Result<u64, QueueError> {
    if buf.len() < SEGMENT_HEADER_SIZE {
        return Err(QueueError::Corruption(
            "segment file too short for header".to_string(),
        ));
    }
    if buf[0..4] != SEGMENT_MAGIC {
        return Err(QueueError::Corruption(format!(
            "invalid segment magic: {:?}",
            &buf[0..4]
        )));
    }
    let version = buf[4];
    if version != SEGMENT_VERSION {
        return Err(QueueError::Corruption(format!(
            "unsupported segment version: {}",
            version
        )));
    }
    Ok(u64::from_le_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]))
}

// ============================================================================
// Advisory container lock
// ============================================================================

/// Advisory per-container lock, held for the queue's lifetime.
///
/// Backed by `File::try_lock` on `.lock` inside the container directory: the
/// OS releases it on drop or process death, so a crashed process never wedges
/// the container, while a second live processor gets `QueueError::Locked`.
#[derive(Debug)]
pub struct QueueLock {
    _file: File,
    path: PathBuf,
}

impl QueueLock {
    /// Acquire the lock, failing fast if another handle holds it
    pub fn acquire(dir: &Path) -> Result<Self, QueueError> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => Ok(QueueLock { _file: file, path }),
            Err(TryLockError::WouldBlock) => Err(QueueError::Locked(format!(
                "{} is held by another process",
                path.display()
            ))),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Segment scanning
// ============================================================================

/// Outcome of scanning one frame
enum ScanItem {
    /// A checksum-valid frame
    Valid { sequence: u64, data: Vec<u8> },
    /// Checksum failed but the claimed length was plausible; the scan
    /// resumes at the next frame boundary
    CorruptFrame,
    /// Implausible length or truncated payload; the rest of the segment is
    /// unreadable
    CorruptTail,
    /// Clean end of file
    Eof,
}

/// Streaming reader over one segment's frames
struct SegmentScanner {
    reader: BufReader<File>,
    /// Byte offset of the next unread frame
    offset: u64,
}

impl SegmentScanner {
    /// Open a segment, validate its header, and seek to `offset`
    /// (`SEGMENT_HEADER_SIZE` to start at the first frame).
    fn open_at(path: &Path, offset: u64) -> Result<(u64, Self), QueueError> {
        let mut file = File::open(path)?;
        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        let mut read = 0;
        while read < SEGMENT_HEADER_SIZE {
            match file.read(&mut header[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let first_sequence = decode_segment_header(&header[..read])?;
        if offset > SEGMENT_HEADER_SIZE as u64 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok((
            first_sequence,
            SegmentScanner {
                reader: BufReader::new(file),
                offset,
            },
        ))
    }

    /// Scan the next frame
    fn next_frame(&mut self) -> Result<ScanItem, QueueError> {
        let mut header = [0u8; FRAME_OVERHEAD];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => return Ok(ScanItem::Eof),
            ReadOutcome::Partial => return Ok(ScanItem::CorruptTail),
            ReadOutcome::Full => {}
        }
        let (sequence, checksum, data_len) = EntryFrame::decode_header(&header);
        if data_len > MAX_FRAME_DATA_BYTES {
            return Ok(ScanItem::CorruptTail);
        }

        let mut data = vec![0u8; data_len];
        match read_exact_or_eof(&mut self.reader, &mut data)? {
            ReadOutcome::Eof | ReadOutcome::Partial => return Ok(ScanItem::CorruptTail),
            ReadOutcome::Full => {}
        }
        self.offset += (FRAME_OVERHEAD + data_len) as u64;

        if crc32fast::hash(&data) != checksum {
            return Ok(ScanItem::CorruptFrame);
        }
        Ok(ScanItem::Valid { sequence, data })
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

/// Fill `buf` completely, distinguishing a clean EOF (zero bytes read) from
/// a truncated read (some bytes read, then EOF).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, QueueError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return Ok(if read == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

// ============================================================================
// Segment writer
// ============================================================================

/// Writer over the active segment file
#[derive(Debug)]
struct SegmentWriter {
    file: File,
    size: u64,
}

impl SegmentWriter {
    /// Create a new segment file, writing the header immediately
    fn create(path: &Path, first_sequence: u64) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        Self::init(file, first_sequence)
    }

    /// Recreate over an existing file, truncating whatever it held
    fn recreate(path: &Path, first_sequence: u64) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::init(file, first_sequence)
    }

    fn init(mut file: File, first_sequence: u64) -> Result<Self, QueueError> {
        file.write_all(&encode_segment_header(first_sequence))?;
        Ok(SegmentWriter {
            file,
            size: SEGMENT_HEADER_SIZE as u64,
        })
    }

    /// Append an encoded frame (does NOT fsync)
    fn append(&mut self, encoded: &[u8]) -> Result<(), QueueError> {
        self.file.write_all(encoded)?;
        self.size += encoded.len() as u64;
        Ok(())
    }

    /// Fsync the segment file
    fn sync(&mut self) -> Result<(), QueueError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Roll the file back to `size` bytes after a failed batch, so sequence
    /// numbers can be reissued without leaving duplicate frames behind.
    fn truncate_to(&mut self, size: u64) -> Result<(), QueueError> {
        self.file.set_len(size)?;
        self.file.seek(SeekFrom::Start(size))?;
        self.size = size;
        Ok(())
    }
}

/// Metadata for one on-disk segment
#[derive(Debug, Clone)]
struct SegmentInfo {
    first_sequence: u64,
    path: PathBuf,
}

/// Cached read position: the frame holding `sequence` starts at `offset`
/// within `segments[segment_idx]`
#[derive(Debug, Clone, Copy)]
struct ReadCursor {
    sequence: u64,
    segment_idx: usize,
    offset: u64,
}

/// Persisted ack mark
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRecord {
    version: u32,
    ack_seq: u64,
}

// ============================================================================
// DiskQueue
// ============================================================================

/// Append-only, disk-backed FIFO of serialized operations.
///
/// Single concurrent writer (`append*`) and single concurrent reader
/// (`get_batch` + `ack`); callers serialize access with their own lock.
/// Content survives process restarts; `open` reconstructs both marks from
/// disk, tolerating crash-truncated tails.
#[derive(Debug)]
pub struct DiskQueue {
    dir: PathBuf,
    max_segment_bytes: u64,
    lock: Option<QueueLock>,
    /// Readable segments, sorted by first sequence; the active writer's
    /// segment is always last
    segments: Vec<SegmentInfo>,
    writer: Option<SegmentWriter>,
    /// Highest sequence durably appended (0 = none)
    append_seq: u64,
    /// Highest sequence acknowledged by the backend (0 = none)
    ack_seq: u64,
    cursor: Option<ReadCursor>,
    corrupted_entries: u64,
    closed: bool,
}

impl DiskQueue {
    /// Open (creating if needed) the queue in a container directory:
    /// acquires the advisory lock, loads the persisted ack mark, and scans
    /// existing segments to reconstruct the append mark.
    pub fn open(dir: &Path, config: &QueueConfig) -> Result<Self, QueueError> {
        debug_assert!(
            config.max_segment_bytes > SEGMENT_HEADER_SIZE as u64,
            "Precondition: max_segment_bytes must exceed the header size"
        );

        fs::create_dir_all(dir)?;
        let lock = QueueLock::acquire(dir)?;
        let ack_seq = load_ack_mark(dir);

        let mut segments = Vec::new();
        let mut last_valid_seq = 0u64;
        let mut recovered_entries = 0u64;
        let mut corrupted_entries = 0u64;

        let mut named: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(seq) = name.to_str().and_then(parse_segment_sequence) {
                named.push((seq, entry.path()));
            }
        }
        named.sort_by_key(|(seq, _)| *seq);

        for (first_sequence, path) in named {
            let (header_seq, mut scanner) =
                match SegmentScanner::open_at(&path, SEGMENT_HEADER_SIZE as u64) {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(
                            segment = %path.display(),
                            error = %e,
                            "skipping unreadable segment"
                        );
                        continue;
                    }
                };
            if header_seq != first_sequence {
                warn!(
                    segment = %path.display(),
                    header_seq,
                    "segment header disagrees with file name; skipping"
                );
                continue;
            }

            loop {
                match scanner.next_frame()? {
                    ScanItem::Valid { sequence, .. } => {
                        // Stale duplicates (rolled-back batches) never advance
                        if sequence > last_valid_seq {
                            last_valid_seq = sequence;
                            recovered_entries += 1;
                        }
                    }
                    ScanItem::CorruptFrame => {
                        corrupted_entries += 1;
                    }
                    ScanItem::CorruptTail => {
                        corrupted_entries += 1;
                        break;
                    }
                    ScanItem::Eof => break,
                }
            }
            segments.push(SegmentInfo {
                first_sequence,
                path,
            });
        }

        if corrupted_entries > 0 {
            warn!(
                dir = %dir.display(),
                corrupted = corrupted_entries,
                "discarded corrupted queue entries during recovery"
            );
        }

        // A crash between segment cleanup and ack-file cleanup can leave the
        // ack mark ahead of every surviving frame; the marks still satisfy
        // ack <= append.
        let append_seq = last_valid_seq.max(ack_seq);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            entries = recovered_entries,
            append_mark = append_seq,
            ack_mark = ack_seq,
            "durable queue opened"
        );

        Ok(DiskQueue {
            dir: dir.to_path_buf(),
            max_segment_bytes: config.max_segment_bytes,
            lock: Some(lock),
            segments,
            writer: None,
            append_seq,
            ack_seq,
            cursor: None,
            corrupted_entries,
            closed: false,
        })
    }

    /// Durably append one operation; returns its assigned sequence number
    pub fn append(&mut self, operation: &Operation) -> Result<u64, QueueError> {
        self.append_batch(std::slice::from_ref(operation))
    }

    /// Durably append a batch with a single fsync; returns the last assigned
    /// sequence number. Sequence numbers advance only once the whole batch
    /// is durable — a failed batch is rolled back and assigns nothing.
    pub fn append_batch(&mut self, operations: &[Operation]) -> Result<u64, QueueError> {
        self.check_open()?;
        if operations.is_empty() {
            return Err(QueueError::Io(IoError::new(
                ErrorKind::InvalidInput,
                "empty batch",
            )));
        }

        let rollback = self.writer.as_ref().map(|w| w.size);
        match self.write_frames(operations) {
            Ok(last_seq) => {
                self.append_seq = last_seq;
                debug_assert!(
                    self.ack_seq <= self.append_seq,
                    "Invariant violated: ack mark must not exceed append mark"
                );
                Ok(last_seq)
            }
            Err(e) => {
                // Strip any partial frames so their sequences can be reissued
                // to a retry without leaving duplicates on disk.
                let rolled_back = match (self.writer.as_mut(), rollback) {
                    (Some(w), Some(size)) => w.truncate_to(size).is_ok(),
                    _ => false,
                };
                if !rolled_back {
                    // Abandon the segment; the next append starts a fresh
                    // file and recovery filters stale duplicates by sequence.
                    self.writer = None;
                }
                Err(e)
            }
        }
    }

    fn write_frames(&mut self, operations: &[Operation]) -> Result<u64, QueueError> {
        let mut next_seq = self.append_seq;
        for operation in operations {
            next_seq += 1;
            let frame = EntryFrame::from_operation(next_seq, operation)?;
            self.rotate_if_needed(next_seq)?;
            let writer = self
                .writer
                .as_mut()
                .expect("writer must exist after rotate_if_needed");
            writer.append(&frame.encode())?;
        }
        let writer = self
            .writer
            .as_mut()
            .expect("writer must exist after rotate_if_needed");
        writer.sync()?;
        Ok(next_seq)
    }

    /// Start a fresh segment when there is none or the active one is full
    fn rotate_if_needed(&mut self, next_sequence: u64) -> Result<(), QueueError> {
        let needs_new = match &self.writer {
            None => true,
            Some(w) => w.size >= self.max_segment_bytes,
        };
        if !needs_new {
            return Ok(());
        }

        if let Some(w) = self.writer.as_mut() {
            w.sync()?;
        }
        let path = self.dir.join(segment_file_name(next_sequence));
        let writer = match SegmentWriter::create(&path, next_sequence) {
            Ok(w) => w,
            Err(QueueError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                // A file named for an unassigned sequence can only hold frames
                // from a batch that already reported failure; truncating it
                // destroys nothing the caller was promised.
                warn!(
                    segment = %path.display(),
                    "overwriting segment left behind by a failed batch"
                );
                SegmentWriter::recreate(&path, next_sequence)?
            }
            Err(e) => return Err(e),
        };
        debug!(
            segment = %path.display(),
            first_sequence = next_sequence,
            "rotated to new segment"
        );
        if self.segments.last().map(|s| s.first_sequence) != Some(next_sequence) {
            self.segments.push(SegmentInfo {
                first_sequence: next_sequence,
                path,
            });
        }
        self.writer = Some(writer);
        Ok(())
    }

    /// Return the next unacknowledged entries in sequence order, bounded by
    /// `max_count` entries and `max_bytes` of payload (at least one entry is
    /// returned when one exists). Fails with `QueueError::Empty` when
    /// everything appended has been acknowledged. Repeated calls without an
    /// intervening `ack` re-read the same entries.
    pub fn get_batch(
        &mut self,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        self.check_open()?;
        if self.ack_seq >= self.append_seq {
            return Err(QueueError::Empty);
        }
        let target = self.ack_seq + 1;

        let (mut idx, mut offset) = match self.cursor {
            Some(c) if c.sequence == target && c.segment_idx < self.segments.len() => {
                (c.segment_idx, c.offset)
            }
            _ => {
                // Largest segment whose first sequence is at or below target;
                // fall back to the oldest when corruption left a gap below it.
                let idx = self
                    .segments
                    .partition_point(|s| s.first_sequence <= target)
                    .saturating_sub(1);
                (idx, SEGMENT_HEADER_SIZE as u64)
            }
        };

        let mut entries: Vec<QueueEntry> = Vec::new();
        let mut bytes = 0usize;
        let mut prev_seq = self.ack_seq;

        'segments: while idx < self.segments.len() {
            let path = self.segments[idx].path.clone();
            let mut scanner = match SegmentScanner::open_at(&path, offset) {
                Ok((_, scanner)) => scanner,
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "segment unreadable during read");
                    idx += 1;
                    offset = SEGMENT_HEADER_SIZE as u64;
                    continue;
                }
            };

            loop {
                match scanner.next_frame()? {
                    ScanItem::Valid { sequence, data } => {
                        // Skip already-acked frames and stale duplicates
                        if sequence <= prev_seq {
                            continue;
                        }
                        // Frames past the append mark are leftovers of a batch
                        // that reported failure; they were never assigned, and
                        // every frame after them is newer still.
                        if sequence > self.append_seq {
                            break 'segments;
                        }
                        let operation = match bincode::deserialize(&data) {
                            Ok(op) => op,
                            Err(e) => {
                                warn!(
                                    sequence,
                                    error = %e,
                                    "discarding undecodable queue entry"
                                );
                                self.corrupted_entries += 1;
                                continue;
                            }
                        };
                        prev_seq = sequence;
                        bytes += data.len();
                        entries.push(QueueEntry {
                            sequence,
                            operation,
                            size: data.len(),
                        });
                        if entries.len() >= max_count || bytes >= max_bytes {
                            self.cursor = Some(ReadCursor {
                                sequence: sequence + 1,
                                segment_idx: idx,
                                offset: scanner.offset,
                            });
                            break 'segments;
                        }
                    }
                    ScanItem::CorruptFrame => continue,
                    ScanItem::CorruptTail | ScanItem::Eof => break,
                }
            }

            idx += 1;
            offset = SEGMENT_HEADER_SIZE as u64;
        }

        if entries.is_empty() {
            // Marks said entries existed; the files disagree. Surface as
            // empty rather than spinning the caller.
            warn!(
                dir = %self.dir.display(),
                ack_mark = self.ack_seq,
                append_mark = self.append_seq,
                "no readable entries despite pending marks"
            );
            self.cursor = None;
            return Err(QueueError::Empty);
        }

        if entries.len() < max_count && bytes < max_bytes {
            // Ran off the end of the last segment
            self.cursor = Some(ReadCursor {
                sequence: prev_seq + 1,
                segment_idx: self.segments.len().saturating_sub(1),
                offset,
            });
        }

        debug_assert!(
            entries.windows(2).all(|w| w[0].sequence < w[1].sequence),
            "Postcondition: batch must be in strictly increasing sequence order"
        );
        Ok(entries)
    }

    /// Record that all entries up to and including `sequence` were accepted.
    /// Monotonic: a sequence at or below the current mark is a no-op; one
    /// beyond the append mark is rejected. The mark is persisted before
    /// fully-acknowledged segment files are deleted.
    pub fn ack(&mut self, sequence: u64) -> Result<(), QueueError> {
        self.check_open()?;
        if sequence <= self.ack_seq {
            debug!(
                sequence,
                ack_mark = self.ack_seq,
                "duplicate ack ignored"
            );
            return Ok(());
        }
        if sequence > self.append_seq {
            return Err(QueueError::SequenceAhead {
                requested: sequence,
                append_mark: self.append_seq,
            });
        }

        persist_ack_mark(&self.dir, sequence)?;
        self.ack_seq = sequence;
        self.drop_acked_segments()?;

        debug_assert!(
            self.ack_seq <= self.append_seq,
            "Invariant violated: ack mark must not exceed append mark"
        );
        Ok(())
    }

    /// Delete whole segment files that contain only acknowledged entries.
    /// The active (last) segment is never deleted here.
    fn drop_acked_segments(&mut self) -> Result<(), QueueError> {
        while self.segments.len() >= 2 {
            let next_first = self.segments[1].first_sequence;
            if next_first > self.ack_seq + 1 {
                break;
            }
            let info = self.segments.remove(0);
            self.cursor = None;
            match fs::remove_file(&info.path) {
                Ok(()) => debug!(segment = %info.path.display(), "dropped acknowledged segment"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Highest durably appended sequence (0 = none)
    pub fn append_mark(&self) -> u64 {
        self.append_seq
    }

    /// Highest acknowledged sequence (0 = none)
    pub fn ack_mark(&self) -> u64 {
        self.ack_seq
    }

    /// Whether every appended entry has been acknowledged
    pub fn is_drained(&self) -> bool {
        self.ack_seq == self.append_seq
    }

    /// Number of unacknowledged entries still queued
    pub fn pending(&self) -> u64 {
        self.append_seq - self.ack_seq
    }

    /// Entries discarded as corrupted since open
    pub fn corrupted_entries(&self) -> u64 {
        self.corrupted_entries
    }

    /// Container directory this queue lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush and release file handles and the advisory lock. Queue content
    /// is preserved on disk for later resumption. Idempotent.
    pub fn close(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        if let Some(w) = self.writer.as_mut() {
            w.sync()?;
        }
        self.writer = None;
        self.cursor = None;
        self.lock = None;
        self.closed = true;
        debug!(dir = %self.dir.display(), "durable queue closed");
        Ok(())
    }

    /// Delete on-disk queue files, but only when fully drained
    /// (`ack_mark == append_mark`); otherwise a no-op returning false.
    pub fn cleanup_if_empty(&mut self) -> Result<bool, QueueError> {
        self.check_open()?;
        if !self.is_drained() {
            return Ok(false);
        }

        self.writer = None;
        self.cursor = None;
        self.segments.clear();

        // List again rather than trusting the in-memory set: segments
        // excluded at recovery (bad headers) must go too.
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().and_then(parse_segment_sequence).is_some() {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        match fs::remove_file(self.dir.join(ACK_FILE_NAME)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(dir = %self.dir.display(), "drained queue cleaned up");
        Ok(true)
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

fn load_ack_mark(dir: &Path) -> u64 {
    let path = dir.join(ACK_FILE_NAME);
    match fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<AckRecord>(&bytes) {
            Ok(record) => record.ack_seq,
            Err(e) => {
                // A torn ack file only regresses the mark; resubmitting
                // already-accepted entries is safe under at-least-once.
                warn!(path = %path.display(), error = %e, "malformed ack file; assuming 0");
                0
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable ack file; assuming 0");
            0
        }
    }
}

fn persist_ack_mark(dir: &Path, sequence: u64) -> Result<(), QueueError> {
    let record = AckRecord {
        version: 1,
        ack_seq: sequence,
    };
    let bytes = serde_json::to_vec(&record)
        .map_err(|e| QueueError::Corruption(format!("encode ack record: {}", e)))?;
    let tmp = dir.join("ack.json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(ACK_FILE_NAME))?;
    Ok(())
}
