//! Segmented write-ahead log for the corsac ingestion buffer.
//!
//! The log is an ordered sequence of append-only segment files plus the
//! currently open tail. Records are framed with a length prefix and a CRC32
//! checksum so replay can detect a torn tail and stop at the last readable
//! record instead of failing.
//!
//! # Architecture
//!
//! ```text
//! Appender → commit → Wal append (framed records) → fsync → registry update
//! Startup  → Wal::replay (checkpoint, then segments) → visitor
//! ```
//!
//! Replay is corruption-tolerant: a segment with an unreadable header is
//! skipped, and a malformed record ends replay at that point, leaving
//! everything decoded before it valid and the engine usable.

pub(crate) mod checkpoint;

use crate::error::{Result, WalError};
use crate::record::Record;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on a single framed record; larger length prefixes are
/// treated as corruption.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = [b'C', b'W', b'A', b'L'];

/// WAL format version.
const WAL_VERSION: u16 = 1;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync on commit (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum size of a single WAL segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

/// Visitor invoked once per decoded record during replay, in on-disk order.
pub trait ReplayVisitor {
    /// Handles one replayed record.
    fn visit(&mut self, record: Record) -> Result<()>;
}

/// WAL segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 22; // 4 + 2 + 8 + 8

    fn new(segment_id: u64) -> Self {
        Self {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            segment_id,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != WAL_MAGIC {
            return Err(WalError::InvalidMagic(magic));
        }

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        let version = u16::from_le_bytes(buf);
        if version != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(version));
        }

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let segment_id = u64::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let created_at = i64::from_le_bytes(buf);

        Ok(Self {
            magic,
            version,
            segment_id,
            created_at,
        })
    }
}

/// Outcome of reading one framed record.
enum ReadOutcome {
    Record(Record),
    Eof,
    Corrupt(WalError),
}

/// Outcome of replaying one segment file.
enum SegmentOutcome {
    /// All records were read to the end of the segment.
    Completed,
    /// A malformed record cut the segment short.
    CorruptTail,
    /// The file could not be opened or is not a WAL segment.
    Unreadable,
}

/// Append-only segmented log.
///
/// One `Wal` owns the open tail segment of a log directory. Replay is a
/// static operation over the directory and does not require (or disturb) a
/// writer.
pub struct Wal {
    /// Directory containing WAL segments and checkpoints.
    dir: PathBuf,
    /// Current segment file being written to.
    writer: BufWriter<File>,
    /// Current segment ID.
    segment_id: u64,
    /// Current segment size in bytes.
    segment_bytes: usize,
    /// WAL configuration.
    config: WalConfig,
}

impl Wal {
    /// Opens a WAL in the given directory, creating it if needed.
    ///
    /// Existing segments are left untouched; a fresh tail segment is opened
    /// with an id above every existing segment and checkpoint so history is
    /// never overwritten.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut max_id: Option<u64> = None;
        for (id, _) in Self::list_segments(&dir)? {
            max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
        }
        if let Some((id, _)) = checkpoint::last_checkpoint(&dir)? {
            max_id = Some(max_id.map_or(id, |m| m.max(id)));
        }
        let segment_id = max_id.map_or(0, |id| id + 1);

        let writer = Self::create_segment(&dir, segment_id)?;
        Ok(Self {
            dir,
            writer,
            segment_id,
            segment_bytes: SegmentHeader::SIZE,
            config,
        })
    }

    /// Appends one record to the tail segment, rotating first if the
    /// segment-size threshold would be exceeded.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let payload = record.encode();
        let framed = 8 + payload.len();

        if self.segment_bytes > SegmentHeader::SIZE
            && self.segment_bytes + framed > self.config.segment_size
        {
            self.rotate_segment()?;
        }

        write_framed(&mut self.writer, &payload)?;
        self.segment_bytes += framed;
        Ok(())
    }

    /// Flushes buffered records and synchronizes the tail segment to
    /// storage according to the configured sync mode.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.writer.get_ref().sync_all()?,
            SyncMode::Fdatasync => self.writer.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }

    /// Forces rotation to a new segment, synchronized to storage before
    /// returning. Returns the new tail segment id.
    pub fn next_segment_sync(&mut self) -> Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.rotate_segment()?;
        Ok(self.segment_id)
    }

    /// Returns the current tail segment id.
    pub fn current_segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Returns the log directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes closed segments with id at or below `last`.
    ///
    /// The open tail is never deleted.
    pub fn delete_segments_through(&self, last: u64) -> Result<()> {
        for (id, path) in Self::list_segments(&self.dir)? {
            if id >= self.segment_id || id > last {
                continue;
            }
            fs::remove_file(&path)?;
            debug!(segment = id, "removed WAL segment");
        }
        Ok(())
    }

    /// Lowest and highest segment ids present in a log directory.
    pub fn segment_range(dir: impl AsRef<Path>) -> Result<Option<(u64, u64)>> {
        let ids: Vec<u64> = Self::list_segments(dir.as_ref())?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        Ok(ids
            .first()
            .copied()
            .zip(ids.last().copied()))
    }

    /// Replays the log directory: the newest checkpoint first, then every
    /// segment above it, invoking the visitor once per decoded record in
    /// on-disk order.
    ///
    /// Corruption is tolerated, not surfaced: segments that are not
    /// readable WAL files are skipped, and the first malformed record ends
    /// replay at that point. Visitor errors propagate.
    pub fn replay<V: ReplayVisitor>(dir: impl AsRef<Path>, visitor: &mut V) -> Result<()> {
        Self::replay_through(dir.as_ref(), None, visitor)
    }

    /// Replay bounded to segments with id at or below `last` (if given).
    pub(crate) fn replay_through<V: ReplayVisitor>(
        dir: &Path,
        last: Option<u64>,
        visitor: &mut V,
    ) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        let mut replayed_through = None;
        if let Some((cp_id, cp_dir)) = checkpoint::last_checkpoint(dir)? {
            for (id, path) in Self::list_segments(&cp_dir)? {
                match Self::replay_segment(&path, visitor)? {
                    SegmentOutcome::Completed => {}
                    SegmentOutcome::CorruptTail => {
                        warn!(checkpoint = cp_id, segment = id, "checkpoint replay cut short by malformed record");
                        return Ok(());
                    }
                    SegmentOutcome::Unreadable => {
                        warn!(checkpoint = cp_id, segment = id, "skipping unreadable checkpoint segment");
                    }
                }
            }
            replayed_through = Some(cp_id);
        }

        for (id, path) in Self::list_segments(dir)? {
            if replayed_through.is_some_and(|cp| id <= cp) {
                continue;
            }
            if last.is_some_and(|l| id > l) {
                break;
            }
            match Self::replay_segment(&path, visitor)? {
                SegmentOutcome::Completed => {}
                SegmentOutcome::CorruptTail => {
                    warn!(segment = id, "replay cut short by malformed record");
                    return Ok(());
                }
                SegmentOutcome::Unreadable => {
                    warn!(segment = id, path = %path.display(), "skipping unreadable segment");
                }
            }
        }
        Ok(())
    }

    /// Replays a single segment file. I/O and format failures before the
    /// first record mark the segment unreadable; failures between records
    /// mark a corrupt tail. Only visitor errors escape as `Err`.
    fn replay_segment<V: ReplayVisitor>(path: &Path, visitor: &mut V) -> Result<SegmentOutcome> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(SegmentOutcome::Unreadable),
        };
        let mut reader = BufReader::new(file);
        if SegmentHeader::read_from(&mut reader).is_err() {
            return Ok(SegmentOutcome::Unreadable);
        }

        loop {
            match read_framed(&mut reader) {
                Ok(ReadOutcome::Record(record)) => visitor.visit(record)?,
                Ok(ReadOutcome::Eof) => return Ok(SegmentOutcome::Completed),
                Ok(ReadOutcome::Corrupt(err)) => {
                    warn!(path = %path.display(), error = %err, "malformed WAL record");
                    return Ok(SegmentOutcome::CorruptTail);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "error reading WAL record");
                    return Ok(SegmentOutcome::CorruptTail);
                }
            }
        }
    }

    /// Lists segment files in a directory, sorted by segment id.
    fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        if !dir.exists() {
            return Ok(segments);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
                if let Some(id) = parse_segment_id(&path) {
                    segments.push((id, path));
                }
            }
        }
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    fn create_segment(dir: &Path, segment_id: u64) -> Result<BufWriter<File>> {
        let path = segment_path(dir, segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        SegmentHeader::new(segment_id).write_to(&mut writer)?;
        writer.flush()?;
        Ok(writer)
    }

    fn rotate_segment(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        self.segment_id += 1;
        self.writer = Self::create_segment(&self.dir, self.segment_id)?;
        self.segment_bytes = SegmentHeader::SIZE;

        debug!(segment = self.segment_id, "rotated to new WAL segment");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Best effort to flush remaining records.
        if let Err(err) = self.sync() {
            warn!(error = %err, "failed to flush WAL on drop");
        }
    }
}

/// Generates the path for a segment file.
fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!(
        "{SEGMENT_PREFIX}_{segment_id:016x}.{SEGMENT_EXTENSION}"
    ))
}

/// Parses the segment id from a segment file path.
fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(&format!("{SEGMENT_PREFIX}_")))
        .and_then(|s| u64::from_str_radix(s, 16).ok())
}

/// Writes one framed record payload: length (4) + crc (4) + payload.
pub(crate) fn write_framed<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let crc = crc32fast::hash(payload);
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Reads one framed record, classifying end-of-segment and corruption.
fn read_framed<R: Read>(reader: &mut R) -> Result<ReadOutcome> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Eof),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(ReadOutcome::Eof);
    }
    if len > MAX_RECORD_SIZE {
        return Ok(ReadOutcome::Corrupt(WalError::Decode(format!(
            "record length {len} exceeds cap"
        ))));
    }

    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(ReadOutcome::Corrupt(WalError::Decode(
                "truncated record header".to_string(),
            )));
        }
        Err(e) => return Err(e.into()),
    }
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(ReadOutcome::Corrupt(WalError::Decode(
                "truncated record payload".to_string(),
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Ok(ReadOutcome::Corrupt(WalError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        }));
    }

    match Record::decode(&payload) {
        Ok(record) => Ok(ReadOutcome::Record(record)),
        Err(err) => Ok(ReadOutcome::Corrupt(err)),
    }
}
