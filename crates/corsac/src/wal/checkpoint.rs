//! Checkpoints: compacted snapshots superseding fully-covered segments.
//!
//! A checkpoint directory `checkpoint_<id>` holds segment-formatted files
//! carrying the compacted state of every segment up to and including `id`:
//! series records for still-live refs, sample/exemplar/histogram records at
//! or above the truncation boundary, and every tombstone. Replay reads the
//! newest checkpoint before any remaining segments.

use crate::error::{Result, WalError};
use crate::record::{Record, SeriesRef};
use crate::wal::{write_framed, ReplayVisitor, SegmentHeader, Wal};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Checkpoint directory prefix.
const CHECKPOINT_PREFIX: &str = "checkpoint";

/// Suffix of a checkpoint directory still being written.
const TMP_SUFFIX: &str = "tmp";

fn checkpoint_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{CHECKPOINT_PREFIX}_{id:016x}"))
}

fn parse_checkpoint_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(&format!("{CHECKPOINT_PREFIX}_"))?;
    u64::from_str_radix(id, 16).ok()
}

/// Lists checkpoint directories, sorted by covered-segment id.
fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut checkpoints = Vec::new();
    if !dir.exists() {
        return Ok(checkpoints);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() || path.extension().is_some_and(|ext| ext == TMP_SUFFIX) {
            continue;
        }
        if let Some(id) = parse_checkpoint_id(&path) {
            checkpoints.push((id, path));
        }
    }
    checkpoints.sort_by_key(|(id, _)| *id);
    Ok(checkpoints)
}

/// Returns the newest checkpoint in the directory, if any.
pub(crate) fn last_checkpoint(dir: &Path) -> Result<Option<(u64, PathBuf)>> {
    Ok(list_checkpoints(dir)?.pop())
}

/// Deletes checkpoints superseded by a newer one covering segment `before`.
pub(crate) fn delete_old_checkpoints(dir: &Path, before: u64) -> Result<()> {
    for (id, path) in list_checkpoints(dir)? {
        if id < before {
            fs::remove_dir_all(&path)?;
            debug!(checkpoint = id, "removed superseded checkpoint");
        }
    }
    // Abandoned partial checkpoints are garbage from an interrupted
    // truncation; clear them as well.
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && path.extension().is_some_and(|ext| ext == TMP_SUFFIX) {
            fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}

/// Writes retained records into a fresh checkpoint segment.
struct CheckpointWriter<'a> {
    writer: BufWriter<File>,
    keep: &'a dyn Fn(SeriesRef) -> bool,
    min_ts: i64,
    kept: usize,
    dropped: usize,
}

impl CheckpointWriter<'_> {
    fn retain(&self, record: &Record) -> bool {
        match record {
            Record::Series(s) => (self.keep)(s.ref_id),
            Record::Sample(s) => s.ts >= self.min_ts && (self.keep)(s.ref_id),
            Record::Exemplar(e) => e.ts >= self.min_ts && (self.keep)(e.ref_id),
            Record::Histogram(h) => h.ts >= self.min_ts && (self.keep)(h.ref_id),
            Record::FloatHistogram(h) => h.ts >= self.min_ts && (self.keep)(h.ref_id),
            // Tombstones always survive: replay uses them to keep retired
            // refs out of circulation even after every covered segment and
            // the series' own records are gone.
            Record::Tombstone(_) => true,
        }
    }
}

impl ReplayVisitor for CheckpointWriter<'_> {
    fn visit(&mut self, record: Record) -> Result<()> {
        if self.retain(&record) {
            write_framed(&mut self.writer, &record.encode())?;
            self.kept += 1;
        } else {
            self.dropped += 1;
        }
        Ok(())
    }
}

/// Compacts the previous checkpoint and every segment up to and including
/// `last` into a new checkpoint directory.
///
/// Series records survive while `keep(ref)` holds; data records also need
/// `ts >= min_ts`. The checkpoint is written to a temporary directory and
/// atomically renamed into place so replay never observes a partial one.
pub(crate) fn create_checkpoint(
    dir: &Path,
    last: u64,
    keep: &dyn Fn(SeriesRef) -> bool,
    min_ts: i64,
) -> Result<PathBuf> {
    let final_path = checkpoint_path(dir, last);
    let tmp_path = final_path.with_extension(TMP_SUFFIX);
    if tmp_path.exists() {
        fs::remove_dir_all(&tmp_path)?;
    }
    fs::create_dir_all(&tmp_path)?;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(crate::wal::segment_path(&tmp_path, 0))?;
    let mut writer = BufWriter::new(file);
    SegmentHeader::new(0).write_to(&mut writer)?;

    let mut compactor = CheckpointWriter {
        writer,
        keep,
        min_ts,
        kept: 0,
        dropped: 0,
    };
    Wal::replay_through(dir, Some(last), &mut compactor)?;

    compactor.writer.flush()?;
    compactor.writer.get_ref().sync_all()?;
    drop(compactor.writer);

    if final_path.exists() {
        // A checkpoint for the same segment already exists; an interrupted
        // earlier truncation got this far. Replace it.
        warn!(path = %final_path.display(), "replacing existing checkpoint");
        fs::remove_dir_all(&final_path)?;
    }
    fs::rename(&tmp_path, &final_path)?;

    debug!(
        checkpoint = last,
        kept = compactor.kept,
        dropped = compactor.dropped,
        "wrote checkpoint"
    );
    Ok(final_path)
}
