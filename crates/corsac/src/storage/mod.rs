//! Storage engine: transactional appenders over the segmented log.
//!
//! [`Storage`] owns the series registry and the WAL exclusively. Producers
//! obtain one [`Appender`] per write transaction, stage records, and either
//! commit (durable flush, registry timestamp update, notifier trigger) or
//! roll back (series registrations survive, data records are discarded).
//! On open, the WAL is replayed to completion before any appender exists,
//! reconstructing the registry and the ref allocator.

use crate::error::{Result, WalError};
use crate::record::{
    stale_nan, Exemplar, FloatHistogram, Histogram, Labels, Record, RefExemplar,
    RefFloatHistogram, RefHistogram, RefSample, RefSeries, SeriesRef, EXEMPLAR_MAX_LABEL_LEN,
};
use crate::series::{SeriesEntry, SeriesRegistry};
use crate::wal::{checkpoint, ReplayVisitor, Wal, WalConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// External collaborator informed that new durable data exists.
///
/// Invoked asynchronously after each successful commit; delivery never
/// blocks the committing thread.
pub trait Notifier: Send + 'static {
    /// Signals that the WAL holds newly committed data.
    fn notify(&self);
}

type NotifierSlot = Arc<Mutex<Option<Box<dyn Notifier>>>>;

struct StorageInner {
    wal_dir: PathBuf,
    wal: Mutex<Wal>,
    series: SeriesRegistry,
    closed: AtomicBool,
    notifier: NotifierSlot,
    notify_tx: Mutex<Option<mpsc::Sender<()>>>,
    notify_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StorageInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_notify(&self) {
        let guard = self.notify_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Durable, replayable ingestion buffer over a log directory.
///
/// Cheap to clone; all clones share the same engine state.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Opens or creates the log directory, replays existing state, and
    /// returns a ready-to-use engine.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, WalConfig::default())
    }

    /// Opens the engine with explicit WAL configuration.
    pub fn open_with_config(dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let wal_dir = dir.as_ref().join("wal");
        fs::create_dir_all(&wal_dir)?;

        // Replay runs to completion before the writer exists, so it is
        // never concurrent with appends.
        let series = SeriesRegistry::new();
        let mut loader = RegistryLoader { series: &series };
        Wal::replay(&wal_dir, &mut loader)?;
        debug!(
            series = series.count(),
            last_ref = series.last_ref(),
            "replayed WAL"
        );

        let wal = Wal::open(&wal_dir, config)?;

        let notifier: NotifierSlot = Arc::new(Mutex::new(None));
        let (notify_tx, notify_rx) = mpsc::channel::<()>();
        let thread_notifier = Arc::clone(&notifier);
        let notify_thread = thread::Builder::new()
            .name("corsac-notify".to_string())
            .spawn(move || {
                while notify_rx.recv().is_ok() {
                    // Coalesce bursts: one delivery covers every commit
                    // signaled so far.
                    while notify_rx.try_recv().is_ok() {}
                    let guard = thread_notifier.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(notifier) = guard.as_ref() {
                        notifier.notify();
                    }
                }
            })?;

        Ok(Self {
            inner: Arc::new(StorageInner {
                wal_dir,
                wal: Mutex::new(wal),
                series,
                closed: AtomicBool::new(false),
                notifier,
                notify_tx: Mutex::new(Some(notify_tx)),
                notify_thread: Mutex::new(Some(notify_thread)),
            }),
        })
    }

    /// Returns a new appender for one write transaction.
    ///
    /// Many appenders may exist concurrently; each stages records
    /// independently until committed or rolled back.
    pub fn appender(&self) -> Appender {
        Appender {
            inner: Arc::clone(&self.inner),
            pending_series: Vec::new(),
            pending_samples: Vec::new(),
            pending_exemplars: Vec::new(),
            pending_histograms: Vec::new(),
            pending_float_histograms: Vec::new(),
        }
    }

    /// Registers the collaborator invoked after each successful commit.
    pub fn set_notifier(&self, notifier: impl Notifier) {
        let mut slot = self
            .inner
            .notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(notifier));
    }

    /// Removes data below the retention timestamp.
    ///
    /// Series whose `last_ts` is below `min_ts` have no retained data: a
    /// tombstone is written and the entry dropped. Everything in closed
    /// segments is then compacted into a checkpoint that omits records
    /// older than `min_ts`, and the covered segments are deleted. Holds
    /// the commit serialization point for the whole operation, so the
    /// decision never observes a half-committed transaction.
    pub fn truncate(&self, min_ts: i64) -> Result<()> {
        let mut wal = self.inner.wal.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        debug!(min_ts, "truncating WAL");

        let stale = self.inner.series.gc(min_ts);
        if !stale.is_empty() {
            for ref_id in &stale {
                wal.append(&Record::Tombstone(*ref_id))?;
            }
            wal.sync()?;
            debug!(removed = stale.len(), "dropped series with no retained data");
        }

        let Some((_, last)) = Wal::segment_range(&self.inner.wal_dir)? else {
            return Ok(());
        };
        // Rotate so the old tail is closed and coverable by the checkpoint.
        wal.next_segment_sync()?;

        let series = &self.inner.series;
        checkpoint::create_checkpoint(
            &self.inner.wal_dir,
            last,
            &|ref_id| series.contains(ref_id),
            min_ts,
        )?;
        wal.delete_segments_through(last)?;
        checkpoint::delete_old_checkpoints(&self.inner.wal_dir, last)?;
        Ok(())
    }

    /// Writes one staleness marker per series that has stopped reporting.
    ///
    /// Every series whose `last_ts` is at or below the cutoff receives a
    /// synthetic sample at that timestamp carrying the stale sentinel
    /// value, committed in a single transaction. Intended to run once at
    /// graceful shutdown.
    pub fn write_staleness_markers(&self, cutoff: impl Fn() -> i64) -> Result<()> {
        let cutoff_ts = cutoff();
        let mut app = self.appender();
        for entry in self.inner.series.entries() {
            if entry.last_ts <= cutoff_ts {
                app.append(entry.ref_id, &entry.labels, entry.last_ts, stale_nan())?;
            }
        }
        app.commit()
    }

    /// Closes the engine: stops background notification and releases the
    /// log directory. Idempotent; every later operation fails fast with
    /// [`WalError::WalClosed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the sender ends the notify thread once it has drained
        // signals already queued by committed transactions.
        let tx = self
            .inner
            .notify_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);
        let handle = self
            .inner
            .notify_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let mut wal = self.inner.wal.lock().unwrap_or_else(|e| e.into_inner());
        wal.sync()?;
        Ok(())
    }

    /// Directory holding WAL segments and checkpoints.
    pub fn wal_dir(&self) -> &Path {
        &self.inner.wal_dir
    }

    /// Point-in-time snapshot of all live series entries.
    pub fn series_entries(&self) -> Vec<SeriesEntry> {
        self.inner.series.entries()
    }
}

/// Rebuilds the series registry from replayed records.
struct RegistryLoader<'a> {
    series: &'a SeriesRegistry,
}

impl ReplayVisitor for RegistryLoader<'_> {
    fn visit(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Series(s) => self.series.restore(s.ref_id, s.labels),
            Record::Sample(s) => self.series.update_timestamp(s.ref_id, s.ts),
            Record::Exemplar(e) => {
                self.series.update_timestamp(e.ref_id, e.ts);
                // The dedup cache restarts from the last replayed exemplar.
                self.series.set_last_exemplar(e.ref_id, e);
            }
            Record::Histogram(h) => self.series.update_timestamp(h.ref_id, h.ts),
            Record::FloatHistogram(h) => self.series.update_timestamp(h.ref_id, h.ts),
            Record::Tombstone(ref_id) => self.series.remove(ref_id),
        }
        Ok(())
    }
}

/// Per-transaction staging buffer.
///
/// Not for concurrent use by multiple callers; obtain one appender per
/// writer. Staged records become durable only on [`Appender::commit`].
pub struct Appender {
    inner: Arc<StorageInner>,
    pending_series: Vec<RefSeries>,
    pending_samples: Vec<RefSample>,
    pending_exemplars: Vec<RefExemplar>,
    pending_histograms: Vec<RefHistogram>,
    pending_float_histograms: Vec<RefFloatHistogram>,
}

impl Appender {
    /// Stages a sample.
    ///
    /// With `ref_id == 0`, the label set must be non-empty with unique
    /// names; the series is resolved or created and its registration
    /// staged if new. With a non-zero ref the sample is staged as given;
    /// the caller is responsible for having obtained the ref earlier.
    /// Timestamps lower than the series' committed maximum are accepted;
    /// ordering enforcement is a downstream concern.
    pub fn append(
        &mut self,
        ref_id: SeriesRef,
        labels: &Labels,
        ts: i64,
        value: f64,
    ) -> Result<SeriesRef> {
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        let ref_id = if ref_id == 0 {
            self.resolve_series(labels)?
        } else {
            ref_id
        };
        self.pending_samples.push(RefSample { ref_id, ts, value });
        Ok(ref_id)
    }

    /// Stages an exemplar.
    ///
    /// The ref must already be registered. An exemplar field-for-field
    /// equal to the last staged-or-committed exemplar of the same ref is
    /// silently dropped; only immediate repetition is suppressed.
    pub fn append_exemplar(&mut self, ref_id: SeriesRef, exemplar: Exemplar) -> Result<SeriesRef> {
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        if ref_id == 0 || !self.inner.series.contains(ref_id) {
            return Err(WalError::UnknownSeriesRef(ref_id));
        }
        let len = exemplar.labels.byte_len();
        if len > EXEMPLAR_MAX_LABEL_LEN {
            return Err(WalError::ExemplarLabelTooLong {
                len,
                max: EXEMPLAR_MAX_LABEL_LEN,
            });
        }
        if exemplar.labels.has_duplicate_names() {
            return Err(WalError::InvalidExemplar(
                "duplicate label names".to_string(),
            ));
        }

        let record = RefExemplar {
            ref_id,
            ts: exemplar.ts,
            value: exemplar.value,
            has_ts: exemplar.has_ts,
            labels: exemplar.labels,
        };
        if self
            .inner
            .series
            .last_exemplar(ref_id)
            .is_some_and(|last| last == record)
        {
            return Ok(ref_id);
        }
        self.inner.series.set_last_exemplar(ref_id, record.clone());
        self.pending_exemplars.push(record);
        Ok(ref_id)
    }

    /// Stages a histogram observation. Ref resolution follows
    /// [`Appender::append`].
    pub fn append_histogram(
        &mut self,
        ref_id: SeriesRef,
        labels: &Labels,
        ts: i64,
        histogram: Histogram,
    ) -> Result<SeriesRef> {
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        let ref_id = if ref_id == 0 {
            self.resolve_series(labels)?
        } else {
            ref_id
        };
        self.pending_histograms.push(RefHistogram {
            ref_id,
            ts,
            histogram,
        });
        Ok(ref_id)
    }

    /// Stages a float histogram observation. Ref resolution follows
    /// [`Appender::append`].
    pub fn append_float_histogram(
        &mut self,
        ref_id: SeriesRef,
        labels: &Labels,
        ts: i64,
        histogram: FloatHistogram,
    ) -> Result<SeriesRef> {
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        let ref_id = if ref_id == 0 {
            self.resolve_series(labels)?
        } else {
            ref_id
        };
        self.pending_float_histograms.push(RefFloatHistogram {
            ref_id,
            ts,
            histogram,
        });
        Ok(ref_id)
    }

    /// Commits the transaction: staged records are flushed durably to the
    /// log in the order series, samples, exemplars, histograms, float
    /// histograms, after which registry timestamps are updated and the
    /// notifier is triggered. On error the transaction is not committed.
    pub fn commit(self) -> Result<()> {
        {
            let mut wal = self.inner.wal.lock().unwrap_or_else(|e| e.into_inner());
            if self.inner.is_closed() {
                return Err(WalError::WalClosed);
            }
            for series in &self.pending_series {
                wal.append(&Record::Series(series.clone()))?;
            }
            for sample in &self.pending_samples {
                wal.append(&Record::Sample(*sample))?;
            }
            for exemplar in &self.pending_exemplars {
                wal.append(&Record::Exemplar(exemplar.clone()))?;
            }
            for histogram in &self.pending_histograms {
                wal.append(&Record::Histogram(histogram.clone()))?;
            }
            for histogram in &self.pending_float_histograms {
                wal.append(&Record::FloatHistogram(histogram.clone()))?;
            }
            wal.sync()?;

            // Registry timestamps move while the commit serialization
            // point is still held: truncation locks the same point, so it
            // sees this transaction either completely or not at all.
            for sample in &self.pending_samples {
                self.inner.series.update_timestamp(sample.ref_id, sample.ts);
            }
            for exemplar in &self.pending_exemplars {
                self.inner
                    .series
                    .update_timestamp(exemplar.ref_id, exemplar.ts);
            }
            for histogram in &self.pending_histograms {
                self.inner
                    .series
                    .update_timestamp(histogram.ref_id, histogram.ts);
            }
            for histogram in &self.pending_float_histograms {
                self.inner
                    .series
                    .update_timestamp(histogram.ref_id, histogram.ts);
            }
        }

        self.inner.send_notify();
        Ok(())
    }

    /// Abandons the transaction.
    ///
    /// Staged series registrations are still flushed so newly allocated
    /// refs remain replayable and are never reused; staged data records
    /// are discarded unwritten.
    pub fn rollback(self) -> Result<()> {
        let mut wal = self.inner.wal.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.is_closed() {
            return Err(WalError::WalClosed);
        }
        for series in &self.pending_series {
            wal.append(&Record::Series(series.clone()))?;
        }
        wal.sync()?;
        Ok(())
    }

    fn resolve_series(&mut self, labels: &Labels) -> Result<SeriesRef> {
        if labels.is_empty() {
            return Err(WalError::InvalidLabels("empty label set".to_string()));
        }
        if labels.has_duplicate_names() {
            return Err(WalError::InvalidLabels(
                "duplicate label names".to_string(),
            ));
        }
        let (ref_id, created) = self.inner.series.get_or_create(labels);
        if created {
            self.pending_series.push(RefSeries {
                ref_id,
                labels: labels.clone(),
            });
        }
        Ok(ref_id)
    }
}
