//! Behavioral tests for the storage engine: appender transactions, replay,
//! truncation, restart durability, and staleness marking.

use corsac::record::{RefExemplar, RefSample, RefSeries};
use corsac::{
    is_stale_nan, Exemplar, FloatHistogram, Histogram, Labels, Notifier, Record, ReplayVisitor,
    Result, SeriesRef, Storage, Wal, WalError,
};
use std::sync::mpsc;
use std::time::Duration;
use tempfile::TempDir;

/// Collects replayed records by kind, in on-disk order.
#[derive(Default)]
struct WalDataCollector {
    series: Vec<RefSeries>,
    samples: Vec<RefSample>,
    exemplars: Vec<RefExemplar>,
    histograms: usize,
    float_histograms: usize,
}

impl ReplayVisitor for WalDataCollector {
    fn visit(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Series(s) => self.series.push(s),
            Record::Sample(s) => self.samples.push(s),
            Record::Exemplar(e) => self.exemplars.push(e),
            Record::Histogram(_) => self.histograms += 1,
            Record::FloatHistogram(_) => self.float_histograms += 1,
            Record::Tombstone(_) => {}
        }
        Ok(())
    }
}

fn replay_collect(storage: &Storage) -> WalDataCollector {
    let mut collector = WalDataCollector::default();
    Wal::replay(storage.wal_dir(), &mut collector).unwrap();
    collector
}

fn name_labels(name: &str) -> Labels {
    Labels::from_pairs([("__name__", name)])
}

/// Test payload: per series, two samples and two exemplars at staggered
/// timestamps keyed off the series' position.
struct TestSeries {
    name: &'static str,
    samples: Vec<(i64, f64)>,
    exemplars: Vec<Exemplar>,
    ref_id: SeriesRef,
}

fn build_series(names: &[&'static str]) -> Vec<TestSeries> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let i = (i + 1) as i64;
            TestSeries {
                name,
                samples: vec![(i, i as f64 * 10.0), (i * 10, i as f64 * 100.0)],
                exemplars: vec![
                    Exemplar {
                        labels: Labels::from_pairs([("foobar", "barfoo")]),
                        value: i as f64 * 10.0,
                        ts: i,
                        has_ts: true,
                    },
                    Exemplar {
                        labels: Labels::from_pairs([("lorem", "ipsum")]),
                        value: i as f64 * 100.0,
                        ts: i * 10,
                        has_ts: true,
                    },
                ],
                ref_id: 0,
            }
        })
        .collect()
}

fn write_series(app: &mut corsac::Appender, series: &mut TestSeries) {
    let labels = name_labels(series.name);

    let mut samples = series.samples.iter();
    if series.ref_id == 0 {
        let (ts, value) = samples.next().unwrap();
        series.ref_id = app.append(0, &labels, *ts, *value).unwrap();
    }
    for (ts, value) in samples {
        app.append(series.ref_id, &labels, *ts, *value).unwrap();
    }
    for exemplar in &series.exemplars {
        app.append_exemplar(series.ref_id, exemplar.clone()).unwrap();
    }
}

fn expected_samples(series: &[TestSeries]) -> Vec<(SeriesRef, i64, f64)> {
    let mut expected: Vec<(SeriesRef, i64, f64)> = series
        .iter()
        .flat_map(|s| s.samples.iter().map(|(ts, v)| (s.ref_id, *ts, *v)))
        .collect();
    expected.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    expected
}

struct ChannelNotifier(mpsc::Sender<()>);

impl Notifier for ChannelNotifier {
    fn notify(&self) {
        let _ = self.0.send(());
    }
}

#[test]
fn test_invalid_series() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();

    // Samples.
    let err = app.append(0, &Labels::default(), 0, 0.0).unwrap_err();
    assert!(matches!(err, WalError::InvalidLabels(_)), "empty labels: {err}");

    let dup = Labels::from_pairs([("a", "1"), ("a", "2")]);
    let err = app.append(0, &dup, 0, 0.0).unwrap_err();
    assert!(matches!(err, WalError::InvalidLabels(_)), "dup labels: {err}");

    // Sanity check: valid series.
    let s_ref = app.append(0, &Labels::from_pairs([("a", "1")]), 0, 0.0).unwrap();

    // Exemplars.
    let exemplar = Exemplar {
        labels: Labels::default(),
        value: 0.0,
        ts: 0,
        has_ts: false,
    };
    let err = app.append_exemplar(0, exemplar.clone()).unwrap_err();
    assert!(matches!(err, WalError::UnknownSeriesRef(0)), "ref 0: {err}");

    let err = app.append_exemplar(s_ref + 100, exemplar).unwrap_err();
    assert!(matches!(err, WalError::UnknownSeriesRef(_)), "unregistered ref: {err}");

    let dup_exemplar = Exemplar {
        labels: Labels::from_pairs([("a", "1"), ("a", "2")]),
        value: 0.0,
        ts: 0,
        has_ts: false,
    };
    let err = app.append_exemplar(s_ref, dup_exemplar).unwrap_err();
    assert!(matches!(err, WalError::InvalidExemplar(_)), "dup exemplar labels: {err}");

    let long_exemplar = Exemplar {
        labels: Labels::from_pairs([("a_somewhat_long_trace_id", "x".repeat(105))]),
        value: 0.0,
        ts: 0,
        has_ts: false,
    };
    let err = app.append_exemplar(s_ref, long_exemplar).unwrap_err();
    assert!(
        matches!(err, WalError::ExemplarLabelTooLong { .. }),
        "too long exemplar labels: {err}"
    );

    // Sanity check: valid exemplars.
    let valid = Exemplar {
        labels: Labels::from_pairs([("a", "1")]),
        value: 20.0,
        ts: 10,
        has_ts: true,
    };
    app.append_exemplar(s_ref, valid).unwrap();

    app.commit().unwrap();
    storage.close().unwrap();
}

#[test]
fn test_commit_replay_and_notify() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();

    let (tx, rx) = mpsc::channel();
    storage.set_notifier(ChannelNotifier(tx));

    let mut payload = build_series(&["foo", "bar", "baz"]);
    let mut app = storage.appender();
    for series in &mut payload {
        write_series(&mut app, series);
    }
    app.commit().unwrap();

    let collector = replay_collect(&storage);

    let names: Vec<&str> = collector
        .series
        .iter()
        .map(|s| s.labels.get("__name__").unwrap())
        .collect();
    assert_eq!(names, vec!["foo", "bar", "baz"]);

    let mut actual: Vec<(SeriesRef, i64, f64)> = collector
        .samples
        .iter()
        .map(|s| (s.ref_id, s.ts, s.value))
        .collect();
    actual.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    assert_eq!(actual, expected_samples(&payload));

    assert_eq!(collector.exemplars.len(), 6);

    rx.recv_timeout(Duration::from_secs(60))
        .expect("expected notify to be called after commit");

    storage.close().unwrap();
}

#[test]
fn test_rollback_writes_series_only() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();

    let mut payload = build_series(&["foo", "bar", "baz", "blerg"]);
    let mut app = storage.appender();
    for series in &mut payload {
        write_series(&mut app, series);
    }
    app.rollback().unwrap();

    let collector = replay_collect(&storage);
    assert_eq!(collector.series.len(), 4, "series records should be written on rollback");
    assert_eq!(collector.samples.len(), 0, "samples should not be written on rollback");
    assert_eq!(collector.exemplars.len(), 0, "exemplars should not be written on rollback");
    assert_eq!(collector.histograms, 0, "histograms should not be written on rollback");
    assert_eq!(
        collector.float_histograms, 0,
        "float histograms should not be written on rollback"
    );

    storage.close().unwrap();
}

#[test]
fn test_duplicate_exemplars_ignored() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();

    let s_ref = app.append(0, &Labels::from_pairs([("a", "1")]), 0, 0.0).unwrap();

    // If the labels, value or timestamp differ from the last exemplar a new
    // record is appended; otherwise the call is skipped.
    let mut e = Exemplar {
        labels: Labels::from_pairs([("a", "1")]),
        value: 20.0,
        ts: 10,
        has_ts: true,
    };
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();

    e.labels = Labels::from_pairs([("b", "2")]);
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();

    e.value = 42.0;
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();

    e.ts = 25;
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();

    e.ts = 24;
    app.append_exemplar(s_ref, e.clone()).unwrap();
    app.append_exemplar(s_ref, e.clone()).unwrap();

    app.commit().unwrap();

    // 11 calls, of which only 4 differ from their predecessor.
    let collector = replay_collect(&storage);
    assert_eq!(collector.exemplars.len(), 4);

    storage.close().unwrap();
}

#[test]
fn test_existing_wal_replayed_on_reopen() {
    let dir = TempDir::new().unwrap();
    let mut payload = build_series(&["foo", "bar", "baz", "blerg"]);

    {
        let storage = Storage::open(dir.path()).unwrap();
        let mut app = storage.appender();
        let half = payload.len() / 2;
        for series in &mut payload[..half] {
            write_series(&mut app, series);
        }
        app.commit().unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::open(dir.path()).unwrap();

    // The replayed series carry their committed timestamps.
    let entries = storage.series_entries();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert!(entry.last_ts > 0, "series timestamp not updated on replay");
    }

    let mut app = storage.appender();
    let half = payload.len() / 2;
    for series in &mut payload[half..] {
        write_series(&mut app, series);
    }
    app.commit().unwrap();

    let collector = replay_collect(&storage);
    let names: Vec<&str> = collector
        .series
        .iter()
        .map(|s| s.labels.get("__name__").unwrap())
        .collect();
    assert_eq!(names, vec!["foo", "bar", "baz", "blerg"]);

    let mut actual: Vec<(SeriesRef, i64, f64)> = collector
        .samples
        .iter()
        .map(|s| (s.ref_id, s.ts, s.value))
        .collect();
    actual.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    assert_eq!(actual, expected_samples(&payload));

    storage.close().unwrap();
}

#[test]
fn test_refs_continue_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let storage = Storage::open(dir.path()).unwrap();
        let mut payload = build_series(&["foo", "bar", "baz", "blerg"]);
        let mut app = storage.appender();
        for series in &mut payload {
            write_series(&mut app, series);
        }
        app.commit().unwrap();

        // Truncating forces a checkpoint; refs must survive it.
        storage.truncate(0).unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();
    let ref_id = app.append(0, &name_labels("fresh"), 1, 1.0).unwrap();
    assert_eq!(ref_id, 5, "new ref must continue after the 4 replayed series");
    app.commit().unwrap();
    storage.close().unwrap();
}

#[test]
fn test_refs_never_reused_after_truncation_drops_all_series() {
    let dir = TempDir::new().unwrap();

    {
        let storage = Storage::open(dir.path()).unwrap();
        let mut app = storage.appender();
        app.append(0, &name_labels("a"), 10, 1.0).unwrap();
        app.append(0, &name_labels("b"), 20, 2.0).unwrap();
        app.commit().unwrap();

        // Everything is stale; both series are tombstoned away.
        storage.truncate(100).unwrap();
        assert!(storage.series_entries().is_empty());
        storage.close().unwrap();
    }

    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();
    let ref_id = app.append(0, &name_labels("c"), 30, 3.0).unwrap();
    assert_eq!(ref_id, 3, "refs of truncated series must stay retired");
    app.commit().unwrap();
    storage.close().unwrap();
}

#[test]
fn test_truncate_end_to_end() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();

    // foo: ts {1, 10}, bar: ts {2, 20}, baz: ts {3, 30}.
    let mut payload = build_series(&["foo", "bar", "baz"]);
    let mut app = storage.appender();
    for series in &mut payload {
        write_series(&mut app, series);
    }
    app.commit().unwrap();

    storage.truncate(21).unwrap();

    let collector = replay_collect(&storage);

    // foo (last ts 10) and bar (last ts 20) have no retained data; only baz
    // survives, with the samples at or above the boundary.
    let names: Vec<&str> = collector
        .series
        .iter()
        .map(|s| s.labels.get("__name__").unwrap())
        .collect();
    assert_eq!(names, vec!["baz"]);

    assert!(collector.samples.iter().all(|s| s.ts >= 21));
    let baz_ref = payload[2].ref_id;
    assert_eq!(collector.samples.len(), 1);
    assert_eq!(collector.samples[0].ref_id, baz_ref);
    assert_eq!(collector.samples[0].ts, 30);

    assert!(collector.exemplars.iter().all(|e| e.ts >= 21));

    // The dropped series are gone from the registry as well.
    let entries = storage.series_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ref_id, baz_ref);

    storage.close().unwrap();
}

#[test]
fn test_truncate_after_close() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    storage.close().unwrap();

    assert!(matches!(storage.truncate(0), Err(WalError::WalClosed)));
}

#[test]
fn test_corrupt_segment_still_opens() {
    let dir = TempDir::new().unwrap();

    // Write a corrupt segment where the engine expects WAL data.
    let wal_dir = dir.path().join("wal");
    std::fs::create_dir_all(&wal_dir).unwrap();
    std::fs::write(
        wal_dir.join("segment_0000000000000000.wal"),
        b"hello world",
    )
    .unwrap();

    // The storage should be initialized correctly anyway.
    let storage = Storage::open(dir.path()).unwrap();
    assert!(storage.series_entries().is_empty());

    // And it accepts new writes.
    let mut app = storage.appender();
    app.append(0, &name_labels("a"), 1, 1.0).unwrap();
    app.commit().unwrap();
    assert_eq!(replay_collect(&storage).samples.len(), 1);

    storage.close().unwrap();
}

#[test]
fn test_write_staleness_markers() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();

    let mut payload = build_series(&["foo", "bar", "baz"]);
    let mut app = storage.appender();
    for series in &mut payload {
        write_series(&mut app, series);
    }
    app.commit().unwrap();

    // Everything reads as already shipped, so every series gets a marker.
    storage.write_staleness_markers(|| i64::MAX).unwrap();

    let collector = replay_collect(&storage);
    assert_eq!(collector.samples.len(), payload.len() * 2 + payload.len());

    for series in &payload {
        let stale: Vec<&RefSample> = collector
            .samples
            .iter()
            .filter(|s| s.ref_id == series.ref_id && is_stale_nan(s.value))
            .collect();
        assert_eq!(stale.len(), 1, "ref {} wants exactly one stale marker", series.ref_id);
    }

    storage.close().unwrap();
}

#[test]
fn test_histograms_commit_and_replay() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();

    let labels = name_labels("request_duration");
    let histogram = Histogram {
        count: 12,
        sum: 34.5,
        bounds: vec![0.1, 1.0, f64::INFINITY],
        buckets: vec![3, 7, 12],
    };
    let ref_id = app.append_histogram(0, &labels, 5, histogram).unwrap();

    let float_histogram = FloatHistogram {
        count: 13.5,
        sum: 36.0,
        bounds: vec![0.1, 1.0],
        buckets: vec![3.5, 13.5],
    };
    app.append_float_histogram(ref_id, &labels, 6, float_histogram)
        .unwrap();
    app.commit().unwrap();

    let collector = replay_collect(&storage);
    assert_eq!(collector.series.len(), 1);
    assert_eq!(collector.histograms, 1);
    assert_eq!(collector.float_histograms, 1);

    // Histogram commits move the series timestamp like samples do.
    assert_eq!(storage.series_entries()[0].last_ts, 6);

    storage.close().unwrap();
}

#[test]
fn test_stable_refs_for_equal_label_sets() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let mut app = storage.appender();

    let l1 = name_labels("label1");
    let ref1 = app.append(0, &l1, 100, 0.1).unwrap();
    assert_eq!(ref1, 1);
    let ref2 = app.append(0, &l1, 101, 0.1).unwrap();
    assert_eq!(ref2, 1);

    let l2 = name_labels("label2");
    let ref3 = app.append(0, &l2, 102, 0.1).unwrap();
    assert_eq!(ref3, 2);

    app.commit().unwrap();
    storage.close().unwrap();
}

#[test]
fn test_out_of_order_samples_accepted() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();

    let mut payload = build_series(&["foo", "bar", "baz"]);
    let mut app = storage.appender();
    for series in &mut payload {
        write_series(&mut app, series);
    }
    app.commit().unwrap();

    // Same series, timestamps well before anything already committed. No
    // monotonicity check exists at this layer.
    let mut app = storage.appender();
    for series in &payload {
        let labels = name_labels(series.name);
        for (ts, value) in &series.samples {
            app.append(series.ref_id, &labels, ts - 10_000, *value).unwrap();
        }
    }
    app.commit().unwrap();

    storage.close().unwrap();
}
