// SPDX-License-Identifier: AGPL-3.0-only

//! Rolling record sink: a date-templated file family with indexed
//! rollover, optional gzip encoding, and a background flush. Records
//! are written with a fixed separator so a reader can split them back
//! apart without any protocol knowledge.
//!
//! The active file name is re-selected once a second; the writer
//! swaps files whenever the selected name differs from the open one,
//! which is how both date-component changes and threshold rollovers
//! take effect.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Local, Timelike};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, warn};

/// Byte sequence appended after every record.
pub const PAYLOAD_SEPARATOR: &[u8] = b"\n\x1e\n";

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("cannot open spool file {name}: {source}")]
    Open { name: String, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct RollingConfig {
    /// Cadence of the background flush; zero disables it.
    pub flush_interval: Duration,
    /// Roll to the next index past this many bytes (0 = no limit).
    pub size_limit: u64,
    /// Roll to the next index after this many records (0 = no limit).
    pub queue_limit: usize,
    /// Write to the expanded template name directly and never roll.
    pub append: bool,
}

impl Default for RollingConfig {
    fn default() -> Self {
        RollingConfig {
            flush_interval: Duration::from_secs(1),
            size_limit: 0,
            queue_limit: 0,
            append: false,
        }
    }
}

enum RecordWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<File>),
}

impl RecordWriter {
    fn create(name: &str) -> Result<RecordWriter, SpoolError> {
        let file = open_spool_file(name).map_err(|source| SpoolError::Open {
            name: name.to_string(),
            source,
        })?;
        Ok(if name.ends_with(".gz") {
            RecordWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            RecordWriter::Plain(BufWriter::new(file))
        })
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            RecordWriter::Plain(w) => w.write_all(data),
            RecordWriter::Gzip(w) => w.write_all(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RecordWriter::Plain(w) => w.flush(),
            RecordWriter::Gzip(w) => w.flush(),
        }
    }

    /// Flush and, for gzip, write the stream trailer. The file itself
    /// closes on drop.
    fn finish(self) -> io::Result<()> {
        match self {
            RecordWriter::Plain(mut w) => w.flush(),
            RecordWriter::Gzip(w) => w.finish().map(drop),
        }
    }
}

fn open_spool_file(name: &str) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o660);
    }
    opts.open(name)
}

struct OpenFile {
    name: String,
    writer: RecordWriter,
}

#[derive(Default)]
struct SinkState {
    current_name: String,
    open: Option<OpenFile>,
    queue_length: usize,
    chunk_size: u64,
}

struct Shared {
    template: String,
    config: RollingConfig,
    state: Mutex<SinkState>,
}

impl Shared {
    /// Re-run name selection against the current wall clock and
    /// thresholds. The writer picks the change up on its next write.
    fn refresh_name(&self) {
        let expanded = expand_template(&self.template);
        let mut state = self.state.lock().expect("sink state poisoned");
        if self.config.append {
            state.current_name = expanded;
            return;
        }
        let full = (self.config.queue_limit > 0 && state.queue_length >= self.config.queue_limit)
            || (self.config.size_limit > 0 && state.chunk_size >= self.config.size_limit);
        let next_chunk = state.current_name.is_empty() || full;
        state.current_name = next_file_name(&expanded, next_chunk);
    }

    fn write(&self, data: &[u8]) -> Result<usize, SpoolError> {
        let mut state = self.state.lock().expect("sink state poisoned");
        let state = &mut *state;

        let swap = state
            .open
            .as_ref()
            .is_none_or(|f| f.name != state.current_name);
        if swap {
            if let Some(previous) = state.open.take() {
                previous.writer.finish()?;
            }
            let name = state.current_name.clone();
            let writer = RecordWriter::create(&name)?;
            debug!(file = %name, "opened spool file");
            state.open = Some(OpenFile { name, writer });
            state.queue_length = 0;
            state.chunk_size = 0;
        }
        if let Some(open) = state.open.as_mut() {
            open.writer.write_all(data)?;
            open.writer.write_all(PAYLOAD_SEPARATOR)?;
            state.queue_length += 1;
        }
        Ok(data.len())
    }

    /// Push buffered bytes to disk and sample the file size, so the
    /// rollover decision sees a current byte count. A failed stat
    /// skips the sample for this cycle.
    fn flush(&self) {
        let mut state = self.state.lock().expect("sink state poisoned");
        let state = &mut *state;
        if let Some(open) = state.open.as_mut() {
            if let Err(err) = open.writer.flush() {
                warn!(%err, file = %open.name, "spool flush failed");
                return;
            }
            if let Ok(meta) = fs::metadata(&open.name) {
                state.chunk_size = meta.len();
            }
        }
    }

    fn close(&self) -> Result<(), SpoolError> {
        let mut state = self.state.lock().expect("sink state poisoned");
        match state.open.take() {
            Some(open) => Ok(open.writer.finish()?),
            None => Ok(()),
        }
    }
}

/// Record sink writing a family of indexed files derived from a
/// date template. Call [`RollingWriter::close`] to stop the timers
/// and flush the tail of the stream.
pub struct RollingWriter {
    shared: Arc<Shared>,
    // Dropping the sender disconnects both timer loops.
    stop: Option<Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RollingWriter {
    pub fn new(template: impl Into<String>, config: RollingConfig) -> Self {
        let flush_interval = config.flush_interval;
        let shared = Arc::new(Shared {
            template: template.into(),
            config,
            state: Mutex::new(SinkState::default()),
        });
        shared.refresh_name();

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut tasks = Vec::new();
        if !flush_interval.is_zero() {
            tasks.push(spawn_timer(
                Arc::clone(&shared),
                flush_interval,
                stop_rx.clone(),
                Shared::flush,
            ));
        }
        tasks.push(spawn_timer(
            Arc::clone(&shared),
            Duration::from_secs(1),
            stop_rx,
            Shared::refresh_name,
        ));

        RollingWriter {
            shared,
            stop: Some(stop_tx),
            tasks,
        }
    }

    /// Append one record plus the payload separator. Returns the
    /// record length on success.
    pub fn write(&self, data: &[u8]) -> Result<usize, SpoolError> {
        self.shared.write(data)
    }

    /// Stop the background timers, flush, and close the current file.
    pub fn close(mut self) -> Result<(), SpoolError> {
        self.stop.take();
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
        self.shared.close()
    }
}

fn spawn_timer(
    shared: Arc<Shared>,
    period: Duration,
    stop: Receiver<()>,
    run: fn(&Shared),
) -> JoinHandle<()> {
    thread::spawn(move || {
        let ticker = tick(period);
        loop {
            select! {
                recv(ticker) -> _ => run(&shared),
                recv(stop) -> _ => break,
            }
        }
    })
}

/// Expand `%Y %m %d %H %M %S %NS` against the local wall clock.
/// `%NS` goes first so its trailing `S` is not consumed by the plain
/// second token.
fn expand_template(template: &str) -> String {
    let now = Local::now();
    let mut path = template.replace("%NS", &now.nanosecond().to_string());
    for token in ["%Y", "%m", "%d", "%H", "%M", "%S"] {
        if path.contains(token) {
            path = path.replace(token, &now.format(token).to_string());
        }
    }
    path
}

/// Pick the file the next record should land in: the highest-indexed
/// member of the template's family, advanced by one when the current
/// file is full or there is none yet.
fn next_file_name(path: &str, next_chunk: bool) -> String {
    let (stem, ext) = split_ext(path);
    let pattern = format!("{stem}*{ext}");
    let mut matches: Vec<String> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    if matches.is_empty() {
        return with_index(path, 0);
    }
    matches.sort_by(|a, b| match without_index(a).cmp(without_index(b)) {
        Ordering::Equal => file_index(a).cmp(&file_index(b)),
        other => other,
    });
    let Some(last) = matches.last() else {
        return with_index(path, 0);
    };
    let mut index = 0;
    if let Some(found) = file_index(last) {
        index = found;
        if next_chunk {
            index += 1;
        }
    }
    with_index(last, index)
}

/// Trailing `_N` index of a file name, ignoring the extension.
fn file_index(name: &str) -> Option<u64> {
    let (stem, _) = split_ext(name);
    stem.rfind('_').and_then(|i| stem[i + 1..].parse().ok())
}

/// Replace (or attach) the trailing `_N` index of a file name.
fn with_index(name: &str, index: u64) -> String {
    let (stem, ext) = split_ext(name);
    let stem = match stem.rfind('_') {
        Some(i) if stem[i + 1..].parse::<u64>().is_ok() => &stem[..i],
        _ => stem,
    };
    format!("{stem}_{index}{ext}")
}

fn without_index(name: &str) -> &str {
    name.rfind('_').map_or(name, |i| &name[..i])
}

/// Split off the extension of the final path element, dot included.
fn split_ext(path: &str) -> (&str, &str) {
    let file_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[file_start..].rfind('.') {
        Some(i) => path.split_at(file_start + i),
        None => (path, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use flate2::read::MultiGzDecoder;
    use tempfile::tempdir;

    #[test]
    fn template_expansion_fills_date_components() {
        let name = expand_template("spool_%Y-%m-%d.log");
        assert!(!name.contains('%'));
        let year = Local::now().format("%Y").to_string();
        assert!(name.starts_with(&format!("spool_{year}-")));
    }

    #[test]
    fn template_nanosecond_token_is_not_mangled() {
        let name = expand_template("x_%NS.log");
        assert!(!name.contains("%NS"));
        assert!(!name.contains('%'), "plain %S must not eat the NS token");
    }

    #[test]
    fn index_helpers_round_trip() {
        assert_eq!(file_index("spool_3.log"), Some(3));
        assert_eq!(file_index("spool.log"), None);
        assert_eq!(file_index("spool_x.log"), None);
        assert_eq!(with_index("spool.log", 0), "spool_0.log");
        assert_eq!(with_index("spool_4.log", 5), "spool_5.log");
        assert_eq!(with_index("spool_a.log", 1), "spool_a_1.log");
        assert_eq!(without_index("spool_7.log"), "spool");
        assert_eq!(split_ext("a/b/spool.log"), ("a/b/spool", ".log"));
        assert_eq!(split_ext("a.b/spool"), ("a.b/spool", ""));
    }

    #[test]
    fn family_members_sort_numerically_not_lexically() {
        let mut names = vec![
            "spool_10.log".to_string(),
            "spool_2.log".to_string(),
            "spool_9.log".to_string(),
        ];
        names.sort_by(|a, b| match without_index(a).cmp(without_index(b)) {
            Ordering::Equal => file_index(a).cmp(&file_index(b)),
            other => other,
        });
        assert_eq!(names, ["spool_2.log", "spool_9.log", "spool_10.log"]);
    }

    #[test]
    fn queue_limit_rolls_to_the_next_index() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool_%Y.log");
        let template = template.to_str().expect("utf-8 path");
        let writer = RollingWriter::new(
            template,
            RollingConfig {
                queue_limit: 2,
                flush_interval: Duration::ZERO,
                ..RollingConfig::default()
            },
        );

        writer.write(b"one").expect("write one");
        writer.write(b"two").expect("write two");
        writer.shared.refresh_name();
        writer.write(b"three").expect("write three");
        writer.close().expect("close");

        let year = Local::now().format("%Y").to_string();
        let first = dir.path().join(format!("spool_{year}_0.log"));
        let second = dir.path().join(format!("spool_{year}_1.log"));

        let mut expected = Vec::new();
        expected.extend_from_slice(b"one");
        expected.extend_from_slice(PAYLOAD_SEPARATOR);
        expected.extend_from_slice(b"two");
        expected.extend_from_slice(PAYLOAD_SEPARATOR);
        assert_eq!(fs::read(first).expect("first file"), expected);

        let mut tail = Vec::new();
        tail.extend_from_slice(b"three");
        tail.extend_from_slice(PAYLOAD_SEPARATOR);
        assert_eq!(fs::read(second).expect("second file"), tail);
    }

    #[test]
    fn indices_keep_increasing_across_writers() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool.log");
        let template = template.to_str().expect("utf-8 path");

        for expected in ["spool_0.log", "spool_1.log", "spool_2.log"] {
            let writer = RollingWriter::new(
                template,
                RollingConfig {
                    queue_limit: 1,
                    flush_interval: Duration::ZERO,
                    ..RollingConfig::default()
                },
            );
            writer.write(b"r").expect("write");
            writer.close().expect("close");
            assert!(
                dir.path().join(expected).exists(),
                "missing {expected} after a fresh writer"
            );
        }
    }

    #[test]
    fn below_threshold_the_current_file_is_reused() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool.log");
        let template = template.to_str().expect("utf-8 path");
        let writer = RollingWriter::new(
            template,
            RollingConfig {
                queue_limit: 10,
                flush_interval: Duration::ZERO,
                ..RollingConfig::default()
            },
        );

        writer.write(b"a").expect("write");
        writer.shared.refresh_name();
        writer.write(b"b").expect("write");
        writer.close().expect("close");

        assert!(dir.path().join("spool_0.log").exists());
        assert!(!dir.path().join("spool_1.log").exists());
    }

    #[test]
    fn append_mode_writes_the_template_name_verbatim() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool.log");
        let template = template.to_str().expect("utf-8 path");
        let writer = RollingWriter::new(
            template,
            RollingConfig {
                append: true,
                queue_limit: 1,
                flush_interval: Duration::ZERO,
                ..RollingConfig::default()
            },
        );
        writer.write(b"a").expect("write");
        writer.shared.refresh_name();
        writer.write(b"b").expect("write");
        writer.close().expect("close");

        assert!(dir.path().join("spool.log").exists());
        assert!(!dir.path().join("spool_0.log").exists());
    }

    #[test]
    fn gzip_family_round_trips_through_a_decoder() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool.gz");
        let template = template.to_str().expect("utf-8 path");
        let writer = RollingWriter::new(
            template,
            RollingConfig {
                flush_interval: Duration::ZERO,
                ..RollingConfig::default()
            },
        );
        writer.write(b"compressed record").expect("write");
        writer.close().expect("close");

        let file = File::open(dir.path().join("spool_0.gz")).expect("gz file");
        let mut decoded = Vec::new();
        MultiGzDecoder::new(file)
            .read_to_end(&mut decoded)
            .expect("gunzip");

        let mut expected = Vec::new();
        expected.extend_from_slice(b"compressed record");
        expected.extend_from_slice(PAYLOAD_SEPARATOR);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn flush_samples_the_file_size() {
        let dir = tempdir().expect("tempdir");
        let template = dir.path().join("spool.log");
        let template = template.to_str().expect("utf-8 path");
        let writer = RollingWriter::new(
            template,
            RollingConfig {
                flush_interval: Duration::ZERO,
                ..RollingConfig::default()
            },
        );
        writer.write(b"0123456789").expect("write");
        writer.shared.flush();
        let sampled = writer
            .shared
            .state
            .lock()
            .expect("sink state poisoned")
            .chunk_size;
        assert_eq!(sampled, 10 + PAYLOAD_SEPARATOR.len() as u64);
        writer.close().expect("close");
    }
}
