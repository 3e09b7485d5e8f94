//! Reference-counted log sinks shared between workers.
//!
//! Every worker logs to a file named by the controller. Several workers may
//! share the same destination, so sinks are kept in a process-wide
//! [`LogRegistry`] keyed by `(logger name, file path)`. Each key maps to one
//! open file handle and a reference count.
//!
//! [`LogRegistry::acquire`] and the [`Drop`] of the returned [`LogGuard`] are
//! the only two operations that mutate the registry. The file is flushed and
//! closed when the count for its key reaches zero, so a guard held for the
//! lifetime of a worker thread releases its sink on every exit path, panics
//! included.
//!
//! ```no_run
//! use courier::logging::LogRegistry;
//! use tracing::Level;
//!
//! let guard = LogRegistry::global().acquire("readings", "/var/log/courier.log").unwrap();
//! tracing::subscriber::with_default(guard.subscriber(Level::INFO), || {
//!     tracing::info!("written to /var/log/courier.log");
//! });
//! ```
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter, EnvFilter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SinkKey {
    name: String,
    path: PathBuf,
}

struct SinkEntry {
    sink: LogSink,
    refs: usize,
}

/// A shared handle to an open log file.
///
/// Implements [`MakeWriter`] so it can back a [`tracing_subscriber::fmt`]
/// subscriber directly.
#[derive(Clone)]
pub struct LogSink {
    file: Arc<Mutex<File>>,
}

impl LogSink {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn flush(&self) {
        let _ = lock(&self.file).flush();
    }
}

/// A writer for a single formatted log record.
pub struct SinkWriter {
    file: Arc<Mutex<File>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.file).write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        lock(&self.file).write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.file).flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            file: self.file.clone(),
        }
    }
}

/// Process-wide mapping from `(name, path)` to an open, counted sink.
///
/// Cloning a registry yields another handle to the same table.
#[derive(Clone, Default)]
pub struct LogRegistry {
    entries: Arc<Mutex<HashMap<SinkKey, SinkEntry>>>,
}

static GLOBAL: OnceLock<LogRegistry> = OnceLock::new();

impl LogRegistry {
    /// A registry private to the caller. Mostly useful in tests; workers use
    /// [`LogRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every controller in the process.
    pub fn global() -> Self {
        GLOBAL.get_or_init(LogRegistry::new).clone()
    }

    /// Take a reference on the sink for `(name, path)`, opening the file if
    /// this is the first reference.
    pub fn acquire(&self, name: &str, path: impl AsRef<Path>) -> io::Result<LogGuard> {
        let key = SinkKey {
            name: name.to_string(),
            path: path.as_ref().to_path_buf(),
        };

        let mut entries = lock(&self.entries);
        let sink = match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                entry.sink.clone()
            }
            None => {
                let sink = LogSink::open(&key.path)?;
                entries.insert(
                    key.clone(),
                    SinkEntry {
                        sink: sink.clone(),
                        refs: 1,
                    },
                );
                sink
            }
        };

        Ok(LogGuard {
            registry: self.clone(),
            key,
            sink,
        })
    }

    fn release(&self, key: &SinkKey) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(key) else {
            return;
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = entries.remove(key) {
                entry.sink.flush();
            }
        }
    }

    /// Number of live guards for `(name, path)`; zero once the file is closed.
    pub fn ref_count(&self, name: &str, path: impl AsRef<Path>) -> usize {
        let key = SinkKey {
            name: name.to_string(),
            path: path.as_ref().to_path_buf(),
        };
        lock(&self.entries).get(&key).map_or(0, |entry| entry.refs)
    }
}

/// A counted reference to a [`LogSink`]. Releases the reference on drop.
pub struct LogGuard {
    registry: LogRegistry,
    key: SinkKey,
    sink: LogSink,
}

impl LogGuard {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn path(&self) -> &Path {
        &self.key.path
    }

    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    /// A plain-text subscriber writing to this sink at `level` and above.
    pub fn subscriber(&self, level: Level) -> impl tracing::Subscriber + Send + Sync + 'static {
        let filter = EnvFilter::default().add_directive(LevelFilter::from_level(level).into());
        tracing_subscriber::fmt()
            .with_writer(self.sink())
            .with_ansi(false)
            .with_thread_names(true)
            .with_env_filter(filter)
            .finish()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tracing::{debug, info};

    use super::*;

    #[test]
    fn shared_destinations_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        let registry = LogRegistry::new();

        let first = registry.acquire("readings", &path).unwrap();
        let second = registry.acquire("readings", &path).unwrap();
        assert_eq!(registry.ref_count("readings", &path), 2);

        drop(first);
        assert_eq!(registry.ref_count("readings", &path), 1);

        // The surviving guard still writes to an open file.
        tracing::subscriber::with_default(second.subscriber(Level::INFO), || {
            info!("still open");
        });
        drop(second);
        assert_eq!(registry.ref_count("readings", &path), 0);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("still open"));
    }

    #[test]
    fn names_and_paths_are_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let other = dir.path().join("b.log");
        let registry = LogRegistry::new();

        let _a = registry.acquire("readings", &path).unwrap();
        let _b = registry.acquire("alerts", &path).unwrap();
        let _c = registry.acquire("readings", &other).unwrap();

        assert_eq!(registry.ref_count("readings", &path), 1);
        assert_eq!(registry.ref_count("alerts", &path), 1);
        assert_eq!(registry.ref_count("readings", &other), 1);
    }

    #[test]
    fn subscriber_respects_the_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("level.log");
        let registry = LogRegistry::new();
        let guard = registry.acquire("readings", &path).unwrap();

        tracing::subscriber::with_default(guard.subscriber(Level::INFO), || {
            debug!("too verbose");
            info!("kept");
        });
        drop(guard);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("kept"));
        assert!(!contents.contains("too verbose"));
    }

    #[test]
    fn unopenable_paths_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LogRegistry::new();
        let missing_parent = dir.path().join("missing").join("x.log");
        assert!(registry.acquire("readings", &missing_parent).is_err());
        assert_eq!(registry.ref_count("readings", &missing_parent), 0);
    }
}
