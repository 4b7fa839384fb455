//! Leveled, per-component logging.
//!
//! Grounded in the teacher's `flux::logging` (built on `slog`), expanded to the full
//! level-resolution and destination story: console output splits debug/info to stdout and
//! warn/error to stderr, file output buffers in memory and only hits disk when `flush_all`
//! is called (driven by a scheduled task, see `corenet::scheduler`).
//!
//! The teacher reached for `sloggers` on top of `slog`, but only ever used it to build a
//! single undifferentiated drain from a hardcoded TOML snippet (and never logged through
//! it). Getting the per-level stdout/stderr split and the manual-flush file buffering this
//! spec requires means composing `slog::Drain` directly; `sloggers`'s builders hand back a
//! finished `Logger` rather than a `Drain`, so it doesn't compose for that. The dependency
//! is dropped here in favor of driving `slog` directly (see DESIGN.md).
use slog::{Drain, Key, OwnedKVList, Record, KV};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Stderr, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use slog::{crit, debug, error, info, o, trace, warn, Logger};

/// One of the five severities named in the spec, ordered least to most verbose.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum Level {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    fn parse(raw: &str) -> Option<Level> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "silent" => Some(Level::Silent),
            _ => None,
        }
    }

    fn rank_of(candidate: slog::Level) -> Level {
        match candidate {
            slog::Level::Critical | slog::Level::Error => Level::Error,
            slog::Level::Warning => Level::Warn,
            slog::Level::Info => Level::Info,
            slog::Level::Debug | slog::Level::Trace => Level::Debug,
        }
    }

    fn passes(self, candidate: slog::Level) -> bool {
        self != Level::Silent && Level::rank_of(candidate) <= self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Destination {
    Console,
    File,
}

impl Destination {
    fn parse(raw: &str) -> Option<Destination> {
        match raw.to_ascii_lowercase().as_str() {
            "console" => Some(Destination::Console),
            "file" => Some(Destination::File),
            _ => None,
        }
    }
}

/// Process-wide logging configuration, read once at bootstrap from the environment
/// variables named in spec §6.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub destination: Destination,
    pub dir: PathBuf,
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            destination: Destination::Console,
            dir: PathBuf::from("logs/"),
            default_level: Level::Warn,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> LogConfig {
        let mut cfg = LogConfig::default();

        if let Ok(raw) = env::var("LOG_DESTINATION") {
            if let Some(dest) = Destination::parse(&raw) {
                cfg.destination = dest;
            }
        }
        if let Ok(dir) = env::var("LOG_DIR") {
            cfg.dir = PathBuf::from(dir);
        }
        if let Ok(raw) = env::var("DEFAULT_LOG_LEVEL") {
            if let Some(level) = Level::parse(&raw) {
                cfg.default_level = level;
            }
        }

        cfg
    }
}

/// Resolution order from spec §4.8: `<COMPONENT>_LOG_LEVEL` env var, constructor-supplied
/// level, `DEFAULT_LOG_LEVEL`, then `warn`.
fn resolve_level(component: &str, ctor_level: Option<Level>, cfg: &LogConfig) -> Level {
    let env_key = format!("{}_LOG_LEVEL", component.to_ascii_uppercase());
    if let Ok(raw) = env::var(&env_key) {
        if let Some(level) = Level::parse(&raw) {
            return level;
        }
    }
    ctor_level.unwrap_or(cfg.default_level)
}

fn format_line(record: &Record, values: &OwnedKVList) -> String {
    let mut line = format!(
        "{} [{}] {}",
        record.level().as_short_str(),
        record.module(),
        record.msg()
    );

    struct LineSerializer<'a>(&'a mut String);
    impl<'a> slog::Serializer for LineSerializer<'a> {
        fn emit_arguments(&mut self, key: Key, val: &std::fmt::Arguments) -> slog::Result {
            use std::fmt::Write as _;
            let _ = write!(self.0, " {}={}", key, val);
            Ok(())
        }
    }

    let mut serializer = LineSerializer(&mut line);
    let _ = values.serialize(record, &mut serializer);
    let _ = record.kv().serialize(record, &mut serializer);
    line.push('\n');
    line
}

/// Splits console output the way spec §4.8 requires: debug/info to stdout, warn/error to
/// stderr. Writes synchronously, matching "console mode writes synchronously".
struct ConsoleDrain {
    level: Level,
    stdout: Mutex<Stdout>,
    stderr: Mutex<Stderr>,
}

impl ConsoleDrain {
    fn new(level: Level) -> ConsoleDrain {
        ConsoleDrain {
            level,
            stdout: Mutex::new(io::stdout()),
            stderr: Mutex::new(io::stderr()),
        }
    }
}

impl Drain for ConsoleDrain {
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), io::Error> {
        if !self.level.passes(record.level()) {
            return Ok(());
        }

        let line = format_line(record, values);

        match record.level() {
            slog::Level::Critical | slog::Level::Error | slog::Level::Warning => {
                self.stderr.lock().expect("stderr poisoned").write_all(line.as_bytes())
            }
            slog::Level::Info | slog::Level::Debug | slog::Level::Trace => {
                self.stdout.lock().expect("stdout poisoned").write_all(line.as_bytes())
            }
        }
    }
}

/// A `slog::Drain` that buffers formatted records in memory and only writes them out when
/// `flush` is called, matching "file mode buffers in memory and flushes on an external
/// periodic call".
struct BufferedFileDrain {
    level: Level,
    writer: Mutex<BufWriter<File>>,
}

impl BufferedFileDrain {
    fn open(path: &Path, level: Level) -> io::Result<BufferedFileDrain> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufferedFileDrain {
            level,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn flush(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

impl Drain for BufferedFileDrain {
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), io::Error> {
        if !self.level.passes(record.level()) {
            return Ok(());
        }
        let line = format_line(record, values);
        let mut writer = self.writer.lock().expect("log writer poisoned");
        writer.write_all(line.as_bytes())
    }
}

impl Drain for Arc<BufferedFileDrain> {
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), io::Error> {
        (**self).log(record, values)
    }
}

/// Handle used by the scheduler to periodically flush file-backed loggers. Cheap to clone;
/// holds only an `Arc` to the shared registry.
#[derive(Clone)]
pub struct FlushHandle {
    drains: Arc<Mutex<Vec<Arc<BufferedFileDrain>>>>,
}

impl FlushHandle {
    fn new() -> FlushHandle {
        FlushHandle {
            drains: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn register(&self, drain: Arc<BufferedFileDrain>) {
        self.drains.lock().expect("flush registry poisoned").push(drain);
    }

    /// Flushes every file-backed logger created through this handle. Intended to be called
    /// from a scheduled task, not on the hot logging path.
    pub fn flush_all(&self) {
        for drain in self.drains.lock().expect("flush registry poisoned").iter() {
            drain.flush();
        }
    }
}

/// Builds loggers for named components against a shared `LogConfig`, tracking file drains
/// so they can all be flushed together.
pub struct LoggerFactory {
    cfg: LogConfig,
    flush: FlushHandle,
}

impl LoggerFactory {
    pub fn new(cfg: LogConfig) -> LoggerFactory {
        LoggerFactory {
            cfg,
            flush: FlushHandle::new(),
        }
    }

    pub fn flush_handle(&self) -> FlushHandle {
        self.flush.clone()
    }

    /// Builds a logger for `component`, honoring the level resolution order and the
    /// configured destination.
    pub fn build(&self, component: &str, ctor_level: Option<Level>) -> Logger {
        let level = resolve_level(component, ctor_level, &self.cfg);

        if level == Level::Silent {
            return Logger::root(slog::Discard, o!("component" => component.to_string()));
        }

        match self.cfg.destination {
            Destination::Console => {
                let drain = ConsoleDrain::new(level).fuse();
                Logger::root(drain, o!("component" => component.to_string()))
            }
            Destination::File => {
                let path = self.cfg.dir.join(format!("{component}.log"));
                let drain = Arc::new(
                    BufferedFileDrain::open(&path, level)
                        .unwrap_or_else(|err| panic!("failed opening log file {path:?}: {err}")),
                );
                self.flush.register(drain.clone());
                Logger::root(drain.fuse(), o!("component" => component.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_resolution_prefers_env_over_ctor() {
        std::env::set_var("WIDGET_LOG_LEVEL", "debug");
        let cfg = LogConfig {
            default_level: Level::Error,
            ..LogConfig::default()
        };
        assert_eq!(resolve_level("widget", Some(Level::Warn), &cfg), Level::Debug);
        std::env::remove_var("WIDGET_LOG_LEVEL");
    }

    #[test]
    fn level_resolution_falls_back_to_default() {
        std::env::remove_var("GIZMO_LOG_LEVEL");
        let cfg = LogConfig {
            default_level: Level::Info,
            ..LogConfig::default()
        };
        assert_eq!(resolve_level("gizmo", None, &cfg), Level::Info);
    }

    #[test]
    fn silent_suppresses_everything() {
        assert!(!Level::Silent.passes(slog::Level::Critical));
        assert!(Level::Debug.passes(slog::Level::Trace));
        assert!(!Level::Error.passes(slog::Level::Info));
    }
}
