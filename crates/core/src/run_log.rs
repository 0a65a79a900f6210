use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_FILE: OnceLock<LogFile> = OnceLock::new();
static SUBSCRIBER_INIT: OnceLock<()> = OnceLock::new();

/// Target of the NDJSON layer. While no file is open, events are dropped.
#[derive(Debug, Default)]
struct LogFile {
    file: Mutex<Option<BufWriter<File>>>,
}

impl LogFile {
    fn open(&self, path: &Path) -> io::Result<()> {
        let mut slot = self.file.lock().expect("log file mutex poisoned");
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "log file already open",
            ));
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let Some(mut file) = self.file.lock().expect("log file mutex poisoned").take() else {
            return Ok(());
        };
        file.flush()?;
        file.get_ref().sync_all()
    }

    fn append_line(&self, line: &[u8]) -> io::Result<()> {
        match self.file.lock().expect("log file mutex poisoned").as_mut() {
            Some(file) => file.write_all(line),
            None => Ok(()),
        }
    }
}

/// One formatted event. Workers log concurrently, so the line is collected
/// here and appended under the lock in a single write on drop.
struct EventLine<'a> {
    target: &'a LogFile,
    line: Vec<u8>,
}

impl Write for EventLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventLine<'_> {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            let _ = self.target.append_line(&self.line);
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = EventLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        EventLine {
            target: self,
            line: Vec::with_capacity(256),
        }
    }
}

impl<'a> MakeWriter<'a> for &LogFile {
    type Writer = EventLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

/// Maps `LOG_LEVEL` values (`DEBUG`, `INFO`, `WARNING`, `ERROR`, `CRITICAL`)
/// onto tracing directives. Anything else is passed through unchanged.
pub fn level_directive(level: &str) -> String {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace".to_string(),
        "DEBUG" => "debug".to_string(),
        "INFO" => "info".to_string(),
        "WARN" | "WARNING" => "warn".to_string(),
        "ERROR" | "CRITICAL" | "FATAL" => "error".to_string(),
        _ => level.trim().to_string(),
    }
}

fn build_env_filter_from(
    aemseed_log: Option<&str>,
    rust_log: Option<&str>,
    level: &str,
) -> EnvFilter {
    let default = || EnvFilter::try_new(level_directive(level)).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(v) = aemseed_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

/// Installs the global subscriber once: human output on stderr plus the
/// NDJSON file layer.
pub fn init_logging(level: &str) {
    SUBSCRIBER_INIT.get_or_init(|| {
        let log_file = LOG_FILE.get_or_init(LogFile::default);
        let env_filter = build_env_filter_from(
            std::env::var("AEMSEED_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
            level,
        );

        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(log_file);
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(json_layer);
        let _ = subscriber.try_init();
    });
}

pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(log_file) = LOG_FILE.get() {
            let _ = log_file.close();
        }
    }
}

/// Appends NDJSON log lines to `path` until the guard is dropped.
pub fn start_run_log(path: &Path, level: &str) -> io::Result<RunLogGuard> {
    init_logging(level);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    LOG_FILE.get_or_init(LogFile::default).open(path)?;

    Ok(RunLogGuard {
        path: path.to_path_buf(),
    })
}
