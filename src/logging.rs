use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LaunchConfig, RuntimeMode};

/// An append-only log file shared between writers and the shutdown path.
/// Closing flushes and drops the handle; later writes are discarded.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    inner: Mutex<Option<BufWriter<File>>>,
}

impl LogFile {
    pub fn create(path: &Path) -> io::Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Some(BufWriter::new(file))),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file mutex poisoned"))?;
        match guard.as_mut() {
            Some(writer) => {
                writer.write_all(bytes)?;
                writer.flush()
            }
            None => Ok(()),
        }
    }

    /// Returns `true` only for the call that actually closed the file.
    pub fn close(&self) -> io::Result<bool> {
        let taken = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match taken {
            Some(mut writer) => {
                writer.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

/// Writer target for the global subscriber. Writes go to stderr until
/// `redirect` points them at `main.log` inside the state root.
#[derive(Debug, Clone, Default)]
pub struct MainLog {
    target: Arc<Mutex<Option<Arc<LogFile>>>>,
}

impl MainLog {
    pub fn redirect(&self, file: Arc<LogFile>) {
        if let Ok(mut guard) = self.target.lock() {
            *guard = Some(file);
        }
    }

    pub fn current(&self) -> Option<Arc<LogFile>> {
        self.target.lock().ok().and_then(|guard| guard.clone())
    }
}

pub struct MainLogWriter {
    target: Option<Arc<LogFile>>,
}

impl Write for MainLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.target {
            Some(file) if !file.is_closed() => file.write_bytes(buf)?,
            Some(_) => {}
            None => io::stderr().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.target {
            Some(_) => Ok(()),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for MainLog {
    type Writer = MainLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MainLogWriter {
            target: self.current(),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the defaults; with
/// logging disabled only errors get through.
pub fn init(config: &LaunchConfig, main_log: MainLog) -> anyhow::Result<()> {
    let default_directive = match (config.logging, config.mode) {
        (false, _) => "error",
        (true, RuntimeMode::Development) => "debug",
        (true, _) => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(main_log)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
