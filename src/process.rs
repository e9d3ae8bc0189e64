use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::error::{Result, SupervisorError};
use crate::lifecycle::Lifecycle;
use crate::logging::LogFile;

const READ_BUFFER: usize = 4096;

/// How a child process ended, as seen by its watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: Option<i32> },
    Killed,
    Failed(String),
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        Self::Exited {
            code: status.code(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub name: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub log_file: Option<PathBuf>,
    pub pipe_stdin: bool,
    pub observe_stdout: bool,
    pub observe_stderr: bool,
    /// When set, a non-zero exit outside of shutdown is fatal and reported
    /// with this message.
    pub expect_clean: Option<String>,
}

impl ProcessSpec {
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn log_to(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    pub fn expect_clean(mut self, message: &str) -> Self {
        self.expect_clean = Some(message.to_string());
        self
    }
}

/// Caller-side view of a supervised child. The OS process itself belongs
/// to the watcher task; this handle only observes it or asks for a kill.
#[derive(Debug)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<mpsc::UnboundedReceiver<String>>,
    pub stderr: Option<mpsc::UnboundedReceiver<String>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub async fn wait(&mut self) -> ProcessExit {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(ProcessExit::Killed),
            Err(_) => ProcessExit::Failed(format!("{} watcher stopped", self.name)),
        }
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct Launcher {
    config: Arc<LaunchConfig>,
    lifecycle: Arc<Lifecycle>,
}

impl Launcher {
    pub fn new(config: Arc<LaunchConfig>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { config, lifecycle }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        if self.lifecycle.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown(spec.name));
        }

        let path = self.config.resolve_binary(&spec.name);
        let arg_string = spec
            .args
            .iter()
            .map(|arg| format!("{arg:?}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "process", "spawning {} with args \"{}\"", path.display(), arg_string);

        let mut command = Command::new(&path);
        command
            .args(&spec.args)
            .stdin(if spec.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            path: path.clone(),
            source,
        })?;
        let pid = child.id();

        let log_file = match (&spec.log_file, self.config.logging) {
            (Some(log_path), true) => {
                let file = LogFile::create(log_path).map_err(|err| {
                    SupervisorError::io(format!("cannot open log file {}", log_path.display()), err)
                })?;
                self.lifecycle.track_log(file.clone());
                Some(file)
            }
            _ => None,
        };

        let mut forwarders = Vec::new();
        let stdout = child.stdout.take().and_then(|pipe| {
            let (rx, task) = self.forward(&spec.name, pipe, log_file.clone(), spec.observe_stdout);
            forwarders.push(task);
            rx
        });
        let stderr = child.stderr.take().and_then(|pipe| {
            let (rx, task) = self.forward(&spec.name, pipe, log_file.clone(), spec.observe_stderr);
            forwarders.push(task);
            rx
        });
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = self.lifecycle.token().child_token();
        let id = self.lifecycle.register_child(&spec.name, pid);
        let watch = ChildWatch {
            lifecycle: self.lifecycle.clone(),
            id,
            name: spec.name.clone(),
            expect_clean: spec.expect_clean.clone(),
            kill: kill.clone(),
            exit_tx,
            forwarders,
            log_file,
        };
        self.lifecycle.tracker().spawn(watch.run(child));

        Ok(ProcessHandle {
            name: spec.name,
            pid,
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
            kill,
        })
    }

    /// Copies one output pipe into the log file and the tracing output, and
    /// optionally mirrors each chunk to the returned receiver. The task ends
    /// at EOF or on shutdown.
    fn forward<R>(
        &self,
        name: &str,
        mut pipe: R,
        log_file: Option<Arc<LogFile>>,
        observe: bool,
    ) -> (Option<mpsc::UnboundedReceiver<String>>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = if observe {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let lifecycle = self.lifecycle.clone();
        let name = name.to_string();

        let task = self.lifecycle.tracker().spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                let read = tokio::select! {
                    _ = lifecycle.token().cancelled() => break,
                    read = pipe.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(target: "process", process = %name, error = %err, "output pipe closed");
                        break;
                    }
                };
                let chunk = &buf[..n];
                if let Some(file) = &log_file {
                    if let Err(err) = file.write_bytes(chunk) {
                        warn!(target: "process", process = %name, error = %err, "failed to write process log");
                    }
                }
                let text = String::from_utf8_lossy(chunk);
                if !lifecycle.is_shutting_down() {
                    for line in text.lines().filter(|line| !line.trim().is_empty()) {
                        debug!(target: "process", "{name}: {line}");
                    }
                }
                if let Some(tx) = &tx {
                    let _ = tx.send(text.into_owned());
                }
            }
        });

        (rx, task)
    }
}

/// Everything the exit watcher needs besides the child itself.
struct ChildWatch {
    lifecycle: Arc<Lifecycle>,
    id: u64,
    name: String,
    expect_clean: Option<String>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    forwarders: Vec<JoinHandle<()>>,
    log_file: Option<Arc<LogFile>>,
}

impl ChildWatch {
    async fn run(self, mut child: Child) {
        let lifecycle = &self.lifecycle;
        let name = self.name.as_str();
        let waited = tokio::select! {
            waited = child.wait() => Some(waited),
            _ = self.kill.cancelled() => None,
        };

        let exit = match waited {
            Some(Ok(status)) => {
                let shutting_down = lifecycle.is_shutting_down();
                if !shutting_down {
                    info!(target: "process", "{name} exited with code {:?}", status.code());
                }
                if let Some(message) = self.expect_clean.as_ref() {
                    if !status.success() && !shutting_down {
                        lifecycle.report_fatal(SupervisorError::UnexpectedExit {
                            message: message.clone(),
                            code: status.code(),
                        });
                    }
                }
                ProcessExit::from_status(status)
            }
            Some(Err(err)) => on_wait_error(lifecycle, name, err),
            None => {
                debug!(target: "process", process = %name, "killing");
                lifecycle.record_kill();
                match child.start_kill() {
                    Ok(()) => match child.wait().await {
                        Ok(_) => ProcessExit::Killed,
                        Err(err) => on_wait_error(lifecycle, name, err),
                    },
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => ProcessExit::Killed,
                    Err(err) => on_wait_error(lifecycle, name, err),
                }
            }
        };

        lifecycle.release_child(self.id);
        let _ = self.exit_tx.send(Some(exit));

        // The log stays open until the output pipes drain; shutdown closes
        // whatever is still registered at that point.
        for task in self.forwarders {
            let _ = task.await;
        }
        if let Some(file) = &self.log_file {
            if !lifecycle.is_shutting_down() {
                lifecycle.release_log(file);
            }
        }
    }
}

/// A reset connection is what a TCP-serving child looks like when it is
/// killed underneath us; anything else is a real failure.
fn on_wait_error(lifecycle: &Lifecycle, name: &str, err: io::Error) -> ProcessExit {
    if lifecycle.is_shutting_down() && err.kind() == io::ErrorKind::ConnectionReset {
        debug!(target: "process", process = %name, "ignoring connection reset during shutdown");
        return ProcessExit::Killed;
    }
    let message = err.to_string();
    lifecycle.report_fatal(SupervisorError::Process {
        name: name.to_string(),
        source: err,
    });
    ProcessExit::Failed(message)
}
