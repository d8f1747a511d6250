//! Broker lifecycle: endpoint derivation, single-instance guard, serving and
//! graceful shutdown.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::coordinator::Coordinator;
use crate::health::spawn_health_monitor;
use crate::process_utils::{process_exists, read_pid_file};
use crate::protocol::{encode_line, ServerNotice};
use crate::tracker::TaskTracker;
use crate::transport::{Connections, Server};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("busd is already running{} on {}", pid_suffix(.pid), .socket.display())]
    AlreadyRunning { pid: Option<u32>, socket: PathBuf },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> LifecycleError {
    let context = context.into();
    move |source| LifecycleError::Io { context, source }
}

/// Socket path plus the sibling pid record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub socket: PathBuf,
    pub pid_file: PathBuf,
}

impl Endpoint {
    pub fn from_socket(socket: impl Into<PathBuf>) -> Self {
        let socket = socket.into();
        let pid_file = socket.with_extension("pid");
        Self { socket, pid_file }
    }

    /// `busd-<hash>.sock` in the runtime dir, keyed by the working directory
    /// so brokers for different projects never collide.
    pub fn for_project(dir: &Path) -> Self {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let tag = hex::encode(digest);
        Self::from_socket(runtime_dir().join(format!("busd-{}.sock", &tag[..16])))
    }

    /// Configured socket if any, otherwise derived from the current directory.
    pub fn resolve(config: &BrokerConfig) -> Self {
        match &config.broker.socket {
            Some(socket) => Self::from_socket(socket.clone()),
            None => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                Self::for_project(&cwd)
            }
        }
    }
}

pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// Holds the exclusive lock on the pid record. Dropping it removes the
/// socket and the pid file.
#[derive(Debug)]
pub struct InstanceGuard {
    endpoint: Endpoint,
    lock: File,
}

impl InstanceGuard {
    /// Claim `endpoint` and bind its socket (mode 0600).
    pub fn acquire(endpoint: &Endpoint) -> Result<(Self, UnixListener), LifecycleError> {
        if let Some(parent) = endpoint.socket.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(parent)
                .map_err(io_context(format!("create {}", parent.display())))?;
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&endpoint.pid_file)
            .map_err(io_context(format!("open {}", endpoint.pid_file.display())))?;

        if lock.try_lock_exclusive().is_err() {
            let pid = read_pid_file(&endpoint.pid_file).ok().flatten();
            return Err(LifecycleError::AlreadyRunning {
                pid,
                socket: endpoint.socket.clone(),
            });
        }

        if let Ok(Some(previous)) = read_pid_file(&endpoint.pid_file) {
            if previous != std::process::id() {
                let alive = process_exists(previous);
                warn!(pid = previous, alive, "Replacing stale pid record");
            }
        }

        if endpoint.socket.exists() {
            if std::os::unix::net::UnixStream::connect(&endpoint.socket).is_ok() {
                return Err(LifecycleError::AlreadyRunning {
                    pid: None,
                    socket: endpoint.socket.clone(),
                });
            }
            info!("Removing stale socket {}", endpoint.socket.display());
            std::fs::remove_file(&endpoint.socket)
                .map_err(io_context(format!("remove {}", endpoint.socket.display())))?;
        }

        let listener = UnixListener::bind(&endpoint.socket)
            .map_err(io_context(format!("bind {}", endpoint.socket.display())))?;
        std::fs::set_permissions(&endpoint.socket, std::fs::Permissions::from_mode(0o600))
            .map_err(io_context(format!("chmod {}", endpoint.socket.display())))?;

        let guard = Self {
            endpoint: endpoint.clone(),
            lock,
        };
        guard
            .write_pid()
            .map_err(io_context(format!("write {}", endpoint.pid_file.display())))?;
        Ok((guard, listener))
    }

    fn write_pid(&self) -> io::Result<()> {
        let mut file = &self.lock;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        for path in [&self.endpoint.socket, &self.endpoint.pid_file] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove {}: {}", path.display(), err),
            }
        }
        let _ = self.lock.unlock();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cancelled_polls: usize,
    pub notified_connections: usize,
    pub drained: bool,
    pub closed_connections: usize,
}

/// A bound broker, ready to serve.
pub struct Broker {
    config: BrokerConfig,
    coordinator: Coordinator,
    connections: Connections,
    listener: UnixListener,
    guard: InstanceGuard,
}

impl Broker {
    pub fn bind(config: BrokerConfig, tracker: Arc<dyn TaskTracker>) -> Result<Self, LifecycleError> {
        let endpoint = Endpoint::resolve(&config);
        let (guard, listener) = InstanceGuard::acquire(&endpoint)?;
        let coordinator = Coordinator::new(tracker, config.coordinator_settings());
        Ok(Self {
            config,
            coordinator,
            connections: Connections::new(),
            listener,
            guard,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.guard.endpoint()
    }

    /// Serve until `shutdown` flips to true, then drain and clean up.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> ShutdownReport {
        let Broker {
            config,
            coordinator,
            connections,
            listener,
            guard,
        } = self;

        let monitor = spawn_health_monitor(
            coordinator.clone(),
            config.health_interval(),
            shutdown.clone(),
        );
        let server = Server::new(
            coordinator.clone(),
            connections.clone(),
            config.broker.max_record_bytes,
        );
        info!("busd listening on {}", guard.endpoint().socket.display());
        server.serve(listener, shutdown).await;

        let (workers, queued, active_tasks) = coordinator.counts().await;
        info!(workers, queued, active_tasks, "Graceful shutdown initiated");

        let cancelled_polls = coordinator.begin_shutdown().await;
        let drain_timeout = config.drain_timeout();
        let notified_connections = match encode_line(&ServerNotice::shutdown(
            drain_timeout.as_millis() as u64,
        )) {
            Ok(line) => connections.broadcast(&line).await,
            Err(err) => {
                warn!("Failed to encode shutdown notice: {}", err);
                0
            }
        };
        let open_connections = connections.len().await;
        info!(
            open_connections,
            in_flight = connections.in_flight(),
            "Draining connections"
        );

        let drained = connections.wait_idle(Instant::now() + drain_timeout).await;
        if !drained {
            warn!(
                in_flight = connections.in_flight(),
                "Drain timeout elapsed; closing remaining connections"
            );
        }
        let closed_connections = connections.close_all().await;

        if let Err(err) = monitor.await {
            debug!("Health monitor ended abnormally: {}", err);
        }
        drop(guard);
        info!(cancelled_polls, closed_connections, "busd stopped");

        ShutdownReport {
            cancelled_polls,
            notified_connections,
            drained,
            closed_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_endpoint_is_stable_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let a = Endpoint::for_project(dir.path());
        let b = Endpoint::for_project(dir.path());
        assert_eq!(a, b);

        let name = a.socket.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("busd-") && name.ends_with(".sock"));
        assert_eq!(name.len(), "busd-".len() + 16 + ".sock".len());
        assert_eq!(a.pid_file, a.socket.with_extension("pid"));

        let other = tempfile::tempdir().unwrap();
        assert_ne!(Endpoint::for_project(other.path()), a);
    }

    #[test]
    fn client_derives_the_same_project_socket() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            busd_client::project_socket_path(dir.path()),
            Endpoint::for_project(dir.path()).socket
        );
    }

    #[tokio::test]
    async fn second_instance_is_refused_and_files_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::from_socket(dir.path().join("busd.sock"));

        let (guard, _listener) = InstanceGuard::acquire(&endpoint).unwrap();
        let mode = std::fs::metadata(&endpoint.socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            read_pid_file(&endpoint.pid_file).unwrap(),
            Some(std::process::id())
        );

        let err = InstanceGuard::acquire(&endpoint).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning { .. }));
        assert!(err.to_string().contains("already running"));

        drop(guard);
        assert!(!endpoint.socket.exists());
        assert!(!endpoint.pid_file.exists());
    }

    #[tokio::test]
    async fn stale_socket_and_pid_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::from_socket(dir.path().join("busd.sock"));
        {
            // A socket file nobody listens on.
            let listener = std::os::unix::net::UnixListener::bind(&endpoint.socket).unwrap();
            drop(listener);
        }
        std::fs::write(&endpoint.pid_file, "999999\n").unwrap();

        let (_guard, _listener) = InstanceGuard::acquire(&endpoint).unwrap();
        assert_eq!(
            read_pid_file(&endpoint.pid_file).unwrap(),
            Some(std::process::id())
        );
    }

    #[tokio::test]
    async fn broker_runs_on_a_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::default();
        config.broker.socket = Some(dir.path().join("busd.sock"));
        let tracker = Arc::new(crate::tracker::MemoryTracker::new());

        let broker = Broker::bind(config, tracker).unwrap();
        let socket = broker.endpoint().socket.clone();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(broker.run(rx));

        shutdown.send(true).unwrap();
        let report = handle.await.unwrap();
        assert!(report.drained);
        assert_eq!(report.cancelled_polls, 0);
        assert_eq!(report.closed_connections, 0);
        assert!(!socket.exists());
    }
}
