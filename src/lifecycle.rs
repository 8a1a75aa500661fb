//! Process entry points.
//!
//! Each subcommand of the binary runs one kind of process: the backend
//! daemon, a worker, the VM manager or the job grabber. They share the
//! configuration file and meet only on the coordination store.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use daemonize::Daemonize;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{setgid, setuid, Gid, Group, Uid, User};
use tracing_subscriber::EnvFilter;

use crate::bus::{EtcdStore, KeySpace, SharedStore};
use crate::config::{BackendConfig, ConfigReader};
use crate::daemon::BackendDaemon;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{BackendError, Result};
use crate::frontend::{FrontendClient, HttpFrontendClient};
use crate::scheduler::{JobChannel, JobGrabber};
use crate::shutdown::{install_shutdown_handler, Shutdown};
use crate::vm::{CommandHealthChecker, VmManager, VmMaster};
use crate::worker::{BuildExecutor, BuildWorker, ChildSpawner};

const BACKEND_LOG: &str = "backend.log";

/// How the backend daemon process is started.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub daemonize: bool,
    pub pidfile: Option<PathBuf>,
    pub daemon_user: Option<String>,
    pub daemon_group: Option<String>,
}

/// Pid file removed again when dropped, on every exit path.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
            BackendError::Daemon(format!("cannot write pid file {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Cannot remove pid file");
        }
    }
}

pub fn resolve_uid(name: &str) -> Result<Uid> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(BackendError::Daemon(format!("no such user: {}", name))),
        Err(e) => Err(BackendError::Daemon(format!("cannot look up user {}: {}", name, e))),
    }
}

pub fn resolve_gid(name: &str) -> Result<Gid> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(BackendError::Daemon(format!("no such group: {}", name))),
        Err(e) => Err(BackendError::Daemon(format!("cannot look up group {}: {}", name, e))),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_config(path: Option<&Path>) -> Result<Arc<BackendConfig>> {
    let path = path
        .ok_or_else(|| BackendError::Configuration("no configuration file given".to_string()))?;
    ConfigReader::new(path).read()
}

async fn connect_store(config: &BackendConfig) -> Result<SharedStore> {
    let store = EtcdStore::connect(&config.bus)
        .await
        .map_err(|e| BackendError::Broker(format!("cannot connect to the coordination store: {}", e)))?;
    Ok(Arc::new(store))
}

fn vm_manager(store: SharedStore, config: &BackendConfig) -> VmManager {
    VmManager::new(
        store,
        KeySpace::new(config.bus.namespace.clone()),
        config.thresholds.clone(),
    )
}

fn multi_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Turn an operator interrupt into its own error once teardown is done.
fn finish(shutdown: &Shutdown, result: Result<()>) -> Result<()> {
    if shutdown.interrupted() {
        return Err(BackendError::Interrupted);
    }
    result
}

/// Start the backend daemon: resolve ids, detach if asked, write the pid
/// file, then run the daemon loop on a single-threaded runtime.
pub fn run_backend(opts: RunOptions) -> Result<()> {
    let config_path = opts
        .config_path
        .clone()
        .ok_or_else(|| BackendError::Configuration("no configuration file given".to_string()))?;
    let config = read_config(Some(&config_path))?;

    let uid = opts.daemon_user.as_deref().map(resolve_uid).transpose()?;
    let gid = opts.daemon_group.as_deref().map(resolve_gid).transpose()?;
    umask(Mode::from_bits_truncate(0o022));

    if opts.daemonize {
        std::fs::create_dir_all(&config.log_dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_dir.join(BACKEND_LOG))?;
        let mut daemon = Daemonize::new()
            .working_directory("/")
            .umask(0o022)
            .stderr(log);
        if let Some(uid) = uid {
            daemon = daemon.user(uid.as_raw());
        }
        if let Some(gid) = gid {
            daemon = daemon.group(gid.as_raw());
        }
        daemon
            .start()
            .map_err(|e| BackendError::Daemon(e.to_string()))?;
    } else {
        if let Some(gid) = gid {
            setgid(gid).map_err(|e| BackendError::Daemon(format!("setgid: {}", e)))?;
        }
        if let Some(uid) = uid {
            setuid(uid).map_err(|e| BackendError::Daemon(format!("setuid: {}", e)))?;
        }
    }

    init_tracing(&config.log_level);
    let _pidfile = opts.pidfile.as_deref().map(PidFile::create).transpose()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_backend(config_path, config))
}

async fn serve_backend(config_path: PathBuf, config: Arc<BackendConfig>) -> Result<()> {
    let shutdown = install_shutdown_handler()?;
    let store = connect_store(&config).await?;
    let frontend: Arc<dyn FrontendClient> = Arc::new(HttpFrontendClient::new(&config.frontend)?);
    let spawner = Arc::new(ChildSpawner::current_exe(&config_path)?);

    let mut daemon =
        BackendDaemon::new(Some(config_path), store.clone(), spawner).with_frontend(frontend);
    daemon.init().await?;

    if let Some(addr) = config.dashboard_addr {
        let state = DashboardState {
            status: daemon.subscribe_status(),
            vms: vm_manager(store, &config),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let result = daemon.run(shutdown.token()).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Backend stopped on a fatal error");
    }
    finish(&shutdown, result)
}

/// Body of one worker process spawned by a worker pool.
pub fn run_worker(config_path: &Path, group_id: u32, worker_num: usize) -> Result<()> {
    let config = read_config(Some(config_path))?;
    init_tracing(&config.log_level);
    if config.group(group_id).is_none() {
        return Err(BackendError::Configuration(format!(
            "no build group with id {}",
            group_id
        )));
    }

    multi_thread_runtime()?.block_on(async move {
        let shutdown = install_shutdown_handler()?;
        let store = connect_store(&config).await?;
        let keys = KeySpace::new(config.bus.namespace.clone());
        let channel = JobChannel::open(store.clone(), keys).await?;
        let frontend: Arc<dyn FrontendClient> =
            Arc::new(HttpFrontendClient::new(&config.frontend)?);

        let worker = BuildWorker::new(
            group_id,
            worker_num,
            channel,
            vm_manager(store, &config),
            frontend,
            BuildExecutor::new(config.builder.clone(), config.results_dir.clone()),
            Duration::from_secs(config.builder.vm_wait_interval),
            config.sleeptime(),
        );
        let result = worker.run(shutdown.token()).await;
        finish(&shutdown, result)
    })
}

/// The VM manager process.
pub fn run_vm_manager(config_path: &Path) -> Result<()> {
    let config = read_config(Some(config_path))?;
    init_tracing(&config.log_level);

    multi_thread_runtime()?.block_on(async move {
        let shutdown = install_shutdown_handler()?;
        let store = connect_store(&config).await?;
        let master = VmMaster::new(
            vm_manager(store, &config),
            Arc::new(CommandHealthChecker::new(&config.health_check)),
            config.build_groups.clone(),
        )
        .with_max_in_use(config.builder.timeout + config.thresholds.health_check_max_time);
        let result = master.run(shutdown.token()).await;
        finish(&shutdown, result)
    })
}

/// The job grabber process.
pub fn run_job_grabber(config_path: &Path) -> Result<()> {
    let config = read_config(Some(config_path))?;
    init_tracing(&config.log_level);

    multi_thread_runtime()?.block_on(async move {
        let shutdown = install_shutdown_handler()?;
        let store = connect_store(&config).await?;
        let channel = JobChannel::open(store, KeySpace::new(config.bus.namespace.clone())).await?;
        let frontend: Arc<dyn FrontendClient> =
            Arc::new(HttpFrontendClient::new(&config.frontend)?);
        let grabber = JobGrabber::new(config.clone(), frontend, channel);
        let result = grabber.run(shutdown.token()).await;
        finish(&shutdown, result)
    })
}
