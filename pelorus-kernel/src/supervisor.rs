/**
 * LOGGER SUPERVISOR - One logger's child-process lifecycle
 *
 * ROLE:
 * Runs exactly one configuration's pipeline as an isolated OS process and
 * answers liveness queries. Pipelines do blocking I/O (serial reads) and must
 * never run on the kernel's event loop; the supervisor only ever interacts
 * with the child through non-blocking liveness polls and its stdio handles.
 *
 * STATE MACHINE:
 * Stopped -> Starting -> Running -> (Stopping | Failed) -> Stopped
 * All transitions funnel through start()/stop()/poll(), so tests can drive
 * every edge deterministically through a fake process backend.
 *
 * SHUTDOWN:
 * Graceful stop closes the child's stdin; the runner treats stdin EOF as the
 * quit request and drains its pipeline. If the child is still up after the
 * grace period it is force-killed. An unresponsive pipeline never blocks a
 * mode change indefinitely.
 */

use crate::cache::CachedDataHub;
use crate::pipeline::LoggerConfig;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn pipeline for '{logger}': {source}")]
    SpawnFailed {
        logger: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// How a supervised process left the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Clean,
    Failed(Option<i32>),
}

/// Handle to one spawned pipeline process. All methods are non-blocking.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;
    /// Requests graceful termination (stdin close for the real runner).
    fn begin_shutdown(&mut self);
    fn kill(&mut self);
}

pub struct SpawnRequest<'a> {
    pub logger: &'a str,
    pub config_name: &'a str,
    pub config: &'a LoggerConfig,
}

/// Seam between the supervisor and the OS, so lifecycle logic is testable
/// without real subprocesses.
pub trait ProcessBackend: Send + Sync {
    fn spawn(&self, req: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>>;
}

pub struct LoggerSupervisor {
    logger_name: String,
    backend: Arc<dyn ProcessBackend>,
    stop_grace: Duration,
    state: RunState,
    current_config_name: Option<String>,
    current_config: Option<LoggerConfig>,
    handle: Option<Box<dyn ProcessHandle>>,
    quit_requested: bool,
    failed_reason: Option<String>,
    pid: Option<u32>,
}

impl LoggerSupervisor {
    pub fn new(logger_name: String, backend: Arc<dyn ProcessBackend>, stop_grace: Duration) -> Self {
        Self {
            logger_name,
            backend,
            stop_grace,
            state: RunState::Stopped,
            current_config_name: None,
            current_config: None,
            handle: None,
            quit_requested: false,
            failed_reason: None,
            pid: None,
        }
    }

    /// Starts the given config, stopping any process already running under
    /// this supervisor first (no silent double-start). Placeholder configs
    /// register the logger as intentionally not running. Returns once the
    /// process is spawned; the pipeline itself is long-running by design.
    pub async fn start(
        &mut self,
        config_name: &str,
        config: &LoggerConfig,
    ) -> Result<(), SupervisorError> {
        if self.handle.is_some() {
            self.stop().await;
        }
        self.current_config_name = Some(config_name.to_string());
        self.current_config = Some(config.clone());
        self.failed_reason = None;
        self.quit_requested = false;

        if !config.is_runnable() {
            self.state = RunState::Stopped;
            eprintln!("[supervisor] {} set to '{config_name}' (off)", self.logger_name);
            return Ok(());
        }

        self.state = RunState::Starting;
        let req = SpawnRequest { logger: &self.logger_name, config_name, config };
        match self.backend.spawn(&req) {
            Ok(handle) => {
                self.pid = handle.pid();
                self.handle = Some(handle);
                self.state = RunState::Running;
                eprintln!(
                    "[supervisor] {} running '{config_name}' (pid {:?})",
                    self.logger_name, self.pid
                );
                Ok(())
            }
            Err(e) => {
                self.state = RunState::Failed;
                self.failed_reason = Some(format!("spawn failed: {e}"));
                Err(SupervisorError::SpawnFailed {
                    logger: self.logger_name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Graceful stop with bounded grace, then force-kill. Idempotent: a
    /// stopped (or failed) supervisor just has its failure flag cleared.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            self.state = RunState::Stopped;
            self.failed_reason = None;
            self.pid = None;
            return;
        };
        self.quit_requested = true;
        self.state = RunState::Stopping;
        handle.begin_shutdown();

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        loop {
            match handle.try_wait() {
                Ok(Some(exit)) => {
                    eprintln!("[supervisor] {} stopped ({exit:?})", self.logger_name);
                    break;
                }
                Ok(None) => {
                    if tokio::time::Instant::now() >= deadline {
                        eprintln!(
                            "[supervisor] {} unresponsive after {:?}, force killing",
                            self.logger_name, self.stop_grace
                        );
                        handle.kill();
                        // bounded wait for the kill to land
                        for _ in 0..50 {
                            if matches!(handle.try_wait(), Ok(Some(_))) {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    eprintln!("[supervisor] {} wait error: {e}", self.logger_name);
                    break;
                }
            }
        }
        self.state = RunState::Stopped;
        self.quit_requested = false;
        self.failed_reason = None;
        self.pid = None;
    }

    /// Non-blocking liveness check; flags an unexpected exit as failure.
    /// It is the manager's job to decide whether to restart.
    pub fn poll(&mut self) {
        let Some(handle) = self.handle.as_mut() else { return };
        match handle.try_wait() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                self.handle = None;
                self.pid = None;
                if self.quit_requested {
                    self.state = RunState::Stopped;
                } else {
                    self.state = RunState::Failed;
                    self.failed_reason = Some(match exit {
                        ProcessExit::Clean => "pipeline exited unexpectedly (code 0)".to_string(),
                        ProcessExit::Failed(code) => {
                            format!("pipeline exited with status {}", code.map_or("signal".to_string(), |c| c.to_string()))
                        }
                    });
                    eprintln!(
                        "[supervisor] {} failed: {}",
                        self.logger_name,
                        self.failed_reason.as_deref().unwrap_or("?")
                    );
                }
            }
            Err(e) => {
                self.handle = None;
                self.pid = None;
                self.state = RunState::Failed;
                self.failed_reason = Some(format!("liveness check failed: {e}"));
            }
        }
    }

    /// True iff a process handle exists and the OS reports it running.
    pub fn is_alive(&mut self) -> bool {
        self.poll();
        self.handle.is_some()
    }

    /// True iff a previously-started process exited without an explicit stop.
    pub fn is_failed(&mut self) -> bool {
        self.poll();
        self.state == RunState::Failed
    }

    /// Off on purpose, as opposed to crashed: the assigned config is a
    /// placeholder with nothing to run.
    pub fn is_intentionally_off(&self) -> bool {
        self.current_config.as_ref().is_some_and(|c| !c.is_runnable())
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn current_config_name(&self) -> Option<&str> {
        self.current_config_name.as_deref()
    }

    pub fn current_config(&self) -> Option<&LoggerConfig> {
        self.current_config.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.failed_reason.as_deref()
    }
}

/// Real backend: spawns the pelorus-runner binary with the serialized config
/// and forwards its stderr into the cached data server, line by line, tagged
/// `stderr:logger:<name>` for the console.
pub struct OsProcessBackend {
    pub runner_binary: String,
    pub log_level: String,
    /// Cache server address handed to the runner for its own data writers.
    pub cds_addr: Option<String>,
    pub hub: Arc<CachedDataHub>,
}

struct OsProcessHandle {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(|status| {
            if status.success() {
                ProcessExit::Clean
            } else {
                ProcessExit::Failed(status.code())
            }
        }))
    }

    fn begin_shutdown(&mut self) {
        // Dropping stdin delivers EOF; the runner treats that as quit.
        self.stdin.take();
    }

    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl ProcessBackend for OsProcessBackend {
    fn spawn(&self, req: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>> {
        let config_json = serde_json::to_string(req.config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut cmd = Command::new(&self.runner_binary);
        cmd.env("PELORUS_LOGGER", req.logger)
            .env("PELORUS_CONFIG_NAME", req.config_name)
            .env("PELORUS_CONFIG", config_json)
            .env("PELORUS_LOG_LEVEL", &self.log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(addr) = &self.cds_addr {
            cmd.env("PELORUS_CDS", addr);
        }
        let mut child = cmd.spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let hub = self.hub.clone();
            let field = format!("stderr:logger:{}", req.logger);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    hub.publish_now(&field, serde_json::Value::String(line));
                }
            });
        }

        let stdin = child.stdin.take();
        Ok(Box::new(OsProcessHandle { child, stdin }))
    }
}

#[cfg(test)]
pub mod testing {
    //! Deterministic process backend for supervisor and manager tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct FakeProcState {
        pub exit: Option<ProcessExit>,
        pub shutdown_requested: bool,
        pub killed: bool,
        /// When set, a graceful shutdown request makes the process exit
        /// cleanly on the next liveness poll (the well-behaved runner).
        pub exit_on_shutdown: bool,
    }

    pub struct FakeHandle {
        state: Arc<Mutex<FakeProcState>>,
        pid: u32,
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
            Ok(self.state.lock().exit)
        }

        fn begin_shutdown(&mut self) {
            let mut s = self.state.lock();
            s.shutdown_requested = true;
            if s.exit_on_shutdown {
                s.exit = Some(ProcessExit::Clean);
            }
        }

        fn kill(&mut self) {
            let mut s = self.state.lock();
            s.killed = true;
            s.exit = Some(ProcessExit::Failed(Some(9)));
        }
    }

    #[derive(Default)]
    pub struct FakeBackend {
        pub spawned: Mutex<Vec<(String, String, Arc<Mutex<FakeProcState>>)>>,
        pub fail_spawn_for: Mutex<Vec<String>>,
        pub hang_on_shutdown: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().len()
        }

        pub fn spawns_for(&self, logger: &str) -> usize {
            self.spawned.lock().iter().filter(|(l, _, _)| l == logger).count()
        }

        pub fn last_proc(&self, logger: &str) -> Option<Arc<Mutex<FakeProcState>>> {
            self.spawned
                .lock()
                .iter()
                .rev()
                .find(|(l, _, _)| l == logger)
                .map(|(_, _, s)| s.clone())
        }

        /// Simulates the pipeline process crashing with an exit code.
        pub fn crash(&self, logger: &str, code: i32) {
            if let Some(proc) = self.last_proc(logger) {
                proc.lock().exit = Some(ProcessExit::Failed(Some(code)));
            }
        }
    }

    impl ProcessBackend for FakeBackend {
        fn spawn(&self, req: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>> {
            if self.fail_spawn_for.lock().iter().any(|l| l == req.logger) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
            }
            let hang = self.hang_on_shutdown.lock().iter().any(|l| l == req.logger);
            let state = Arc::new(Mutex::new(FakeProcState {
                exit_on_shutdown: !hang,
                ..Default::default()
            }));
            let mut spawned = self.spawned.lock();
            spawned.push((req.logger.to_string(), req.config_name.to_string(), state.clone()));
            let pid = 1000 + spawned.len() as u32;
            Ok(Box::new(FakeHandle { state, pid }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;
    use crate::pipeline::{ReaderStage, WriterStage};

    fn runnable_config() -> LoggerConfig {
        LoggerConfig {
            readers: vec![ReaderStage::Udp { port: 6224 }],
            writers: vec![WriterStage::File { path: "/data/gyro".into() }],
            ..Default::default()
        }
    }

    fn supervisor(backend: Arc<FakeBackend>) -> LoggerSupervisor {
        LoggerSupervisor::new("gyro".into(), backend, Duration::from_secs(0))
    }

    #[tokio::test]
    async fn test_start_then_stop_transitions() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend.clone());
        assert_eq!(sup.state(), RunState::Stopped);

        sup.start("gyro->file", &runnable_config()).await.unwrap();
        assert_eq!(sup.state(), RunState::Running);
        assert!(sup.is_alive());
        assert!(!sup.is_failed());
        assert!(sup.pid().is_some());

        sup.stop().await;
        assert_eq!(sup.state(), RunState::Stopped);
        assert!(!sup.is_alive());
        assert!(backend.last_proc("gyro").unwrap().lock().shutdown_requested);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend);
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_off_config_registers_without_spawning() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend.clone());
        sup.start("off", &LoggerConfig::default()).await.unwrap();
        assert_eq!(backend.spawn_count(), 0);
        assert_eq!(sup.state(), RunState::Stopped);
        assert!(sup.is_intentionally_off());
        assert!(!sup.is_failed());
        assert_eq!(sup.current_config_name(), Some("off"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_flags_failed() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend.clone());
        sup.start("gyro->file", &runnable_config()).await.unwrap();

        backend.crash("gyro", 1);
        assert!(sup.is_failed());
        assert!(!sup.is_alive());
        assert_eq!(sup.state(), RunState::Failed);
        assert!(sup.failed_reason().unwrap().contains("status 1"));
    }

    #[tokio::test]
    async fn test_explicit_stop_never_reads_as_failure() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend);
        sup.start("gyro->file", &runnable_config()).await.unwrap();
        sup.stop().await;
        assert!(!sup.is_failed());
        assert!(sup.failed_reason().is_none());
    }

    #[tokio::test]
    async fn test_unresponsive_process_is_force_killed() {
        let backend = FakeBackend::new();
        backend.hang_on_shutdown.lock().push("gyro".into());
        let mut sup = supervisor(backend.clone());
        sup.start("gyro->file", &runnable_config()).await.unwrap();

        // Zero grace: the kill path runs immediately instead of waiting.
        sup.stop().await;
        let proc = backend.last_proc("gyro").unwrap();
        assert!(proc.lock().killed);
        assert_eq!(sup.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_replaces_process_not_doubles_it() {
        let backend = FakeBackend::new();
        let mut sup = supervisor(backend.clone());
        sup.start("gyro->file", &runnable_config()).await.unwrap();
        sup.start("gyro->file", &runnable_config()).await.unwrap();

        assert_eq!(backend.spawn_count(), 2);
        let first = backend.spawned.lock()[0].2.clone();
        // The first process was stopped before the second spawn.
        assert!(first.lock().shutdown_requested);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed_without_handle() {
        let backend = FakeBackend::new();
        backend.fail_spawn_for.lock().push("gyro".into());
        let mut sup = supervisor(backend);
        let err = sup.start("gyro->file", &runnable_config()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
        assert_eq!(sup.state(), RunState::Failed);
        assert!(sup.pid().is_none());
    }
}
