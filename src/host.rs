//! Host orchestrator: discovers extensions, runs one worker process per
//! extension, and exposes command execution and event broadcast.
//!
//! Each worker gets three threads: a writer draining its outbound queue into
//! stdin, a stderr forwarder, and a stdout reader that routes frames and then
//! observes the process exit. All host bookkeeping sits in one
//! [`HostState`] behind a mutex; callers that need an answer from a worker
//! wait on a oneshot with a timeout, never on the lock.

use crate::commands::{CommandListing, CommandOutcome, HistoryEntry, HistoryFilter};
use crate::error::{Error, Result};
use crate::host_requests::{self, RequestContext};
use crate::lifecycle::{ExitReport, LifecycleState};
use crate::manifest::{self, ExtensionDescriptor};
use crate::permissions::{PermissionPolicy, PolicyHandle, TrustedNamespaces};
use crate::protocol::{ActivationResult, Direction, Message};
use crate::router::{ExitNotice, HostState, Prepared, WorkerLink};
use crate::worker::{ENV_EXTENSION_DIR, ENV_EXTENSION_ID, ENV_EXTENSION_MAIN, ENV_MEMORY_LIMIT_MB};
use asupersync::Cx;
use asupersync::time::{timeout, wall_now};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Environment variables forwarded to workers; everything else is cleared.
const PASSTHROUGH_ENV: [&str; 4] = ["PATH", "RUST_LOG", "SYSTEMROOT", "TMPDIR"];

/// Activation trigger prefix for command-driven activation.
pub const ON_COMMAND_PREFIX: &str = "onCommand:";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What happens when a worker crashes. Clean deactivations never restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum RestartPolicy {
    #[default]
    Never,
    #[serde(rename_all = "camelCase")]
    OnCrash { max_restarts: u32, backoff_ms: u64 },
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based), or `None` to give up.
    pub fn delay_for(self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::OnCrash {
                max_restarts,
                backoff_ms,
            } => (attempt < max_restarts).then(|| {
                let factor = 1_u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
                Duration::from_millis(backoff_ms.saturating_mul(factor))
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub extensions_dir: PathBuf,
    /// Program started for each worker; defaults to this executable.
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub command_timeout: Duration,
    pub activation_timeout: Duration,
    pub deactivate_grace: Duration,
    pub exec_timeout: Duration,
    pub restart: RestartPolicy,
    pub history_capacity: usize,
    pub trusted: TrustedNamespaces,
    pub memory_limit_mb: Option<u64>,
}

impl HostOptions {
    pub fn new(extensions_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            worker_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("exthost")),
            worker_args: vec!["worker".to_string()],
            command_timeout: Duration::from_secs(30),
            activation_timeout: Duration::from_secs(10),
            deactivate_grace: Duration::from_secs(3),
            exec_timeout: Duration::from_secs(30),
            restart: RestartPolicy::Never,
            history_capacity: crate::commands::DEFAULT_HISTORY_CAPACITY,
            trusted: TrustedNamespaces::default(),
            memory_limit_mb: None,
        }
    }
}

/// Lightweight view of a spawned worker. The process itself stays owned by
/// the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub extension_id: String,
    pub pid: u32,
    pub generation: u64,
}

#[derive(Clone)]
pub struct Host {
    state: Arc<Mutex<HostState>>,
    options: Arc<HostOptions>,
    policy: PolicyHandle,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(options: HostOptions, policy: Option<PermissionPolicy>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::new(options.history_capacity))),
            options: Arc::new(options),
            policy: PolicyHandle::new(policy),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    // ─── Discovery & spawn ──────────────────────────────────────────────

    /// Scan the extensions directory and remember what was found.
    pub fn discover(&self) -> Result<Vec<ExtensionDescriptor>> {
        let descriptors = manifest::discover(&self.options.extensions_dir)?;
        self.lock().set_descriptors(&descriptors);
        tracing::info!(count = descriptors.len(), dir = %self.options.extensions_dir.display(), "Discovered extensions");
        Ok(descriptors)
    }

    /// Discover and spawn every extension. Spawn failures are logged and
    /// skipped. Returns the handles that started.
    pub fn start(&self) -> Result<Vec<WorkerHandle>> {
        let descriptors = self.discover()?;
        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            match self.spawn(descriptor) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(extension_id = %descriptor.id, error = %err, "Failed to spawn worker");
                }
            }
        }
        Ok(handles)
    }

    pub fn spawn(&self, descriptor: &ExtensionDescriptor) -> Result<WorkerHandle> {
        self.spawn_worker(descriptor, 0, false)
    }

    fn spawn_worker(
        &self,
        descriptor: &ExtensionDescriptor,
        restarts: u32,
        reactivate: bool,
    ) -> Result<WorkerHandle> {
        let mut command = Command::new(&self.options.worker_program);
        command
            .args(&self.options.worker_args)
            .env_clear()
            .envs(PASSTHROUGH_ENV.iter().filter_map(|key| {
                std::env::var_os(key).map(|value| (*key, value))
            }))
            .env(ENV_EXTENSION_ID, &descriptor.id)
            .env(ENV_EXTENSION_MAIN, &descriptor.entry)
            .env(ENV_EXTENSION_DIR, &descriptor.root)
            .current_dir(&descriptor.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(limit) = self.options.memory_limit_mb {
            command.env(ENV_MEMORY_LIMIT_MB, limit.to_string());
        }

        let mut child = command.spawn().map_err(|err| {
            Error::extension(format!("Failed to spawn worker for {}: {err}", descriptor.id))
        })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(Error::extension("Worker stdio pipes unavailable"));
        };
        let child = Arc::new(Mutex::new(child));
        let (outbound, outbound_rx) = mpsc::channel::<Message>();

        // Install before any reader starts so no frame can beat the entry.
        let generation = self.lock().install_worker(
            descriptor,
            WorkerLink::new(outbound, Arc::clone(&child), pid),
            restarts,
            reactivate,
        );
        let id = descriptor.id.clone();
        tracing::info!(extension_id = %id, pid, generation, "Spawned worker");

        let writer_id = id.clone();
        thread::spawn(move || {
            let mut stdin = BufWriter::new(stdin);
            for msg in outbound_rx {
                if let Err(err) = msg.write_frame(&mut stdin) {
                    tracing::debug!(extension_id = %writer_id, error = %err, "Worker stdin closed");
                    break;
                }
            }
        });

        let stderr_id = id.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => tracing::debug!(extension_id = %stderr_id, "[worker] {line}"),
                    Err(_) => break,
                }
            }
        });

        let host = self.clone();
        let reader_id = id.clone();
        thread::spawn(move || {
            host.read_worker(&reader_id, generation, stdout);
            let status = wait_for_exit(&child);
            host.on_worker_exit(&reader_id, generation, status);
        });

        Ok(WorkerHandle {
            extension_id: id,
            pid,
            generation,
        })
    }

    fn read_worker(&self, id: &str, generation: u64, stdout: ChildStdout) {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::debug!(extension_id = id, error = %err, "Worker stdout failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Message::parse_directed(&line, Direction::WorkerToHost) {
                Ok(msg) => self.on_worker_message(id, generation, msg),
                Err(err) => {
                    tracing::warn!(extension_id = id, error = %err, "Rejected worker frame");
                }
            }
        }
    }

    fn on_worker_message(&self, id: &str, generation: u64, msg: Message) {
        let (request, reply, root) = {
            let mut state = self.lock();
            let Some(request) = state.route(id, generation, msg) else {
                return;
            };
            let reply = state
                .worker(id)
                .and_then(|w| w.link.as_ref())
                .map(WorkerLink::sender);
            let root = state.descriptor(id).map(|d| d.root.clone());
            (request, reply, root)
        };
        let (Some(reply), Some(root)) = (reply, root) else {
            return;
        };
        host_requests::handle(
            request,
            RequestContext {
                extension_id: id.to_string(),
                root,
                policy: self.policy.snapshot(),
                exec_timeout: self.options.exec_timeout,
                reply,
            },
        );
    }

    fn on_worker_exit(&self, id: &str, generation: u64, status: Option<ExitStatus>) {
        let code = status.and_then(|s| s.code());
        let signal = status.and_then(exit_signal);
        let Some(notice) = self.lock().worker_exited(id, generation, code, signal) else {
            return;
        };
        self.maybe_restart(id, &notice);
    }

    fn maybe_restart(&self, id: &str, notice: &ExitNotice) {
        if notice.report.kind != crate::lifecycle::ExitKind::Crashed {
            return;
        }
        let Some(delay) = self.options.restart.delay_for(notice.restarts) else {
            return;
        };
        tracing::info!(extension_id = id, attempt = notice.restarts + 1, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Restarting crashed worker");
        thread::sleep(delay);
        let descriptor = {
            let state = self.lock();
            if state.is_shutting_down() {
                return;
            }
            state.descriptor(id).cloned()
        };
        if let Some(descriptor) = descriptor {
            if let Err(err) = self.spawn_worker(&descriptor, notice.restarts + 1, notice.was_activated) {
                tracing::error!(extension_id = id, error = %err, "Restart failed");
            }
        }
    }

    // ─── Activation ─────────────────────────────────────────────────────

    /// Activate an extension explicitly. A second call returns the first
    /// result without re-running activation.
    pub async fn activate(&self, id: &str) -> Result<ActivationResult> {
        let mut rx = {
            let mut state = self.lock();
            let entry = state
                .worker_mut(id)
                .ok_or_else(|| Error::extension(format!("Unknown extension: {id}")))?;
            match entry.lifecycle.request_activation() {
                crate::lifecycle::ActivationStep::Done(result) => return Ok(result),
                crate::lifecycle::ActivationStep::Pending => entry.wait_for_activation(),
                crate::lifecycle::ActivationStep::Send(msg) => {
                    let rx = entry.wait_for_activation();
                    let sent = entry.link.as_ref().is_some_and(|link| link.send(msg));
                    if !sent {
                        return Ok(ActivationResult::failed("worker channel closed"));
                    }
                    rx
                }
            }
        };

        let cx = Cx::for_request();
        match timeout(wall_now(), self.options.activation_timeout, rx.recv(&cx)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(ActivationResult::failed("worker exited during activation")),
            Err(_) => {
                tracing::warn!(extension_id = id, "Activation timed out");
                Ok(ActivationResult::failed("activation timed out"))
            }
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Execute a command by name. Never fails: every result is a
    /// [`CommandOutcome`]. Each call that resolves to a command appends
    /// exactly one history entry; unknown names append none.
    pub async fn execute_command(&self, name: &str, args: Vec<Value>) -> CommandOutcome {
        let started = Instant::now();
        let timestamp = Utc::now();
        let mut prepared = self.prepare(name, &args);
        if matches!(prepared, Prepared::NotFound) && self.activate_for_command(name).await {
            prepared = self.prepare(name, &args);
        }
        if let Prepared::AwaitActivation(owner) = prepared {
            // Registrations arrive before the activation result.
            if let Err(err) = self.activate(&owner).await {
                tracing::warn!(extension_id = %owner, command = name, error = %err, "Waiting for activation failed");
            }
            prepared = self.prepare(name, &args);
        }

        let outcome = match prepared {
            Prepared::NotFound => {
                tracing::warn!(command = name, "Command not found");
                return CommandOutcome::NotFound;
            }
            Prepared::Builtin(builtin) => {
                let value = self.lock().run_builtin(builtin);
                CommandOutcome::Completed(value)
            }
            Prepared::Refused(outcome) => outcome,
            Prepared::AwaitActivation(_) => CommandOutcome::NotActive,
            Prepared::Forward {
                request_id,
                extension_id,
                mut reply,
            } => {
                let cx = Cx::for_request();
                match timeout(wall_now(), self.options.command_timeout, reply.recv(&cx)).await {
                    Ok(Ok(result)) if result.ok => {
                        CommandOutcome::Completed(result.result.unwrap_or(Value::Null))
                    }
                    Ok(Ok(result)) => CommandOutcome::Failed(
                        result.error.unwrap_or_else(|| "command failed".to_string()),
                    ),
                    Ok(Err(_)) => {
                        tracing::warn!(command = name, extension_id = %extension_id, "Worker exited during command");
                        CommandOutcome::Unresponsive
                    }
                    Err(_) => {
                        self.lock().forget_pending(&request_id);
                        tracing::warn!(command = name, extension_id = %extension_id, "Command timed out");
                        CommandOutcome::Unresponsive
                    }
                }
            }
        };

        self.lock()
            .record(name, args, timestamp, started.elapsed(), &outcome);
        outcome
    }

    fn prepare(&self, name: &str, args: &[Value]) -> Prepared {
        let policy = self.policy.snapshot();
        self.lock()
            .prepare_execution(name, args, policy.as_deref(), &self.options.trusted)
    }

    /// Activate every not-yet-activated extension that declares
    /// `onCommand:<name>` (or `*`), so it gets a chance to register `name`.
    async fn activate_for_command(&self, name: &str) -> bool {
        let trigger = format!("{ON_COMMAND_PREFIX}{name}");
        let candidates: Vec<String> = {
            let state = self.lock();
            state
                .descriptors()
                .into_iter()
                .filter(|d| d.activates_on(&trigger))
                .filter(|d| {
                    state.state_of(&d.id).is_some_and(|s| {
                        matches!(
                            s,
                            LifecycleState::Spawned
                                | LifecycleState::AwaitingReady
                                | LifecycleState::Ready
                                | LifecycleState::Activating
                        )
                    })
                })
                .map(|d| d.id)
                .collect()
        };
        let mut activated = false;
        for id in candidates {
            match self.activate(&id).await {
                Ok(result) if result.ok => activated = true,
                Ok(result) => {
                    tracing::warn!(extension_id = %id, command = name, error = ?result.error, "Activation for command failed");
                }
                Err(err) => {
                    tracing::warn!(extension_id = %id, command = name, error = %err, "Activation for command failed");
                }
            }
        }
        activated
    }

    /// Deliver an event to every live worker, best effort. Returns how many
    /// workers accepted it.
    pub fn broadcast_event(&self, event_name: &str, payload: Value) -> usize {
        self.lock().broadcast_event(event_name, &payload)
    }

    pub fn set_active_editor(&self, editor: Option<Value>) {
        self.lock().set_active_editor(editor);
    }

    /// Swap the permission policy; in-flight checks keep their snapshot.
    pub fn set_policy(&self, policy: Option<PermissionPolicy>) {
        self.policy.replace(policy);
    }

    pub fn policy(&self) -> Option<Arc<PermissionPolicy>> {
        self.policy.snapshot()
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Ask a worker to deactivate; kill it if it outlives the grace period.
    pub async fn deactivate(&self, id: &str) -> Result<ExitReport> {
        let mut rx = {
            let mut state = self.lock();
            let entry = state
                .worker_mut(id)
                .ok_or_else(|| Error::extension(format!("Unknown extension: {id}")))?;
            if let Some(report) = entry.last_exit.clone() {
                return Ok(report);
            }
            let rx = entry.wait_for_exit();
            if let Some(msg) = entry.lifecycle.begin_deactivate() {
                if let Some(link) = &entry.link {
                    link.send(msg);
                }
            }
            rx
        };

        let cx = Cx::for_request();
        match timeout(wall_now(), self.options.deactivate_grace, rx.recv(&cx)).await {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(_)) => return Err(Error::extension(format!("Exit of {id} was not observed"))),
            Err(_) => {}
        }

        tracing::warn!(extension_id = id, "Worker ignored deactivate; killing");
        let mut rx = {
            let mut state = self.lock();
            let entry = state
                .worker_mut(id)
                .ok_or_else(|| Error::extension(format!("Unknown extension: {id}")))?;
            if let Some(report) = entry.last_exit.clone() {
                return Ok(report);
            }
            let rx = entry.wait_for_exit();
            if let Some(link) = &entry.link {
                link.kill();
            }
            rx
        };
        match timeout(wall_now(), self.options.deactivate_grace, rx.recv(&cx)).await {
            Ok(Ok(report)) => Ok(report),
            _ => Err(Error::extension(format!("Worker for {id} did not exit after kill"))),
        }
    }

    /// Deactivate every live worker concurrently and disable restarts.
    pub async fn shutdown(&self) -> Vec<ExitReport> {
        let ids = {
            let mut state = self.lock();
            state.begin_shutdown();
            state.live_workers()
        };
        let results = futures::future::join_all(ids.iter().map(|id| self.deactivate(id))).await;
        results
            .into_iter()
            .zip(ids)
            .filter_map(|(result, id)| match result {
                Ok(report) => Some(report),
                Err(err) => {
                    tracing::error!(extension_id = %id, error = %err, "Shutdown failed");
                    None
                }
            })
            .collect()
    }

    /// Wait until the current worker for `id` exits, without asking it to.
    pub async fn wait_for_exit(&self, id: &str, limit: Duration) -> Result<ExitReport> {
        let mut rx = {
            let mut state = self.lock();
            let entry = state
                .worker_mut(id)
                .ok_or_else(|| Error::extension(format!("Unknown extension: {id}")))?;
            if let Some(report) = entry.last_exit.clone() {
                return Ok(report);
            }
            entry.wait_for_exit()
        };
        let cx = Cx::for_request();
        match timeout(wall_now(), limit, rx.recv(&cx)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(Error::extension(format!("Exit of {id} was not observed"))),
            Err(_) => Err(Error::extension(format!("Timed out waiting for {id} to exit"))),
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn extensions(&self) -> Vec<ExtensionDescriptor> {
        self.lock().descriptors()
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.lock().state_of(id)
    }

    pub fn commands(&self) -> CommandListing {
        self.lock().registry().listing()
    }

    pub fn history(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.lock().registry().history().filter(filter)
    }

    pub fn history_newest_first(&self) -> Vec<HistoryEntry> {
        self.lock().registry().history().newest_first()
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> Option<ExitStatus> {
    loop {
        let polled = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match polled {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to observe worker exit");
                return None;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_is_opt_in() {
        assert_eq!(RestartPolicy::default().delay_for(0), None);
    }

    #[test]
    fn restart_backoff_doubles_until_limit() {
        let policy = RestartPolicy::OnCrash {
            max_restarts: 3,
            backoff_ms: 100,
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn restart_policy_deserializes() {
        let policy: RestartPolicy =
            serde_json::from_str(r#"{"policy":"onCrash","maxRestarts":2,"backoffMs":50}"#)
                .expect("parse");
        assert_eq!(
            policy,
            RestartPolicy::OnCrash {
                max_restarts: 2,
                backoff_ms: 50
            }
        );
        let never: RestartPolicy = serde_json::from_str(r#"{"policy":"never"}"#).expect("parse");
        assert_eq!(never, RestartPolicy::Never);
    }

    #[test]
    fn default_options_run_this_binary_as_worker() {
        let options = HostOptions::new("/tmp/exts");
        assert_eq!(options.worker_args, vec!["worker".to_string()]);
        assert_eq!(options.command_timeout, Duration::from_secs(30));
        assert_eq!(options.restart, RestartPolicy::Never);
    }

    #[test]
    fn unknown_extension_operations_fail_cleanly() {
        let host = Host::new(HostOptions::new("/nonexistent"), None);
        assert!(host.discover().is_err());
        assert_eq!(host.state_of("ghost"), None);
        assert_eq!(host.broadcast_event("x", Value::Null), 0);
        assert_eq!(host.commands().builtin.len(), 3);
    }
}
