//! Host-side protocol routing.
//!
//! [`HostState`] owns every piece of host bookkeeping: descriptors, one
//! [`WorkerEntry`] per extension, the command registry with its history, and
//! the pending command replies. All of it is mutated from one place at a time
//! behind the orchestrator's lock; process I/O lives in [`crate::host`].

use crate::commands::{
    CommandKind, CommandOutcome, CommandRegistry, HistoryEntry, RegisterError,
};
use crate::lifecycle::{ExitKind, ExitReport, ExtensionLifecycle, LifecycleState};
use crate::manifest::ExtensionDescriptor;
use crate::permissions::{self, PermissionPolicy, TrustedNamespaces};
use crate::protocol::{
    ActivationResult, CommandResultPayload, EventPayload, ExecuteCommandPayload, LogLevel,
    LogPayload, Message, RequestHostPayload,
};
use asupersync::Cx;
use asupersync::channel::oneshot;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::process::Child;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;
use uuid::Uuid;

pub const BUILTIN_LIST_EXTENSIONS: &str = "exthost.listExtensions";
pub const BUILTIN_LIST_COMMANDS: &str = "exthost.listCommands";
pub const BUILTIN_CLEAR_HISTORY: &str = "exthost.clearHistory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCommand {
    ListExtensions,
    ListCommands,
    ClearHistory,
}

impl BuiltinCommand {
    pub const ALL: [(&'static str, Self); 3] = [
        (BUILTIN_LIST_EXTENSIONS, Self::ListExtensions),
        (BUILTIN_LIST_COMMANDS, Self::ListCommands),
        (BUILTIN_CLEAR_HISTORY, Self::ClearHistory),
    ];
}

/// What a host-side registry entry points at. Handlers themselves stay in
/// the worker; the host only knows the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    Builtin(BuiltinCommand),
    Extension(String),
}

impl CommandTarget {
    fn is_owned_by(&self, extension_id: &str) -> bool {
        matches!(self, Self::Extension(owner) if owner == extension_id)
    }
}

/// Write side of one worker process.
pub struct WorkerLink {
    outbound: mpsc::Sender<Message>,
    process: Option<Arc<Mutex<Child>>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl WorkerLink {
    pub fn new(outbound: mpsc::Sender<Message>, process: Arc<Mutex<Child>>, pid: u32) -> Self {
        Self {
            outbound,
            process: Some(process),
            pid: Some(pid),
        }
    }

    /// A link with no process behind it, for driving the router directly.
    pub const fn detached(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            outbound,
            process: None,
            pid: None,
        }
    }

    pub fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).is_ok()
    }

    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill(&self) {
        if let Some(process) = &self.process {
            let mut child = process.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = child.kill() {
                tracing::debug!(pid = ?self.pid, error = %err, "Kill failed (already exited?)");
            }
        }
    }
}

pub struct WorkerEntry {
    pub generation: u64,
    pub lifecycle: ExtensionLifecycle,
    pub link: Option<WorkerLink>,
    pub restarts: u32,
    pub last_exit: Option<ExitReport>,
    activation_waiters: Vec<oneshot::Sender<ActivationResult>>,
    exit_waiters: Vec<oneshot::Sender<ExitReport>>,
}

impl std::fmt::Debug for WorkerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEntry")
            .field("generation", &self.generation)
            .field("state", &self.lifecycle.state())
            .field("link", &self.link)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

impl WorkerEntry {
    fn send_all(&self, messages: Vec<Message>) -> usize {
        let Some(link) = &self.link else {
            return 0;
        };
        messages.into_iter().map(|msg| link.send(msg)).filter(|sent| *sent).count()
    }

    pub fn wait_for_activation(&mut self) -> oneshot::Receiver<ActivationResult> {
        let (tx, rx) = oneshot::channel();
        self.activation_waiters.push(tx);
        rx
    }

    pub fn wait_for_exit(&mut self) -> oneshot::Receiver<ExitReport> {
        let (tx, rx) = oneshot::channel();
        self.exit_waiters.push(tx);
        rx
    }

    fn notify_activation(&mut self, result: &ActivationResult) {
        let cx = Cx::for_request();
        for waiter in self.activation_waiters.drain(..) {
            let _ = waiter.send(&cx, result.clone());
        }
    }
}

struct PendingCommand {
    extension_id: String,
    reply: oneshot::Sender<CommandResultPayload>,
}

/// How an execution request was resolved before any waiting happens.
pub enum Prepared {
    NotFound,
    Builtin(BuiltinCommand),
    /// Resolved but refused; recorded like any other outcome.
    Refused(CommandOutcome),
    /// The owner is still activating; prepare again once activation settles.
    AwaitActivation(String),
    Forward {
        request_id: String,
        extension_id: String,
        reply: oneshot::Receiver<CommandResultPayload>,
    },
}

/// Facts about a worker that just exited, for restart decisions.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub report: ExitReport,
    pub restarts: u32,
    pub was_activated: bool,
    pub removed_commands: Vec<String>,
}

pub struct HostState {
    descriptors: BTreeMap<String, ExtensionDescriptor>,
    workers: BTreeMap<String, WorkerEntry>,
    registry: CommandRegistry<CommandTarget>,
    pending: HashMap<String, PendingCommand>,
    active_editor: Option<Value>,
    next_generation: u64,
    shutting_down: bool,
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("extensions", &self.descriptors.len())
            .field("workers", &self.workers.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl HostState {
    pub fn new(history_capacity: usize) -> Self {
        let mut registry = CommandRegistry::with_history_capacity(history_capacity);
        for (name, builtin) in BuiltinCommand::ALL {
            let registered =
                registry.register_named(name, CommandKind::Builtin, CommandTarget::Builtin(builtin));
            debug_assert!(registered.is_ok());
        }
        Self {
            descriptors: BTreeMap::new(),
            workers: BTreeMap::new(),
            registry,
            pending: HashMap::new(),
            active_editor: None,
            next_generation: 0,
            shutting_down: false,
        }
    }

    // ─── Bookkeeping ────────────────────────────────────────────────────

    pub fn set_descriptors(&mut self, descriptors: &[ExtensionDescriptor]) {
        for descriptor in descriptors {
            self.descriptors
                .insert(descriptor.id.clone(), descriptor.clone());
        }
    }

    pub fn descriptor(&self, id: &str) -> Option<&ExtensionDescriptor> {
        self.descriptors.get(id)
    }

    pub fn descriptors(&self) -> Vec<ExtensionDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    pub fn worker_mut(&mut self, id: &str) -> Option<&mut WorkerEntry> {
        self.workers.get_mut(id)
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.workers.get(id).map(|w| w.lifecycle.state())
    }

    pub fn live_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, w)| w.lifecycle.state().is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub const fn registry(&self) -> &CommandRegistry<CommandTarget> {
        &self.registry
    }

    pub const fn registry_mut(&mut self) -> &mut CommandRegistry<CommandTarget> {
        &mut self.registry
    }

    pub fn set_active_editor(&mut self, editor: Option<Value>) {
        self.active_editor = editor;
    }

    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub const fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    /// Install a freshly spawned worker, replacing any previous entry for the
    /// same extension. Returns the new generation.
    pub fn install_worker(
        &mut self,
        descriptor: &ExtensionDescriptor,
        link: WorkerLink,
        restarts: u32,
        reactivate: bool,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let context = activation_context(descriptor);
        let mut lifecycle =
            ExtensionLifecycle::new(descriptor.id.clone(), descriptor.triggers.clone(), context);
        lifecycle.spawned();
        if reactivate {
            let _ = lifecycle.request_activation();
        }
        self.descriptors
            .entry(descriptor.id.clone())
            .or_insert_with(|| descriptor.clone());
        self.workers.insert(
            descriptor.id.clone(),
            WorkerEntry {
                generation,
                lifecycle,
                link: Some(link),
                restarts,
                last_exit: None,
                activation_waiters: Vec::new(),
                exit_waiters: Vec::new(),
            },
        );
        generation
    }

    fn current(&mut self, id: &str, generation: u64) -> Option<&mut WorkerEntry> {
        self.workers
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
    }

    // ─── Worker → host ──────────────────────────────────────────────────

    /// Apply one validated worker message. A `request_host` needs I/O and is
    /// handed back to the caller.
    pub fn route(
        &mut self,
        extension_id: &str,
        generation: u64,
        msg: Message,
    ) -> Option<RequestHostPayload> {
        if self.current(extension_id, generation).is_none() {
            tracing::debug!(extension_id, kind = msg.kind(), "Dropping message from stale worker");
            return None;
        }
        match msg {
            Message::Ready => {
                if let Some(entry) = self.current(extension_id, generation) {
                    let out = entry.lifecycle.on_ready();
                    tracing::debug!(extension_id, flushed = out.len(), "Worker ready");
                    entry.send_all(out);
                }
            }
            Message::ActivationResult(result) => self.on_activation_result(extension_id, result),
            Message::RegisterCommand(payload) => {
                self.register_command(extension_id, &payload.command, payload.kind);
            }
            Message::UnregisterCommand(payload) => {
                let removed = self
                    .registry
                    .unregister(&payload.command, |t| t.is_owned_by(extension_id));
                tracing::debug!(extension_id, command = %payload.command, removed, "Command disposed");
            }
            Message::CommandResult(result) => self.complete_command(extension_id, result),
            Message::Log(log) => emit_log(extension_id, &log),
            Message::RequestHost(request) => return Some(request),
            other => {
                tracing::warn!(extension_id, kind = other.kind(), "Unexpected message from worker");
            }
        }
        None
    }

    fn on_activation_result(&mut self, extension_id: &str, result: ActivationResult) {
        let Some(entry) = self.workers.get_mut(extension_id) else {
            return;
        };
        if !entry.lifecycle.on_activation_result(result.clone()) {
            tracing::debug!(extension_id, "Ignoring unsolicited activation result");
            return;
        }
        if result.ok {
            tracing::info!(extension_id, "Extension activated");
        } else {
            tracing::error!(
                extension_id,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "Extension activation failed"
            );
        }
        entry.notify_activation(&result);
    }

    pub fn register_command(
        &mut self,
        extension_id: &str,
        command: &str,
        kind: CommandKind,
    ) -> Option<RegisterError> {
        let kind = match kind {
            CommandKind::Builtin => {
                tracing::warn!(extension_id, command, "Extensions cannot register builtin commands");
                CommandKind::Generic
            }
            other => other,
        };
        if self.registry.lookup(command).is_some_and(|r| r.kind == CommandKind::Builtin) {
            tracing::warn!(extension_id, command, "Command is hidden by a builtin of the same name");
        }
        match self.registry.register(
            &Value::String(command.to_string()),
            kind,
            Some(CommandTarget::Extension(extension_id.to_string())),
        ) {
            Ok(registration) => {
                tracing::debug!(extension_id, command, kind = kind.as_str(), shadowed = registration.shadowed, "Command registered");
                None
            }
            Err(err) => {
                tracing::warn!(extension_id, command, error = %err, "Rejected command registration");
                Some(err)
            }
        }
    }

    fn complete_command(&mut self, extension_id: &str, result: CommandResultPayload) {
        let Some(pending) = self.pending.remove(&result.request_id) else {
            tracing::debug!(extension_id, request_id = %result.request_id, "Late or unknown command result");
            return;
        };
        if pending.extension_id != extension_id {
            tracing::warn!(extension_id, owner = %pending.extension_id, "Command result from the wrong worker");
            self.pending.insert(result.request_id.clone(), pending);
            return;
        }
        let cx = Cx::for_request();
        if pending.reply.send(&cx, result).is_err() {
            tracing::trace!(extension_id, "Command caller went away before the result arrived");
        }
    }

    // ─── Host → worker ──────────────────────────────────────────────────

    /// Resolve an execution request: lookup, permission, editor context, and
    /// activation state, in that order.
    pub fn prepare_execution(
        &mut self,
        name: &str,
        args: &[Value],
        policy: Option<&PermissionPolicy>,
        trusted: &TrustedNamespaces,
    ) -> Prepared {
        let Some(resolved) = self.registry.lookup(name) else {
            return Prepared::NotFound;
        };
        let kind = resolved.kind;
        let owner = match resolved.handler {
            CommandTarget::Builtin(builtin) => return Prepared::Builtin(*builtin),
            CommandTarget::Extension(owner) => owner.clone(),
        };

        let check = permissions::check_command(name, policy, false, trusted);
        if !check.is_allowed() {
            tracing::warn!(command = name, extension_id = %owner, reason = %check.reason, "Command not allowed");
            return Prepared::Refused(CommandOutcome::NotAllowed(check.reason));
        }

        let editor = if kind == CommandKind::TextEditor {
            match &self.active_editor {
                Some(editor) => Some(editor.clone()),
                None => return Prepared::Refused(CommandOutcome::NoActiveEditor),
            }
        } else {
            None
        };

        let request_id = Uuid::new_v4().to_string();
        let Some(entry) = self.workers.get_mut(&owner) else {
            return Prepared::Refused(CommandOutcome::NotActive);
        };
        match entry.lifecycle.state() {
            LifecycleState::Activated => {}
            LifecycleState::Activating => return Prepared::AwaitActivation(owner),
            _ => return Prepared::Refused(CommandOutcome::NotActive),
        }
        let msg = Message::ExecuteCommand(ExecuteCommandPayload {
            request_id: request_id.clone(),
            command: name.to_string(),
            args: args.to_vec(),
            editor,
        });
        let sent = entry
            .lifecycle
            .enqueue(msg)
            .is_some_and(|msg| entry.send_all(vec![msg]) == 1);
        if !sent {
            return Prepared::Refused(CommandOutcome::Unresponsive);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingCommand {
                extension_id: owner.clone(),
                reply: tx,
            },
        );
        Prepared::Forward {
            request_id,
            extension_id: owner,
            reply: rx,
        }
    }

    pub fn forget_pending(&mut self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn run_builtin(&mut self, builtin: BuiltinCommand) -> Value {
        match builtin {
            BuiltinCommand::ListExtensions => Value::Array(
                self.descriptors
                    .values()
                    .map(|d| {
                        json!({
                            "id": d.id,
                            "root": d.root,
                            "triggers": d.triggers,
                            "state": self.state_of(&d.id).map(LifecycleState::as_str),
                        })
                    })
                    .collect(),
            ),
            BuiltinCommand::ListCommands => {
                serde_json::to_value(self.registry.listing()).unwrap_or(Value::Null)
            }
            BuiltinCommand::ClearHistory => {
                self.registry.history_mut().clear();
                Value::Null
            }
        }
    }

    pub fn record(
        &mut self,
        command: &str,
        args: Vec<Value>,
        timestamp: DateTime<Utc>,
        elapsed: Duration,
        outcome: &CommandOutcome,
    ) {
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.registry.history_mut().record(HistoryEntry::from_outcome(
            command,
            args,
            timestamp,
            duration_ms,
            outcome,
        ));
    }

    /// Fan an event out to every live worker. Returns how many accepted it.
    pub fn broadcast_event(&mut self, event_name: &str, payload: &Value) -> usize {
        let mut accepted = 0;
        for (id, entry) in &mut self.workers {
            if !entry.lifecycle.state().is_live() || entry.link.is_none() {
                continue;
            }
            let before = entry.lifecycle.queued();
            let out = entry.lifecycle.deliver_event(EventPayload {
                event_name: event_name.to_string(),
                payload: payload.clone(),
            });
            if out.is_empty() {
                if entry.lifecycle.queued() > before {
                    accepted += 1;
                }
                continue;
            }
            let expected = out.len();
            if entry.send_all(out) == expected {
                accepted += 1;
            } else {
                tracing::warn!(extension_id = %id, event = event_name, "Failed to deliver event");
            }
        }
        accepted
    }

    // ─── Exit ───────────────────────────────────────────────────────────

    /// Record a process exit and undo everything the worker owned.
    pub fn worker_exited(
        &mut self,
        extension_id: &str,
        generation: u64,
        code: Option<i32>,
        signal: Option<i32>,
    ) -> Option<ExitNotice> {
        let entry = self.current(extension_id, generation)?;
        let was_activated = entry.lifecycle.wants_activation();
        let report = entry.lifecycle.on_exit(code, signal);
        entry.link = None;
        entry.last_exit = Some(report.clone());
        entry.notify_activation(&ActivationResult::failed("worker exited"));
        let cx = Cx::for_request();
        for waiter in entry.exit_waiters.drain(..) {
            let _ = waiter.send(&cx, report.clone());
        }
        let restarts = entry.restarts;

        let removed_commands = self.registry.retain(|t| !t.is_owned_by(extension_id));
        // Dropping the senders resolves waiting callers as unresponsive.
        self.pending.retain(|_, p| p.extension_id != extension_id);

        match report.kind {
            ExitKind::Deactivated => {
                tracing::info!(extension_id, code = ?code, "Worker exited after deactivation");
            }
            ExitKind::FailedDeactivation => {
                tracing::warn!(extension_id, code = ?code, signal = ?signal, "Worker failed to deactivate cleanly");
            }
            ExitKind::Crashed => {
                tracing::warn!(extension_id, code = ?code, signal = ?signal, "Worker crashed");
            }
        }
        Some(ExitNotice {
            report,
            restarts,
            was_activated,
            removed_commands,
        })
    }
}

/// The `context` sent with `activate`.
pub fn activation_context(descriptor: &ExtensionDescriptor) -> Value {
    json!({
        "extensionId": descriptor.id,
        "extensionPath": descriptor.root,
        "storagePath": descriptor.root,
        "contributes": descriptor.contributes,
    })
}

fn emit_log(extension_id: &str, log: &LogPayload) {
    let line = log.render();
    match log.level {
        LogLevel::Trace => tracing::trace!(extension_id, "{line}"),
        LogLevel::Debug => tracing::debug!(extension_id, "{line}"),
        LogLevel::Info => tracing::info!(extension_id, "{line}"),
        LogLevel::Warn => tracing::warn!(extension_id, "{line}"),
        LogLevel::Error => tracing::error!(extension_id, "{line}"),
    }
}
