//! Embedded QuickJS runtime that hosts one extension.
//!
//! Rust and JS talk through two small surfaces. JS sees a private `__host`
//! object whose functions only touch [`WorkerState`] and never call back into
//! JS. Rust drives JS through the hooks on `__exthost` installed by
//! `worker_bootstrap.js`. Everything crossing the boundary is a JSON string.

use crate::commands::{CommandKind, CommandRegistry};
use crate::error::{Error, Result};
use crate::loader::{LoaderStrategy, Resolution, SandboxedLoader};
use crate::protocol::{
    ActivationResult, CommandResultPayload, EXIT_CLEAN, EXIT_DEACTIVATE_FAILED, Message,
    RegisterCommandPayload, UnregisterCommandPayload,
};
use crate::storage::{Memento, StateScope, state_file_name};
use crate::worker::WorkerEnv;
use rquickjs::function::{Func, IntoArgs};
use rquickjs::{Context, Ctx, Exception, Function, Object, Runtime};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

const BOOTSTRAP_JS: &str = include_str!("worker_bootstrap.js");

/// Modules `require` can load by bare name besides the facade.
pub const BUILTIN_MODULES: [&str; 1] = ["path"];

/// Browser-style clamp for timer delays.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

struct WorkerState {
    loader: SandboxedLoader,
    registry: CommandRegistry<u32>,
    next_slot: u32,
    outbox: Vec<Message>,
    timers: BinaryHeap<Reverse<(Instant, u32)>>,
    global_state: Memento,
    workspace_state: Memento,
    violation: Option<String>,
    exit_code: Option<i32>,
}

impl WorkerState {
    fn memento_mut(&mut self, scope: StateScope) -> &mut Memento {
        match scope {
            StateScope::Global => &mut self.global_state,
            StateScope::Workspace => &mut self.workspace_state,
        }
    }

    fn memento(&self, scope: StateScope) -> &Memento {
        match scope {
            StateScope::Global => &self.global_state,
            StateScope::Workspace => &self.workspace_state,
        }
    }
}

pub struct JsWorker {
    runtime: Runtime,
    context: Context,
    state: Rc<RefCell<WorkerState>>,
    extension_id: String,
    main: PathBuf,
}

impl std::fmt::Debug for JsWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsWorker")
            .field("extension_id", &self.extension_id)
            .field("main", &self.main)
            .finish_non_exhaustive()
    }
}

impl JsWorker {
    pub fn new(env: &WorkerEnv) -> Result<Self> {
        let runtime = Runtime::new().map_err(map_js_error)?;
        if let Some(limit_mb) = env.memory_limit_mb {
            let bytes = usize::try_from(limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX);
            runtime.set_memory_limit(bytes);
        }
        let context = Context::full(&runtime).map_err(map_js_error)?;

        let loader = SandboxedLoader::new(&env.root).with_builtins(BUILTIN_MODULES);
        let main = env.main.canonicalize().unwrap_or_else(|_| env.main.clone());
        let state = WorkerState {
            global_state: Memento::open(
                loader.root().join(state_file_name(&env.extension_id, StateScope::Global)),
            ),
            workspace_state: Memento::open(
                env.workspace
                    .join(state_file_name(&env.extension_id, StateScope::Workspace)),
            ),
            loader,
            registry: CommandRegistry::new(),
            next_slot: 1,
            outbox: Vec::new(),
            timers: BinaryHeap::new(),
            violation: None,
            exit_code: None,
        };

        let worker = Self {
            runtime,
            context,
            state: Rc::new(RefCell::new(state)),
            extension_id: env.extension_id.clone(),
            main,
        };
        worker
            .context
            .with(|ctx| {
                install_host(&ctx, &worker.extension_id, &worker.state)?;
                ctx.eval::<(), _>(BOOTSTRAP_JS)
            })
            .map_err(map_js_error)?;
        Ok(worker)
    }

    /// Apply one host message.
    pub fn handle(&self, msg: Message) {
        match msg {
            Message::Activate(payload) => {
                let main = self.main.to_string_lossy().into_owned();
                if let Err(err) = self.call_hook("activate", (payload.context.to_string(), main)) {
                    self.push(Message::ActivationResult(ActivationResult::failed(err)));
                }
            }
            Message::Deactivate => {
                if let Err(err) = self.call_hook("deactivate", ()) {
                    tracing::error!(extension_id = %self.extension_id, error = %err, "Deactivate hook failed");
                    self.state.borrow_mut().exit_code = Some(EXIT_DEACTIVATE_FAILED);
                }
            }
            Message::Event(event) => {
                if let Err(err) = self.call_hook("emit", (event.event_name, event.payload.to_string())) {
                    tracing::warn!(extension_id = %self.extension_id, error = %err, "Event dispatch failed");
                }
            }
            Message::ExecuteCommand(exec) => {
                let request_id = exec.request_id.clone();
                let args = Value::Array(exec.args).to_string();
                let editor = exec.editor.map(|editor| editor.to_string());
                if let Err(err) = self.call_hook("execute", (exec.request_id, exec.command, args, editor)) {
                    self.push(Message::CommandResult(CommandResultPayload {
                        request_id,
                        ok: false,
                        result: None,
                        error: Some(err),
                    }));
                }
            }
            Message::HostResponse(response) => {
                let encoded = serde_json::to_string(&response).unwrap_or_default();
                if let Err(err) = self.call_hook("resolveHost", (encoded,)) {
                    tracing::warn!(extension_id = %self.extension_id, error = %err, "Host response dispatch failed");
                }
            }
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring message meant for the host");
            }
        }
    }

    /// Fire every timer whose deadline has passed.
    pub fn fire_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<u32> = {
            let mut state = self.state.borrow_mut();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, id))) = state.timers.peek().copied() {
                if deadline > now {
                    break;
                }
                state.timers.pop();
                due.push(id);
            }
            due
        };
        for id in due {
            if let Err(err) = self.call_hook("fireTimer", (id,)) {
                tracing::warn!(extension_id = %self.extension_id, timer = id, error = %err, "Timer dispatch failed");
            }
        }
    }

    /// Drain the microtask queue.
    pub fn run_pending_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    tracing::error!(extension_id = %self.extension_id, "Uncaught exception in a pending job");
                }
            }
        }
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.state
            .borrow()
            .timers
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
    }

    pub fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.borrow_mut().outbox)
    }

    /// Set once extension code attempted to load outside its root.
    pub fn violation(&self) -> Option<String> {
        self.state.borrow().violation.clone()
    }

    /// Set once deactivation has finished.
    pub fn exit_code(&self) -> Option<i32> {
        self.state.borrow().exit_code
    }

    pub fn command_names(&self) -> Vec<String> {
        self.state.borrow().registry.names()
    }

    fn push(&self, msg: Message) {
        self.state.borrow_mut().outbox.push(msg);
    }

    fn call_hook<A>(&self, name: &str, args: A) -> std::result::Result<(), String>
    where
        A: for<'js> IntoArgs<'js>,
    {
        self.context.with(|ctx| {
            let result = (|| -> rquickjs::Result<()> {
                let hooks: Object<'_> = ctx.globals().get("__exthost")?;
                let hook: Function<'_> = hooks.get(name)?;
                hook.call::<_, ()>(args)
            })();
            result.map_err(|err| describe_js_error(&ctx, err))
        })
    }
}

fn install_host(
    ctx: &Ctx<'_>,
    extension_id: &str,
    state: &Rc<RefCell<WorkerState>>,
) -> rquickjs::Result<()> {
    let host = Object::new(ctx.clone())?;
    host.set("extensionId", extension_id.to_string())?;

    let st = Rc::clone(state);
    host.set(
        "post",
        Func::from(move |ctx: Ctx<'_>, json: String| -> rquickjs::Result<()> {
            let msg = Message::parse_directed(&json, crate::protocol::Direction::WorkerToHost)
                .map_err(|err| Exception::throw_type(&ctx, &err.to_string()))?;
            if !matches!(
                msg,
                Message::Log(_)
                    | Message::ActivationResult(_)
                    | Message::CommandResult(_)
                    | Message::RequestHost(_)
            ) {
                return Err(Exception::throw_type(
                    &ctx,
                    &format!("'{}' cannot be posted directly", msg.kind()),
                ));
            }
            st.borrow_mut().outbox.push(msg);
            Ok(())
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "register",
        Func::from(
            move |ctx: Ctx<'_>, name: String, callable: bool, kind: String| -> rquickjs::Result<u32> {
                let name: Value = serde_json::from_str(&name).unwrap_or(Value::Null);
                let kind = if kind == "textEditor" {
                    CommandKind::TextEditor
                } else {
                    CommandKind::Generic
                };
                let mut state = st.borrow_mut();
                let slot = state.next_slot;
                match state.registry.register(&name, kind, callable.then_some(slot)) {
                    Ok(registration) => {
                        state.next_slot += 1;
                        state.outbox.push(Message::RegisterCommand(RegisterCommandPayload {
                            command: registration.name,
                            kind,
                        }));
                        Ok(slot)
                    }
                    Err(err) => {
                        drop(state);
                        Err(Exception::throw_type(&ctx, &err.to_string()))
                    }
                }
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "unregister",
        Func::from(move |name: String, slot: u32| -> bool {
            let mut state = st.borrow_mut();
            let removed = state.registry.unregister(&name, |owner| *owner == slot);
            if removed {
                state
                    .outbox
                    .push(Message::UnregisterCommand(UnregisterCommandPayload { command: name }));
            }
            removed
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "resolve",
        Func::from(move |name: String| -> Option<u32> {
            st.borrow().registry.lookup(&name).map(|resolved| *resolved.handler)
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "commandNames",
        Func::from(move || -> String {
            serde_json::to_string(&st.borrow().registry.names()).unwrap_or_else(|_| "[]".to_string())
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "require",
        Func::from(
            move |ctx: Ctx<'_>, specifier: String, from: Option<String>| -> rquickjs::Result<String> {
                let resolved = st
                    .borrow()
                    .loader
                    .resolve(&specifier, from.as_deref().map(Path::new));
                match resolved {
                    Ok(resolution) => load_resolution(resolution)
                        .map_err(|message| Exception::throw_message(&ctx, &message)),
                    Err(err) => {
                        if err.is_fatal() {
                            tracing::error!(specifier = %specifier, error = %err, "Sandbox violation");
                            st.borrow_mut()
                                .violation
                                .get_or_insert_with(|| err.to_string());
                        }
                        Err(Exception::throw_message(&ctx, &err.to_string()))
                    }
                }
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "timer",
        Func::from(move |id: u32, ms: f64| {
            let ms = if ms.is_finite() {
                ms.clamp(0.0, MAX_TIMER_DELAY_MS)
            } else {
                0.0
            };
            let deadline = Instant::now() + Duration::from_secs_f64(ms / 1000.0);
            st.borrow_mut().timers.push(Reverse((deadline, id)));
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "stateGet",
        Func::from(
            move |ctx: Ctx<'_>, scope: String, key: String| -> rquickjs::Result<Option<String>> {
                let scope = parse_scope(&ctx, &scope)?;
                Ok(st.borrow().memento(scope).get(&key).map(Value::to_string))
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "stateUpdate",
        Func::from(
            move |ctx: Ctx<'_>, scope: String, key: String, json: String| -> rquickjs::Result<()> {
                let scope = parse_scope(&ctx, &scope)?;
                let value: Value = serde_json::from_str(&json)
                    .map_err(|err| Exception::throw_type(&ctx, &err.to_string()))?;
                let result = st.borrow_mut().memento_mut(scope).update(&key, value);
                result.map_err(|err| Exception::throw_message(&ctx, &err.to_string()))
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "stateKeys",
        Func::from(move |ctx: Ctx<'_>, scope: String| -> rquickjs::Result<String> {
            let scope = parse_scope(&ctx, &scope)?;
            let keys = st.borrow().memento(scope).keys();
            Ok(serde_json::to_string(&keys).unwrap_or_else(|_| "[]".to_string()))
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "finish",
        Func::from(move |ok: bool| {
            st.borrow_mut().exit_code = Some(if ok { EXIT_CLEAN } else { EXIT_DEACTIVATE_FAILED });
        }),
    )?;

    ctx.globals().set("__host", host)?;
    Ok(())
}

fn parse_scope(ctx: &Ctx<'_>, raw: &str) -> rquickjs::Result<StateScope> {
    StateScope::parse(raw)
        .ok_or_else(|| Exception::throw_type(ctx, &format!("Unknown state scope: {raw}")))
}

/// Describe a resolved module for the JS loader.
fn load_resolution(resolution: Resolution) -> std::result::Result<String, String> {
    let described = match resolution {
        Resolution::Facade => json!({ "kind": "facade" }),
        Resolution::Builtin(name) => json!({ "kind": "builtin", "name": name }),
        Resolution::File(path) => {
            let path = path.canonicalize().unwrap_or(path);
            let source = std::fs::read_to_string(&path)
                .map_err(|err| format!("Cannot read module {}: {err}", path.display()))?;
            let kind = if path.extension().is_some_and(|ext| ext == "json") {
                "json"
            } else {
                "file"
            };
            json!({
                "kind": kind,
                "path": path,
                "dirname": path.parent().unwrap_or_else(|| Path::new("/")),
                "source": source,
            })
        }
    };
    Ok(described.to_string())
}

fn describe_js_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let caught = ctx.catch();
    caught
        .as_exception()
        .and_then(Exception::message)
        .unwrap_or_else(|| "uncaught exception".to_string())
}

fn map_js_error(err: rquickjs::Error) -> Error {
    Error::extension(format!("QuickJS: {err}"))
}
