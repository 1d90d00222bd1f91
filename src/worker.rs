//! Worker process entry point.
//!
//! stdout carries protocol frames only; logs go to stderr. The loop sends
//! `ready`, then alternates between host frames, due timers and pending JS
//! jobs until deactivation finishes, a sandbox violation occurs, or the host
//! closes stdin.

use crate::error::{Error, Result};
use crate::protocol::{
    Direction, EXIT_CLEAN, EXIT_CONFIG, EXIT_SANDBOX_VIOLATION, LogLevel, LogPayload, Message,
};
use crate::worker_js::JsWorker;
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

pub const ENV_EXTENSION_ID: &str = "EXTENSION_ID";
pub const ENV_EXTENSION_MAIN: &str = "EXTENSION_MAIN";
pub const ENV_EXTENSION_DIR: &str = "EXTENSION_DIR";
pub const ENV_MEMORY_LIMIT_MB: &str = "EXTENSION_MEMORY_LIMIT_MB";

/// What a worker needs to know about its extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub extension_id: String,
    pub main: PathBuf,
    pub root: PathBuf,
    /// Directory for workspace-scoped state; the worker's cwd.
    pub workspace: PathBuf,
    pub memory_limit_mb: Option<u64>,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self> {
        let mut env = Self::from_lookup(|key| std::env::var(key).ok())?;
        if let Ok(cwd) = std::env::current_dir() {
            env.workspace = cwd;
        }
        Ok(env)
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            get(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| Error::config(format!("{key} is not set")))
        };
        let extension_id = require(ENV_EXTENSION_ID)?;
        let main = PathBuf::from(require(ENV_EXTENSION_MAIN)?);
        let root = PathBuf::from(require(ENV_EXTENSION_DIR)?);
        let memory_limit_mb = match get(ENV_MEMORY_LIMIT_MB) {
            Some(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|err| {
                Error::config(format!("Invalid {ENV_MEMORY_LIMIT_MB} '{raw}': {err}"))
            })?),
            _ => None,
        };
        Ok(Self {
            extension_id,
            main,
            workspace: root.clone(),
            root,
            memory_limit_mb,
        })
    }
}

/// Run the worker over the process's stdio. Returns the exit code.
pub fn run() -> i32 {
    let env = match WorkerEnv::from_env() {
        Ok(env) => env,
        Err(err) => {
            tracing::error!(error = %err, "Invalid worker environment");
            return EXIT_CONFIG;
        }
    };
    let stdin = std::io::BufReader::new(std::io::stdin());
    let mut stdout = std::io::stdout();
    match run_with(&env, stdin, &mut stdout) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(extension_id = %env.extension_id, error = %err, "Worker failed");
            EXIT_CONFIG
        }
    }
}

pub fn run_with<R, W>(env: &WorkerEnv, input: R, output: &mut W) -> Result<i32>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let worker = JsWorker::new(env)?;
    tracing::debug!(extension_id = %env.extension_id, main = %env.main.display(), "Worker started");
    Message::Ready.write_frame(output)?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        // Nothing produced after a violation reaches the host.
        let outbox = worker.take_outbox();
        if let Some(violation) = worker.violation() {
            let report = Message::Log(LogPayload {
                level: LogLevel::Error,
                payload: vec![Value::String(format!("Sandbox violation: {violation}"))],
            });
            report.write_frame(output)?;
            tracing::error!(extension_id = %env.extension_id, %violation, "Terminating worker");
            return Ok(EXIT_SANDBOX_VIOLATION);
        }
        for msg in outbox {
            msg.write_frame(output)?;
        }
        if let Some(code) = worker.exit_code() {
            tracing::debug!(extension_id = %env.extension_id, code, "Deactivated");
            return Ok(code);
        }

        let received = match worker.next_timer_deadline() {
            Some(deadline) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(line) => Some(line),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(line) => Some(line),
                Err(_) => break,
            },
        };

        if let Some(line) = received.filter(|line| !line.trim().is_empty()) {
            match Message::parse_directed(&line, Direction::HostToWorker) {
                Ok(msg) => worker.handle(msg),
                Err(err) => {
                    tracing::warn!(extension_id = %env.extension_id, error = %err, "Rejected host frame");
                }
            }
        }
        worker.fire_due_timers();
        worker.run_pending_jobs();
    }

    tracing::info!(extension_id = %env.extension_id, "Host closed the channel");
    Ok(EXIT_CLEAN)
}
