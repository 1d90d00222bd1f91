//! Privileged operations a worker may ask the host to perform.
//!
//! Every reply travels back as a `host_response` on the worker's outbound
//! channel. Slow actions run on their own thread so the worker's reader
//! thread never blocks.

use crate::loader::is_within;
use crate::permissions::{self, PermissionPolicy};
use crate::protocol::{HostResponsePayload, Message, RequestHostPayload};
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

/// Everything a request handler may touch.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub extension_id: String,
    pub root: PathBuf,
    pub policy: Option<Arc<PermissionPolicy>>,
    pub exec_timeout: Duration,
    pub reply: mpsc::Sender<Message>,
}

impl RequestContext {
    fn respond(&self, response: HostResponsePayload) {
        if self.reply.send(Message::HostResponse(response)).is_err() {
            tracing::debug!(extension_id = %self.extension_id, "Worker gone before host response");
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReadFileParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ShowMessageParams {
    #[serde(default)]
    level: Option<String>,
    message: String,
}

pub fn handle(request: RequestHostPayload, ctx: RequestContext) {
    let RequestHostPayload {
        request_id,
        action,
        params,
    } = request;
    tracing::debug!(extension_id = %ctx.extension_id, action = %action, "Host request");
    match action.as_str() {
        "exec" => exec(request_id, params, ctx),
        "read_file" | "readFile" => {
            let response = match read_file(&ctx.root, params) {
                Ok(value) => HostResponsePayload::ok(request_id, value),
                Err(err) => HostResponsePayload::err(request_id, err),
            };
            ctx.respond(response);
        }
        "show_message" | "showMessage" => {
            let response = match show_message(&ctx.extension_id, params) {
                Ok(()) => HostResponsePayload::ok(request_id, Value::Null),
                Err(err) => HostResponsePayload::err(request_id, err),
            };
            ctx.respond(response);
        }
        other => {
            tracing::warn!(extension_id = %ctx.extension_id, action = other, "Unknown host action");
            ctx.respond(HostResponsePayload::err(
                request_id,
                format!("Unknown host action: {other}"),
            ));
        }
    }
}

/// The policy sees `program arg1 arg2 ..` as one string, so deny entries
/// only match leading arguments: `git push` blocks `git push origin` but not
/// `git -C . push`.
fn exec(request_id: String, params: Value, ctx: RequestContext) {
    let params: ExecParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => {
            ctx.respond(HostResponsePayload::err(
                request_id,
                format!("Invalid exec params: {err}"),
            ));
            return;
        }
    };

    let command_line = std::iter::once(params.command.as_str())
        .chain(params.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    let check = permissions::evaluate(&command_line, ctx.policy.as_deref());
    if !check.is_allowed() {
        tracing::warn!(extension_id = %ctx.extension_id, command = %command_line, reason = %check.reason, "Exec denied");
        ctx.respond(HostResponsePayload::err(
            request_id,
            format!("Command not allowed: {} ({})", params.command, check.reason),
        ));
        return;
    }

    let timeout = params
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map_or(ctx.exec_timeout, Duration::from_millis);
    thread::spawn(move || {
        let response = match run_process(&params.command, &params.args, &ctx.root, timeout) {
            Ok(value) => HostResponsePayload::ok(request_id, value),
            Err(err) => HostResponsePayload::err(request_id, err),
        };
        ctx.respond(response);
    });
}

fn run_process(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> std::result::Result<Value, String> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format!("Failed to run {program}: {err}"))?;

    let mut stdout = child.stdout.take().ok_or("Missing stdout pipe")?;
    let mut stderr = child.stderr.take().ok_or("Missing stderr pipe")?;
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut killed = false;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|err| err.to_string())? {
            break status;
        }
        if start.elapsed() >= timeout {
            killed = true;
            let _ = child.kill();
            break child.wait().map_err(|err| err.to_string())?;
        }
        thread::sleep(Duration::from_millis(10));
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    Ok(json!({
        "stdout": String::from_utf8_lossy(&stdout_bytes),
        "stderr": String::from_utf8_lossy(&stderr_bytes),
        "code": status.code(),
        "killed": killed,
    }))
}

fn read_file(root: &Path, params: Value) -> std::result::Result<Value, String> {
    let params: ReadFileParams =
        serde_json::from_value(params).map_err(|err| format!("Invalid read_file params: {err}"))?;
    let requested = Path::new(&params.path);
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = candidate
        .canonicalize()
        .map_err(|err| format!("Cannot read {}: {err}", params.path))?;
    if !is_within(root, &resolved) {
        return Err(format!("Path escapes extension root: {}", params.path));
    }
    let file = std::fs::File::open(&resolved).map_err(|err| err.to_string())?;
    let mut content = String::new();
    file.take(MAX_READ_BYTES)
        .read_to_string(&mut content)
        .map_err(|err| format!("Cannot read {}: {err}", params.path))?;
    Ok(json!({ "path": resolved, "content": content }))
}

fn show_message(extension_id: &str, params: Value) -> std::result::Result<(), String> {
    let params: ShowMessageParams = serde_json::from_value(params)
        .map_err(|err| format!("Invalid show_message params: {err}"))?;
    match params.level.as_deref() {
        Some("error") => tracing::error!(extension_id, "{}", params.message),
        Some("warning" | "warn") => tracing::warn!(extension_id, "{}", params.message),
        _ => tracing::info!(extension_id, "{}", params.message),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn context(root: &Path, policy: Option<PermissionPolicy>) -> (RequestContext, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        let ctx = RequestContext {
            extension_id: "ext".to_string(),
            root: root.canonicalize().expect("canonical root"),
            policy: policy.map(Arc::new),
            exec_timeout: Duration::from_secs(5),
            reply: tx,
        };
        (ctx, rx)
    }

    fn request(action: &str, params: Value) -> RequestHostPayload {
        RequestHostPayload {
            request_id: "r1".to_string(),
            action: action.to_string(),
            params,
        }
    }

    fn response(rx: &mpsc::Receiver<Message>) -> HostResponsePayload {
        match rx.recv_timeout(Duration::from_secs(10)).expect("response") {
            Message::HostResponse(response) => response,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_file_inside_root() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("notes.txt"), "hello").expect("write");
        let (ctx, rx) = context(temp.path(), None);
        handle(request("read_file", json!({"path": "notes.txt"})), ctx);
        let resp = response(&rx);
        assert!(resp.ok);
        assert_eq!(resp.result.expect("result")["content"], json!("hello"));
    }

    #[test]
    fn read_file_outside_root_is_refused() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().join("ext");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(temp.path().join("secret.txt"), "x").expect("write");
        let (ctx, rx) = context(&root, None);
        handle(request("readFile", json!({"path": "../secret.txt"})), ctx);
        let resp = response(&rx);
        assert!(!resp.ok);
        assert!(resp.error.expect("error").contains("escapes"));
    }

    #[test]
    fn exec_without_policy_is_denied() {
        let temp = TempDir::new().expect("tempdir");
        let (ctx, rx) = context(temp.path(), None);
        handle(request("exec", json!({"command": "echo", "args": ["hi"]})), ctx);
        let resp = response(&rx);
        assert!(!resp.ok);
        assert!(resp.error.expect("error").contains("no_policy"));
    }

    #[cfg(unix)]
    #[test]
    fn exec_allowed_by_policy_runs_in_root() {
        let temp = TempDir::new().expect("tempdir");
        let policy = PermissionPolicy {
            allow: vec!["pwd".to_string()],
            ..PermissionPolicy::default()
        };
        let (ctx, rx) = context(temp.path(), Some(policy));
        let root = ctx.root.clone();
        handle(request("exec", json!({"command": "pwd"})), ctx);
        let resp = response(&rx);
        assert!(resp.ok, "{:?}", resp.error);
        let result = resp.result.expect("result");
        assert_eq!(result["code"], json!(0));
        assert_eq!(
            result["stdout"].as_str().map(str::trim),
            Some(root.to_string_lossy().as_ref())
        );
    }

    #[cfg(unix)]
    #[test]
    fn exec_deny_entries_match_leading_arguments_only() {
        let temp = TempDir::new().expect("tempdir");
        let policy = PermissionPolicy {
            allow: vec!["echo".to_string()],
            deny: vec!["echo secret".to_string()],
            always_allow: false,
        };

        let (ctx, rx) = context(temp.path(), Some(policy.clone()));
        handle(request("exec", json!({"command": "echo", "args": ["secret", "x"]})), ctx);
        let resp = response(&rx);
        assert!(!resp.ok);
        assert!(resp.error.expect("error").contains("deny_list"));

        let (ctx, rx) = context(temp.path(), Some(policy));
        handle(request("exec", json!({"command": "echo", "args": ["-n", "secret"]})), ctx);
        let resp = response(&rx);
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result.expect("result")["stdout"], json!("secret"));
    }

    #[test]
    fn unknown_action_gets_an_error_reply() {
        let temp = TempDir::new().expect("tempdir");
        let (ctx, rx) = context(temp.path(), None);
        handle(request("format_disk", json!({})), ctx);
        let resp = response(&rx);
        assert_eq!(resp.error.as_deref(), Some("Unknown host action: format_disk"));
    }
}
