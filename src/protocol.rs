//! Host/worker wire protocol.
//!
//! Every frame is one JSON object on its own line, tagged by `type`.
//! Anything that does not parse into [`Message`], fails validation, or
//! travels in the wrong direction is rejected at the boundary.

use crate::commands::CommandKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;

/// Worker exit code after a clean deactivation.
pub const EXIT_CLEAN: i32 = 0;
/// Worker exit code when `deactivate()` threw or rejected.
pub const EXIT_DEACTIVATE_FAILED: i32 = 1;
/// Worker exit code for a broken worker environment.
pub const EXIT_CONFIG: i32 = 2;
/// Worker exit code after a sandbox violation.
pub const EXIT_SANDBOX_VIOLATION: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToWorker,
    WorkerToHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ready,
    Activate(ActivatePayload),
    Deactivate,
    Event(EventPayload),
    RegisterCommand(RegisterCommandPayload),
    UnregisterCommand(UnregisterCommandPayload),
    ExecuteCommand(ExecuteCommandPayload),
    CommandResult(CommandResultPayload),
    ActivationResult(ActivationResult),
    Log(LogPayload),
    RequestHost(RequestHostPayload),
    HostResponse(HostResponsePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActivatePayload {
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCommandPayload {
    pub command: String,
    #[serde(default)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterCommandPayload {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandPayload {
    pub request_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActivationResult {
    pub const fn succeeded() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub payload: Vec<Value>,
}

impl LogPayload {
    /// Join the payload into one line, printing strings without quotes.
    pub fn render(&self) -> String {
        self.payload
            .iter()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHostPayload {
    pub request_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponsePayload {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostResponsePayload {
    pub fn ok(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

impl Message {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Activate(_) => "activate",
            Self::Deactivate => "deactivate",
            Self::Event(_) => "event",
            Self::RegisterCommand(_) => "register_command",
            Self::UnregisterCommand(_) => "unregister_command",
            Self::ExecuteCommand(_) => "execute_command",
            Self::CommandResult(_) => "command_result",
            Self::ActivationResult(_) => "activation_result",
            Self::Log(_) => "log",
            Self::RequestHost(_) => "request_host",
            Self::HostResponse(_) => "host_response",
        }
    }

    pub const fn direction(&self) -> Direction {
        match self {
            Self::Activate(_)
            | Self::Deactivate
            | Self::Event(_)
            | Self::ExecuteCommand(_)
            | Self::HostResponse(_) => Direction::HostToWorker,
            Self::Ready
            | Self::RegisterCommand(_)
            | Self::UnregisterCommand(_)
            | Self::CommandResult(_)
            | Self::ActivationResult(_)
            | Self::Log(_)
            | Self::RequestHost(_) => Direction::WorkerToHost,
        }
    }

    pub fn parse_and_validate(json: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(json)
            .map_err(|err| Error::protocol(format!("Malformed frame: {err}")))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Parse a frame that must travel in `expected` direction.
    pub fn parse_directed(json: &str, expected: Direction) -> Result<Self> {
        let msg = Self::parse_and_validate(json)?;
        if msg.direction() != expected {
            return Err(Error::protocol(format!(
                "Message '{}' is not valid in this direction",
                msg.kind()
            )));
        }
        Ok(msg)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ready | Self::Deactivate | Self::Activate(_) | Self::Log(_) => Ok(()),
            Self::ActivationResult(payload) => validate_activation_result(payload),
            Self::Event(payload) => validate_event(payload),
            Self::RegisterCommand(payload) => validate_command_name(&payload.command),
            Self::UnregisterCommand(payload) => validate_command_name(&payload.command),
            Self::ExecuteCommand(payload) => {
                validate_request_id(&payload.request_id)?;
                validate_command_name(&payload.command)
            }
            Self::CommandResult(payload) => {
                validate_request_id(&payload.request_id)?;
                validate_outcome(payload.ok, payload.error.as_deref())
            }
            Self::RequestHost(payload) => validate_request_host(payload),
            Self::HostResponse(payload) => {
                validate_request_id(&payload.request_id)?;
                validate_outcome(payload.ok, payload.error.as_deref())
            }
        }
    }

    /// Serialize to a single newline-terminated frame.
    pub fn to_frame(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn write_frame<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.to_frame()?.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

fn validate_command_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("Command name is empty"));
    }
    Ok(())
}

fn validate_request_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::validation("Request id is empty"));
    }
    Ok(())
}

fn validate_event(payload: &EventPayload) -> Result<()> {
    if payload.event_name.trim().is_empty() {
        return Err(Error::validation("Event name is empty"));
    }
    Ok(())
}

fn validate_activation_result(payload: &ActivationResult) -> Result<()> {
    validate_outcome(payload.ok, payload.error.as_deref())
}

fn validate_outcome(ok: bool, error: Option<&str>) -> Result<()> {
    if ok && error.is_some() {
        return Err(Error::validation("Successful result carries an error"));
    }
    Ok(())
}

fn validate_request_host(payload: &RequestHostPayload) -> Result<()> {
    validate_request_id(&payload.request_id)?;
    if payload.action.trim().is_empty() {
        return Err(Error::validation("Host request action is empty"));
    }
    Ok(())
}
