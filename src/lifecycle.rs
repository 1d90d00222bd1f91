//! Per-extension lifecycle state machine.
//!
//! This module performs no I/O. Each transition returns the messages the
//! caller must write to the worker, in order.

use crate::manifest::ACTIVATE_ALWAYS;
use crate::protocol::{ActivatePayload, ActivationResult, EventPayload, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Spawned,
    AwaitingReady,
    Ready,
    Activating,
    Activated,
    /// Activation threw; the worker stays up but serves no commands.
    ActivationFailed,
    Deactivating,
    Exited,
}

impl LifecycleState {
    /// Forward-only transition table. Any live state may collapse to `Exited`.
    pub const fn can_advance(self, next: Self) -> bool {
        use LifecycleState::{
            Activated, Activating, ActivationFailed, AwaitingReady, Deactivating, Exited, Ready,
            Spawned,
        };
        match (self, next) {
            (Exited, _) => false,
            (_, Exited)
            | (Spawned, AwaitingReady)
            | (AwaitingReady, Ready)
            | (Ready, Activating)
            | (Activating, Activated | ActivationFailed)
            | (
                Spawned | AwaitingReady | Ready | Activating | Activated | ActivationFailed,
                Deactivating,
            ) => true,
            _ => false,
        }
    }

    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Exited)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::ActivationFailed => "activation_failed",
            Self::Deactivating => "deactivating",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Exit code 0 after a requested deactivation.
    Deactivated,
    /// Non-zero exit, or forced kill, after a requested deactivation.
    FailedDeactivation,
    /// Any exit the host did not ask for.
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub extension_id: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub kind: ExitKind,
}

/// Outcome of asking for activation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationStep {
    /// Write this `activate` message now.
    Send(Message),
    /// Activation will be (or is being) sent; wait for the result.
    Pending,
    /// Activation already ran; this is its cached result.
    Done(ActivationResult),
}

#[derive(Debug, Clone)]
pub struct ExtensionLifecycle {
    extension_id: String,
    state: LifecycleState,
    triggers: Vec<String>,
    context: Value,
    outbox: VecDeque<Message>,
    activation_requested: bool,
    activation: Option<ActivationResult>,
}

impl ExtensionLifecycle {
    pub fn new(extension_id: impl Into<String>, triggers: Vec<String>, context: Value) -> Self {
        Self {
            extension_id: extension_id.into(),
            state: LifecycleState::Spawned,
            triggers,
            context,
            outbox: VecDeque::new(),
            activation_requested: false,
            activation: None,
        }
    }

    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub const fn activation(&self) -> Option<&ActivationResult> {
        self.activation.as_ref()
    }

    /// True once activation has been requested or has succeeded.
    pub fn wants_activation(&self) -> bool {
        self.activation_requested || self.activation.as_ref().is_some_and(|a| a.ok)
    }

    pub fn matches_trigger(&self, event: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| t == ACTIVATE_ALWAYS || t == event)
    }

    fn advance(&mut self, next: LifecycleState) -> bool {
        if self.state.can_advance(next) {
            tracing::trace!(extension_id = %self.extension_id, from = %self.state, to = %next, "Lifecycle transition");
            self.state = next;
            true
        } else {
            tracing::debug!(extension_id = %self.extension_id, from = %self.state, to = %next, "Ignoring invalid lifecycle transition");
            false
        }
    }

    /// The process exists; wait for its `ready`.
    pub fn spawned(&mut self) {
        self.advance(LifecycleState::AwaitingReady);
    }

    /// Handle `ready`: send `activate` first if one is owed, then flush the
    /// queue in FIFO order.
    pub fn on_ready(&mut self) -> Vec<Message> {
        if !self.advance(LifecycleState::Ready) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.outbox.len() + 1);
        let eager = self.triggers.iter().any(|t| t == ACTIVATE_ALWAYS);
        if self.activation_requested || eager {
            out.push(self.start_activation());
        }
        while let Some(msg) = self.outbox.pop_front() {
            let triggers = match &msg {
                Message::Event(event) => {
                    self.state == LifecycleState::Ready && self.matches_trigger(&event.event_name)
                }
                _ => false,
            };
            if triggers {
                out.push(self.start_activation());
            }
            out.push(msg);
        }
        out
    }

    fn start_activation(&mut self) -> Message {
        self.activation_requested = true;
        self.advance(LifecycleState::Activating);
        Message::Activate(ActivatePayload {
            context: self.context.clone(),
        })
    }

    /// Explicit activation request. Idempotent once activation has finished.
    pub fn request_activation(&mut self) -> ActivationStep {
        match self.state {
            LifecycleState::Spawned | LifecycleState::AwaitingReady => {
                self.activation_requested = true;
                ActivationStep::Pending
            }
            LifecycleState::Ready => ActivationStep::Send(self.start_activation()),
            LifecycleState::Activating => ActivationStep::Pending,
            LifecycleState::Activated | LifecycleState::ActivationFailed => {
                ActivationStep::Done(self.activation.clone().unwrap_or_else(|| {
                    ActivationResult::failed("activation result unavailable")
                }))
            }
            LifecycleState::Deactivating | LifecycleState::Exited => {
                ActivationStep::Done(ActivationResult::failed("extension is not running"))
            }
        }
    }

    pub fn on_activation_result(&mut self, result: ActivationResult) -> bool {
        let next = if result.ok {
            LifecycleState::Activated
        } else {
            LifecycleState::ActivationFailed
        };
        if self.state != LifecycleState::Activating || !self.advance(next) {
            return false;
        }
        self.activation = Some(result);
        true
    }

    /// Route an event. Matching a trigger before activation activates first.
    /// Events never change state otherwise.
    pub fn deliver_event(&mut self, event: EventPayload) -> Vec<Message> {
        match self.state {
            LifecycleState::Spawned | LifecycleState::AwaitingReady => {
                self.outbox.push_back(Message::Event(event));
                Vec::new()
            }
            LifecycleState::Ready => {
                if self.matches_trigger(&event.event_name) {
                    vec![self.start_activation(), Message::Event(event)]
                } else {
                    vec![Message::Event(event)]
                }
            }
            LifecycleState::Activating
            | LifecycleState::Activated
            | LifecycleState::ActivationFailed => vec![Message::Event(event)],
            LifecycleState::Deactivating | LifecycleState::Exited => Vec::new(),
        }
    }

    /// Gate an arbitrary host-to-worker message on readiness.
    pub fn enqueue(&mut self, msg: Message) -> Option<Message> {
        match self.state {
            LifecycleState::Spawned | LifecycleState::AwaitingReady => {
                self.outbox.push_back(msg);
                None
            }
            LifecycleState::Deactivating | LifecycleState::Exited => None,
            _ => Some(msg),
        }
    }

    /// Start graceful shutdown. Returns the `deactivate` message to send, or
    /// `None` if shutdown already started.
    pub fn begin_deactivate(&mut self) -> Option<Message> {
        if !self.advance(LifecycleState::Deactivating) {
            return None;
        }
        self.outbox.clear();
        Some(Message::Deactivate)
    }

    /// Record process exit and classify it.
    pub fn on_exit(&mut self, code: Option<i32>, signal: Option<i32>) -> ExitReport {
        let requested = self.state == LifecycleState::Deactivating;
        self.advance(LifecycleState::Exited);
        self.outbox.clear();
        let kind = match (requested, code) {
            (true, Some(0)) => ExitKind::Deactivated,
            (true, _) => ExitKind::FailedDeactivation,
            (false, _) => ExitKind::Crashed,
        };
        ExitReport {
            extension_id: self.extension_id.clone(),
            code,
            signal,
            kind,
        }
    }
}
