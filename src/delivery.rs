//! Client-side delivery of relayed messages into a running worker
//!
//! A busy worker cannot simply be handed a message: blockers and directives
//! must reach it before its next step, nudges can wait until the current
//! step is over, and completion notices are only bookkeeping. [`classify`]
//! makes that decision and [`DeliveryClassifier`] acts on it through the
//! worker's [`TaskRunner`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{RelayedMessage, Role, Signal};

/// How an incoming message perturbs the worker's current task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Delivered ahead of or alongside the current step
    Interrupt,
    /// Queued until the current unit of work completes
    Defer,
    /// Not injected at all
    Skip,
}

/// Map a message kind to its delivery mode
pub fn classify(signal: &Signal) -> Delivery {
    match signal {
        Signal::Blocker { .. } | Signal::Instruct { .. } => Delivery::Interrupt,
        Signal::Nudge { .. } => Delivery::Defer,
        Signal::Done { .. } => Delivery::Skip,
    }
}

/// Injection primitives of the worker's task runtime
///
/// Both calls are scheduling requests and must return without waiting for
/// the worker.
pub trait TaskRunner: Send + Sync {
    /// Inject before or alongside the current step
    fn inject_now(&self, text: String);

    /// Inject once the current step has finished
    fn inject_after(&self, text: String);
}

/// A message handed to the task runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub delivery: Delivery,
    pub text: String,
}

/// [`TaskRunner`] that queues injections on a channel for the worker loop
#[derive(Debug, Clone)]
pub struct ChannelRunner {
    tx: mpsc::UnboundedSender<Injection>,
}

impl ChannelRunner {
    /// Create a runner and the receiver the worker loop drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Injection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, delivery: Delivery, text: String) {
        let _ = self.tx.send(Injection { delivery, text });
    }
}

impl TaskRunner for ChannelRunner {
    fn inject_now(&self, text: String) {
        self.push(Delivery::Interrupt, text);
    }

    fn inject_after(&self, text: String) {
        self.push(Delivery::Defer, text);
    }
}

/// Latest completion notice from one sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub name: String,
    pub role: Role,
    pub swarm: Option<String>,
    pub summary: String,
}

/// Records `done` notices without touching the worker's context
///
/// Clones share state, so a job tracker elsewhere in the worker can hold
/// one while the classifier fills it.
#[derive(Debug, Clone, Default)]
pub struct CompletionTracker {
    completions: Arc<RwLock<HashMap<String, Completion>>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` if it is a completion notice
    pub fn record(&self, message: &RelayedMessage) -> bool {
        let Signal::Done { summary } = &message.message else {
            return false;
        };
        let completion = Completion {
            name: message.from.clone(),
            role: message.from_role,
            swarm: message.from_swarm.clone(),
            summary: summary.clone(),
        };
        self.completions
            .write()
            .insert(completion.name.clone(), completion);
        true
    }

    pub fn get(&self, name: &str) -> Option<Completion> {
        self.completions.read().get(name).cloned()
    }

    pub fn is_done(&self, name: &str) -> bool {
        self.completions.read().contains_key(name)
    }

    /// Sorted by name
    pub fn completed(&self) -> Vec<Completion> {
        let mut all: Vec<_> = self.completions.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.completions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.read().is_empty()
    }
}

/// Render a relayed message as the text injected into the worker
pub fn render(message: &RelayedMessage) -> String {
    let origin = match &message.from_swarm {
        Some(swarm) => format!("{}, swarm {}", message.from_role, swarm),
        None => message.from_role.to_string(),
    };
    format!(
        "[relay] {} from {} ({}): {}",
        message.message.kind(),
        message.from,
        origin,
        message.message.text()
    )
}

/// Applies [`classify`] to incoming messages and injects accordingly
pub struct DeliveryClassifier<R> {
    runner: R,
    completions: CompletionTracker,
}

impl<R: TaskRunner> DeliveryClassifier<R> {
    pub fn new(runner: R) -> Self {
        Self::with_tracker(runner, CompletionTracker::new())
    }

    pub fn with_tracker(runner: R, completions: CompletionTracker) -> Self {
        Self {
            runner,
            completions,
        }
    }

    /// Deliver one relayed message and report the mode used
    pub fn deliver(&self, message: &RelayedMessage) -> Delivery {
        let delivery = classify(&message.message);
        match delivery {
            Delivery::Interrupt => self.runner.inject_now(render(message)),
            Delivery::Defer => self.runner.inject_after(render(message)),
            Delivery::Skip => {
                self.completions.record(message);
            }
        }
        debug!(
            from = %message.from,
            kind = message.message.kind(),
            delivery = ?delivery,
            "Delivered relayed message"
        );
        delivery
    }

    /// Report an error from the relay or the transport
    pub fn deliver_error(&self, error: &str) -> Delivery {
        self.runner.inject_after(format!("[relay] error: {error}"));
        Delivery::Defer
    }

    pub fn completions(&self) -> &CompletionTracker {
        &self.completions
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}
