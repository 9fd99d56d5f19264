//! Delayed callback records
//!
//! A record is fixed-shape: the optional priority and handlers are resolved
//! once, at registration, into `Option` fields.

use std::fmt;

/// Process-wide (per scheduler) callback identifier. Never reused until reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(pub u64);

impl CallbackId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure of a callback action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// The action returned an error.
    #[error("callback failed: {0}")]
    Failed(String),
    /// The action panicked; the payload message is kept when it is a string.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    pub fn failed(msg: impl Into<String>) -> Self {
        CallbackError::Failed(msg.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        CallbackError::Panicked(msg)
    }
}

impl From<&str> for CallbackError {
    fn from(s: &str) -> Self {
        CallbackError::Failed(s.to_string())
    }
}

impl From<String> for CallbackError {
    fn from(s: String) -> Self {
        CallbackError::Failed(s)
    }
}

pub type CallbackResult = Result<(), CallbackError>;

/// The opaque action. Invoked with no scheduler-owned arguments.
pub type Action = Box<dyn FnMut() -> CallbackResult>;
pub type ErrorHandler = Box<dyn FnMut(&CallbackError)>;
pub type DoneHandler = Box<dyn FnMut(CallbackId)>;

/// One-shot or repeating. Cancellation must name the same kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackKind {
    Once,
    Repeating,
}

impl CallbackKind {
    pub fn is_periodic(self) -> bool {
        self == CallbackKind::Repeating
    }
}

/// Optional registration arguments.
#[derive(Default)]
pub struct CallbackOptions {
    pub(crate) domain: Option<String>,
    pub(crate) priority: Option<i32>,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_done: Option<DoneHandler>,
}

impl CallbackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under a named logical clock domain.
    pub fn domain(mut self, label: impl Into<String>) -> Self {
        self.domain = Some(label.into());
        self
    }

    /// Lower value runs first among same-domain callbacks due at the same time.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&CallbackError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Runs after every successful invocation of the action.
    pub fn on_done(mut self, f: impl FnMut(CallbackId) + 'static) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for CallbackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackOptions")
            .field("domain", &self.domain)
            .field("priority", &self.priority)
            .field("on_error", &self.on_error.is_some())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

/// The callable parts of a record. Taken out of the registry while the
/// action runs so the driver holds no borrow across user code.
pub(crate) struct CallbackBody {
    pub action: Action,
    pub on_error: Option<ErrorHandler>,
    pub on_done: Option<DoneHandler>,
}

/// A delayed callback as stored in the registry.
pub struct DelayedCallback {
    pub(crate) body: Option<CallbackBody>,
    pub(crate) interval: u64,
    pub(crate) periodic: bool,
    pub(crate) next_execution_time: u64,
    pub(crate) priority: Option<i32>,
}

impl DelayedCallback {
    pub(crate) fn new(
        action: Action,
        interval: u64,
        kind: CallbackKind,
        next_execution_time: u64,
        opts: CallbackOptions,
    ) -> Self {
        Self {
            body: Some(CallbackBody {
                action,
                on_error: opts.on_error,
                on_done: opts.on_done,
            }),
            interval,
            periodic: kind.is_periodic(),
            next_execution_time,
            priority: opts.priority,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn next_execution_time(&self) -> u64 {
        self.next_execution_time
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// True while the action is running.
    pub fn is_executing(&self) -> bool {
        self.body.is_none()
    }
}

impl fmt::Debug for DelayedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedCallback")
            .field("interval", &self.interval)
            .field("periodic", &self.periodic)
            .field("next_execution_time", &self.next_execution_time)
            .field("priority", &self.priority)
            .finish()
    }
}
