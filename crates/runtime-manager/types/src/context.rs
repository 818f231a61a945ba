//! Contexts, bindings and units of work

use crate::{CorrelationKey, InstanceId, ManagerId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Context ──────────────────────────────────────────────────────────

/// Identifies the unit of work a caller wants a session for.
///
/// Immutable once constructed. `Empty` carries no affinity: every checkout
/// gets a fresh session, which is how a new unit of work is started.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Context {
    Empty,
    InstanceId(InstanceId),
    CorrelationKey(CorrelationKey),
}

impl Context {
    pub fn instance(id: impl Into<InstanceId>) -> Self {
        Context::InstanceId(id.into())
    }

    pub fn correlation(key: impl Into<String>) -> Self {
        Context::CorrelationKey(CorrelationKey::new(key))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Context::Empty)
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Context::InstanceId(id) => Some(*id),
            _ => None,
        }
    }

    /// Storage discriminator used by persisted mappers
    pub fn kind(&self) -> &'static str {
        match self {
            Context::Empty => "empty",
            Context::InstanceId(_) => "instance",
            Context::CorrelationKey(_) => "correlation",
        }
    }

    /// Storage value used by persisted mappers (empty for `Empty`)
    pub fn value(&self) -> String {
        match self {
            Context::Empty => String::new(),
            Context::InstanceId(id) => id.0.to_string(),
            Context::CorrelationKey(key) => key.0.clone(),
        }
    }

    /// Inverse of [`kind`](Self::kind) / [`value`](Self::value)
    pub fn from_parts(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "empty" => Some(Context::Empty),
            "instance" => value.parse::<u64>().ok().map(Context::instance),
            "correlation" => Some(Context::correlation(value)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Context::Empty => write!(f, "empty"),
            Context::InstanceId(id) => write!(f, "instance:{}", id),
            Context::CorrelationKey(key) => write!(f, "correlation:{}", key),
        }
    }
}

impl From<InstanceId> for Context {
    fn from(id: InstanceId) -> Self {
        Context::InstanceId(id)
    }
}

impl From<CorrelationKey> for Context {
    fn from(key: CorrelationKey) -> Self {
        Context::CorrelationKey(key)
    }
}

// ── Binding ──────────────────────────────────────────────────────────

/// A context bound to the session serving it, for one manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub context: Context,
    pub session_id: SessionId,
    pub manager_id: ManagerId,
    pub created_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(context: Context, session_id: SessionId, manager_id: ManagerId) -> Self {
        Self {
            context,
            session_id,
            manager_id,
            created_at: Utc::now(),
        }
    }
}

// ── Unit of Work ─────────────────────────────────────────────────────

/// The unit of work a session reports as started or completed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub instance_id: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<CorrelationKey>,
}

impl UnitOfWork {
    pub fn new(instance_id: impl Into<InstanceId>) -> Self {
        Self {
            instance_id: instance_id.into(),
            correlation_key: None,
        }
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(CorrelationKey::new(key));
        self
    }

    /// Every context this unit of work is addressable by, instance first
    pub fn contexts(&self) -> Vec<Context> {
        let mut contexts = vec![Context::InstanceId(self.instance_id)];
        if let Some(key) = &self.correlation_key {
            contexts.push(Context::CorrelationKey(key.clone()));
        }
        contexts
    }
}
