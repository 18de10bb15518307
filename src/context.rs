use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Per-call context: who acts, until when, and under which replay key.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub actor: String,
    pub deadline: Instant,
    pub idempotency_key: Option<String>,
}

impl OperationContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            deadline: Instant::now() + DEFAULT_DEADLINE,
            idempotency_key: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now() + timeout;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Derived key for the `index`-th item of a multi-line document.
    pub(crate) fn item_key(&self, index: usize) -> Option<String> {
        self.idempotency_key
            .as_ref()
            .map(|key| format!("{}#{}", key, index))
    }
}
