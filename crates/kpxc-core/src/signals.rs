//! Unsolicited daemon signals and observer fan-out.

use std::sync::Arc;

use tracing::debug;

use crate::error::ClientError;
use crate::protocol::action;

/// Called with `true` when the database locks, `false` when it unlocks.
pub type LockObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Called with failures no caller is waiting for.
pub type ErrorObserver = Arc<dyn Fn(ClientError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    DatabaseLocked,
    DatabaseUnlocked,
}

impl Signal {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            action::DATABASE_LOCKED => Some(Self::DatabaseLocked),
            action::DATABASE_UNLOCKED => Some(Self::DatabaseUnlocked),
            _ => None,
        }
    }

    pub fn locked(self) -> bool {
        matches!(self, Self::DatabaseLocked)
    }
}

/// Registered observers. Each notification runs on its own task so a slow
/// observer never stalls the reader.
#[derive(Clone, Default)]
pub struct Observers {
    lock: Vec<LockObserver>,
    error: Vec<ErrorObserver>,
}

impl Observers {
    pub fn on_lock_change<F>(&mut self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.lock.push(Arc::new(f));
    }

    pub fn on_async_error<F>(&mut self, f: F)
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.error.push(Arc::new(f));
    }

    pub(crate) fn signal(&self, signal: Signal) {
        debug!(?signal, observers = self.lock.len(), "dispatching signal");
        let locked = signal.locked();
        for observer in &self.lock {
            let observer = observer.clone();
            tokio::spawn(async move { observer(locked) });
        }
    }

    pub(crate) fn async_error(&self, err: &ClientError) {
        for observer in &self.error {
            let observer = observer.clone();
            let err = err.clone();
            tokio::spawn(async move { observer(err) });
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("lock", &self.lock.len())
            .field("error", &self.error.len())
            .finish()
    }
}
