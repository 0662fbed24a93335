//! The "panic button": a single-writer latch for the first fatal error,
//! exposed to the Supervisor as [`FatalSlot::await_error`] (`spec.md` §4.5,
//! §6 glossary "panic button").

use observability_deps::tracing::error;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct FatalError(pub String);

#[derive(Debug, Default)]
pub struct FatalSlot {
    error: Mutex<Option<FatalError>>,
    notify: Notify,
}

impl FatalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `error` if this is the first fatal error; subsequent calls are
    /// logged but otherwise a no-op.
    pub fn latch(&self, error_value: FatalError) {
        let mut slot = self.error.lock();
        if slot.is_some() {
            error!(%error_value, "additional fatal error after one already latched, ignoring");
            return;
        }
        error!(%error_value, "fatal error latched");
        *slot = Some(error_value);
        self.notify.notify_waiters();
    }

    pub fn get(&self) -> Option<FatalError> {
        self.error.lock().clone()
    }

    /// Blocks until a fatal error is latched.
    pub async fn await_error(&self) -> FatalError {
        loop {
            if let Some(error_value) = self.get() {
                return error_value;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn await_error_unblocks_after_latch() {
        let slot = std::sync::Arc::new(FatalSlot::new());
        let waiter = tokio::spawn({
            let slot = std::sync::Arc::clone(&slot);
            async move { slot.await_error().await }
        });

        tokio::task::yield_now().await;
        slot.latch(FatalError("boom".to_string()));

        let error_value = waiter.await.unwrap();
        assert_eq!(error_value.0, "boom");
    }

    #[test]
    fn only_first_error_is_retained() {
        let slot = FatalSlot::new();
        slot.latch(FatalError("first".to_string()));
        slot.latch(FatalError("second".to_string()));
        assert_eq!(slot.get().unwrap().0, "first");
    }
}
