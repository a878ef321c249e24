//! One-shot completion slots for handshake stages.
//!
//! A slot has three terminal-or-pending states: pending, resolved,
//! cancelled. Resolution and cancellation are first-writer-wins; any
//! number of tasks may await the outcome.

use tokio::sync::watch;

/// Awaiting a cancelled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("completion was cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone)]
enum Slot<T> {
    Pending,
    Resolved(T),
    Cancelled,
}

/// A one-shot, multi-observer completion slot.
#[derive(Debug)]
pub struct Completion<T: Clone> {
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Slot::Pending);
        Self { tx }
    }

    /// Resolve the slot; false when it already reached a terminal state.
    pub fn try_resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Resolved(value.clone());
                true
            } else {
                false
            }
        })
    }

    /// Cancel the slot; false when it already reached a terminal state.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Cancelled;
                true
            } else {
                false
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.tx.borrow(), Slot::Resolved(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.tx.borrow(), Slot::Cancelled)
    }

    /// The resolved value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        match &*self.tx.borrow() {
            Slot::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> Result<T, Cancelled> {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| Cancelled)?;
        match &*slot {
            Slot::Resolved(value) => Ok(value.clone()),
            _ => Err(Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_waiters() {
        let slot = std::sync::Arc::new(Completion::<u32>::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait().await })
        };
        assert!(slot.try_resolve(7));
        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert_eq!(slot.peek(), Some(7));
    }

    #[test]
    fn resolution_is_single_shot() {
        let slot = Completion::<u32>::new();
        assert!(slot.try_resolve(1));
        assert!(!slot.try_resolve(2));
        assert!(!slot.cancel());
        assert_eq!(slot.peek(), Some(1));
    }

    #[tokio::test]
    async fn cancel_reaches_waiters() {
        let slot = Completion::<u32>::new();
        assert!(slot.cancel());
        assert!(!slot.try_resolve(1));
        assert_eq!(slot.wait().await, Err(Cancelled));
        assert!(slot.is_cancelled());
    }
}
