//! One-shot completion signal.

use tokio::sync::watch;

use crate::error::LatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    Clear,
    Resolved,
    Rejected,
}

/// Settles exactly once until cleared; any number of tasks may wait on it.
#[derive(Debug)]
pub struct Latch {
    state: watch::Sender<LatchState>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LatchState::Clear);
        Self { state }
    }

    pub fn state(&self) -> LatchState {
        *self.state.borrow()
    }

    pub fn resolve(&self) -> Result<(), LatchError> {
        self.settle(LatchState::Resolved)
    }

    pub fn reject(&self) -> Result<(), LatchError> {
        self.settle(LatchState::Rejected)
    }

    /// Re-arm a settled latch. Clearing a clear latch does nothing.
    pub fn clear(&self) {
        self.state.send_if_modified(|state| {
            let settled = *state != LatchState::Clear;
            *state = LatchState::Clear;
            settled
        });
    }

    /// Wait until the latch settles and return how.
    pub async fn wait(&self) -> LatchState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state != LatchState::Clear).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.state(),
        }
    }

    fn settle(&self, to: LatchState) -> Result<(), LatchError> {
        let mut settled = false;
        self.state.send_if_modified(|state| {
            if *state == LatchState::Clear {
                *state = to;
                settled = true;
            }
            settled
        });
        if settled {
            Ok(())
        } else {
            Err(LatchError::AlreadySettled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn settles_once() {
        let latch = Latch::new();
        assert_eq!(latch.resolve(), Ok(()));
        assert_eq!(latch.reject(), Err(LatchError::AlreadySettled));
        assert_eq!(latch.resolve(), Err(LatchError::AlreadySettled));
        assert_eq!(latch.state(), LatchState::Resolved);
    }

    #[test]
    fn clear_re_arms() {
        let latch = Latch::new();
        latch.reject().unwrap();
        latch.clear();
        assert_eq!(latch.state(), LatchState::Clear);
        latch.resolve().unwrap();
        assert_eq!(latch.state(), LatchState::Resolved);
    }

    #[tokio::test]
    async fn wakes_every_waiter() {
        let latch = Arc::new(Latch::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        latch.reject().unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), LatchState::Rejected);
        }
    }

    #[tokio::test]
    async fn settled_latch_returns_immediately() {
        let latch = Latch::new();
        latch.resolve().unwrap();
        assert_eq!(latch.wait().await, LatchState::Resolved);
    }
}
