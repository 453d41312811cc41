use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{ActivityError, Result};

/// Cancellation and deadline carried by every store operation.
///
/// Clones share the same cancellation flag. A [`child`](Self::child) observes
/// its parent's cancellation but can be cancelled on its own, which is how a
/// fan-out abandons sibling shard queries once one shard has failed.
#[derive(Debug, Clone)]
pub struct OpContext {
    flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    #[must_use]
    pub fn background() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_at(Instant::now() + timeout)
    }

    /// Tightens the deadline; a later instant than the current one is ignored.
    #[must_use]
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    #[must_use]
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self {
            flags,
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flags.iter().any(|flag| flag.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails fast when the operation should no longer make progress.
    ///
    /// # Errors
    /// Returns [`ActivityError::Cancelled`] or [`ActivityError::DeadlineExceeded`].
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ActivityError::Cancelled { operation });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ActivityError::DeadlineExceeded { operation });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_cancellation_but_not_the_reverse() {
        let parent = OpContext::background();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let second = parent.child();
        parent.cancel();
        assert!(second.is_cancelled());
        assert_eq!(
            second.check("query"),
            Err(ActivityError::Cancelled { operation: "query" })
        );
    }

    #[test]
    fn elapsed_deadline_fails_check() {
        let ctx = OpContext::with_timeout(Duration::ZERO);
        assert_eq!(
            ctx.check("insert"),
            Err(ActivityError::DeadlineExceeded { operation: "insert" })
        );
        assert!(OpContext::background().check("insert").is_ok());
    }

    #[test]
    fn deadline_only_tightens() {
        let now = Instant::now();
        let ctx = OpContext::background()
            .deadline_at(now + Duration::from_secs(5))
            .deadline_at(now + Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));
    }
}
