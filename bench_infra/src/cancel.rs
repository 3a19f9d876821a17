// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hierarchical cancellation with an optional deadline.
//!
//! A run owns one root token carrying the run deadline. Every VM gets a
//! child token; cancelling the root (timeout, first failure, signal)
//! cancels every child, while cancelling a child leaves its parent and
//! siblings untouched.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    deadline: Option<Instant>,
}

impl Inner {
    fn new(deadline: Option<Instant>, cancelled: bool) -> Self {
        Inner {
            state: Mutex::new(State {
                cancelled,
                children: Vec::new(),
            }),
            cond: Condvar::new(),
            deadline,
        }
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            self.cond.notify_all();
            std::mem::take(&mut state.children)
        };

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner::new(None, false)),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            inner: Arc::new(Inner::new(Some(deadline), false)),
        }
    }

    /// A timeout too large to be represented leaves the token without a
    /// deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Creates a token cancelled together with `self`. The child inherits
    /// the parent deadline.
    pub fn child(&self) -> Self {
        self.make_child(self.inner.deadline)
    }

    /// Same as [`CancelToken::child`], with a deadline no later than
    /// `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.inner.deadline, Instant::now().checked_add(timeout)) {
            (Some(inherited), Some(own)) => Some(inherited.min(own)),
            (inherited, own) => inherited.or(own),
        };
        self.make_child(deadline)
    }

    fn make_child(&self, deadline: Option<Instant>) -> Self {
        let mut state = self.inner.state.lock().unwrap();
        let child = Arc::new(Inner::new(deadline, state.cancelled));
        state.children.retain(|c| c.strong_count() > 0);
        state.children.push(Arc::downgrade(&child));
        CancelToken { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.state.lock().unwrap().cancelled {
            return true;
        }
        self.deadline_passed()
    }

    /// True when the token fired because its deadline passed rather than
    /// through an explicit [`CancelToken::cancel`].
    pub fn deadline_passed(&self) -> bool {
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleeps for `duration` unless the token fires first.
    ///
    /// Returns `true` when the whole duration elapsed, `false` when the
    /// token was (or became) cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now().checked_add(duration);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.cancelled {
                return false;
            }

            let now = Instant::now();
            let mut wait = end.map_or(duration, |end| end.saturating_duration_since(now));
            if let Some(deadline) = self.inner.deadline {
                if now >= deadline {
                    return false;
                }
                wait = wait.min(deadline - now);
            }
            if wait.is_zero() {
                return true;
            }

            state = self.inner.cond.wait_timeout(state, wait).unwrap().0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = CancelToken::new();
        let vm0 = root.child();
        let vm1 = root.child();
        let nested = vm1.child();

        assert!(!vm0.is_cancelled());
        root.cancel();
        assert!(vm0.is_cancelled());
        assert!(vm1.is_cancelled());
        assert!(nested.is_cancelled());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let root = CancelToken::new();
        let vm0 = root.child();
        let vm1 = root.child();

        vm0.cancel();
        assert!(vm0.is_cancelled());
        assert!(!vm1.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_deadline() {
        let root = CancelToken::with_timeout(Duration::from_millis(20));
        let child = root.child();
        assert!(!child.is_cancelled());
        assert!(!child.sleep(Duration::from_secs(5)));
        assert!(child.is_cancelled());
        assert!(child.deadline_passed());
    }

    #[test]
    fn test_child_with_timeout_keeps_earlier_deadline() {
        let root = CancelToken::with_timeout(Duration::from_millis(10));
        let child = root.child_with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), root.deadline());
    }

    #[test]
    fn test_unrepresentable_timeout() {
        let root = CancelToken::with_timeout(Duration::MAX);
        assert!(root.deadline().is_none());

        let parent = CancelToken::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), parent.deadline());
        assert!(root.child_with_timeout(Duration::MAX).deadline().is_none());

        // Returns on cancel instead of panicking on the end instant
        let sleeper = CancelToken::new();
        let t = {
            let sleeper = sleeper.clone();
            thread::spawn(move || sleeper.sleep(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(20));
        sleeper.cancel();
        assert!(!t.join().unwrap());
    }

    #[test]
    fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let sleeper = token.child();
        let start = Instant::now();
        let t = thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(!t.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_sleep_completes() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
        assert!(token.remaining().is_none());
    }
}
