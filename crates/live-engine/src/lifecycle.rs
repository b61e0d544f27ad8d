//! Mount generations and the teardown set.
//!
//! Every mount gets a fresh [`Generation`].  Async work started for a mount
//! holds a [`LivenessToken`] and checks it before touching shared state, so a
//! late callback from mount N is dropped once mount N+1 has begun.
//!
//! Everything a mount spawns (tasks, timers, forwarders, close hooks) is
//! registered in that mount's [`TeardownSet`] and released exactly once.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Monotonic source of generations.  Cloning shares the counter.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, invalidating every outstanding token.
    pub fn advance(&self) -> LivenessToken {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        LivenessToken {
            generation: Generation(next),
            current: Arc::clone(&self.current),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessToken {
    generation: Generation,
    current: Arc<AtomicU64>,
}

impl LivenessToken {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation.0
    }
}

enum Teardown {
    Task(AbortHandle),
    Cancel(CancellationToken),
    Hook(Box<dyn FnOnce() + Send + Sync>),
}

/// Resources owned by one mount.  Released in reverse registration order.
#[derive(Default)]
pub struct TeardownSet {
    entries: Vec<(&'static str, Teardown)>,
}

impl TeardownSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_task<T>(&mut self, label: &'static str, handle: &JoinHandle<T>) {
        self.entries.push((label, Teardown::Task(handle.abort_handle())));
    }

    pub fn track_cancel(&mut self, label: &'static str, token: CancellationToken) {
        self.entries.push((label, Teardown::Cancel(token)));
    }

    /// Run `hook` at release time (e.g. a best-effort session close).
    pub fn defer(&mut self, label: &'static str, hook: impl FnOnce() + Send + Sync + 'static) {
        self.entries.push((label, Teardown::Hook(Box::new(hook))));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Synchronously release everything.  Returns how many entries were released.
    pub fn release_all(&mut self) -> usize {
        let released = self.entries.len();
        while let Some((label, entry)) = self.entries.pop() {
            debug!("teardown: releasing {}", label);
            match entry {
                Teardown::Task(handle) => handle.abort(),
                Teardown::Cancel(token) => token.cancel(),
                Teardown::Hook(hook) => hook(),
            }
        }
        released
    }
}

impl Drop for TeardownSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for TeardownSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(label, _)| label))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_advance_invalidates_old_tokens() {
        let counter = GenerationCounter::new();
        let first = counter.advance();
        assert!(first.is_live());
        let second = counter.advance();
        assert!(!first.is_live());
        assert!(second.is_live());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn test_hooks_run_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut set = TeardownSet::new();
        let c = Arc::clone(&calls);
        set.defer("close", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(set.release_all(), 1);
        assert_eq!(set.release_all(), 0);
        drop(set);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_aborts_tasks_and_cancels_tokens() {
        let mut set = TeardownSet::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let token = CancellationToken::new();
        set.track_task("sleeper", &task);
        set.track_cancel("watch", token.clone());
        assert_eq!(set.len(), 2);

        set.release_all();
        assert!(set.is_empty());
        assert!(token.is_cancelled());
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_teardown_set_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TeardownSet>();
    }
}
