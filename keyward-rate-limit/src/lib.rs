use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Decision returned by [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Allowed,
    /// The window is full. `retry_after` is how long until the oldest
    /// admitted attempt leaves the window.
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Acquire::Allowed)
    }
}

/// Instants of the attempts admitted within the current window, oldest first.
#[derive(Default)]
struct Window {
    admitted: VecDeque<Instant>,
}

/// Drop attempts that fell out of the window, then admit one more if there
/// is room.
#[inline]
fn prune_and_try_admit(
    admitted: &mut VecDeque<Instant>,
    capacity: usize,
    window: Duration,
    now: Instant,
) -> Acquire {
    while let Some(&oldest) = admitted.front() {
        if now.duration_since(oldest) >= window {
            admitted.pop_front();
        } else {
            break;
        }
    }

    if admitted.len() < capacity {
        admitted.push_back(now);
        return Acquire::Allowed;
    }

    let retry_after = admitted
        .front()
        .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
        .unwrap_or_default();
    Acquire::Denied { retry_after }
}

/// A rolling-window rate limiter keyed by an arbitrary type.
///
/// Each key gets its own independent window: at most `capacity` attempts
/// are admitted in any `window`-long span. Denied attempts are not recorded.
#[derive(Clone)]
pub struct RateLimiter<K> {
    windows: Arc<DashMap<K, Window>>,
    capacity: NonZeroU32,
    window: Duration,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Create a rate limiter that allows `capacity` attempts per `window`.
    pub fn new(capacity: NonZeroU32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            capacity,
            window,
        }
    }

    /// Create a rate limiter that allows `capacity` attempts per minute.
    pub fn per_minute(capacity: NonZeroU32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn capacity(&self) -> NonZeroU32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Try to admit one attempt for the given key.
    pub fn try_acquire(&self, key: &K) -> Acquire {
        let mut entry = self.windows.entry(key.clone()).or_default();
        prune_and_try_admit(
            &mut entry.value_mut().admitted,
            self.capacity.get() as usize,
            self.window,
            Instant::now(),
        )
    }

    /// Number of attempts still admissible for `key` right now.
    pub fn remaining(&self, key: &K) -> u32 {
        let now = Instant::now();
        let used = self.windows.get(key).map_or(0, |entry| {
            entry
                .admitted
                .iter()
                .filter(|&&at| now.duration_since(at) < self.window)
                .count()
        });
        self.capacity.get().saturating_sub(used as u32)
    }
}
