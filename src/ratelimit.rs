use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default number of commands a connection may issue per window.
pub const DEFAULT_MAX_PER_WINDOW: u32 = 60;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: Instant,
}

/// Fixed-window command counter keyed by connection identity.
///
/// A key's window opens lazily on its first call and lasts `window`; the
/// `max_per_window + 1`-th call inside it is refused. Owned by the
/// coordinator, so there is no internal locking.
#[derive(Debug)]
pub struct RateLimiter<K> {
    windows: HashMap<K, Window>,
    max_per_window: u32,
    window: Duration,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            max_per_window,
            window,
        }
    }

    /// Count one call for `key` and report whether it is allowed.
    pub fn check(&mut self, key: &K) -> bool {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &K, now: Instant) -> bool {
        match self.windows.get_mut(key) {
            Some(entry) if now <= entry.resets_at => {
                entry.count = entry.count.saturating_add(1);
                entry.count <= self.max_per_window
            }
            _ => {
                self.windows.insert(
                    key.clone(),
                    Window {
                        count: 1,
                        resets_at: now + self.window,
                    },
                );
                self.max_per_window >= 1
            }
        }
    }

    /// Forget a key, e.g. when its connection closes.
    pub fn remove(&mut self, key: &K) {
        self.windows.remove(key);
    }

    /// Drop every expired window. Returns how many were evicted.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now <= w.resets_at);
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

impl<K: Hash + Eq + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW)
    }
}
