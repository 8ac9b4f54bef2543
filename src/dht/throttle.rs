use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    start: Instant,
    count: usize,
}

/// Per-source packet limiter over a rolling minute, tracking the most
/// recently seen hosts in an LRU so a crowd of spammy clients cannot grow
/// the table without bound.
pub(crate) struct HostThrottle {
    per_minute_limit: usize,
    clients: LruCache<String, Window>,
}

impl HostThrottle {
    pub fn new(per_minute_limit: usize, tracked_clients: usize) -> Self {
        Self {
            per_minute_limit,
            clients: LruCache::new(
                NonZeroUsize::new(tracked_clients).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Accounts one packet from `host` and says whether to process it.
    pub fn allow(&mut self, host: &str) -> bool {
        let now = Instant::now();
        let window = self.clients.get_or_insert_mut(host.to_string(), || Window {
            start: now,
            count: 0,
        });
        if now.duration_since(window.start) >= WINDOW {
            window.start = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.per_minute_limit
    }
}
