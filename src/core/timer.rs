use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::RaftConfig;

/// Randomized countdown driving follower and candidate timeouts. The
/// deadline is re-randomized on every reset so colliding candidacies
/// spread out.
#[derive(Clone, Debug)]
pub(crate) struct ElectionTimer {
    next_deadline: Instant,
    timeout_range: (u64, u64),
}

impl ElectionTimer {
    pub(crate) fn new(config: &RaftConfig) -> Self {
        let timeout_range = (config.election_timeout_min_ms, config.election_timeout_max_ms);
        let mut timer = Self {
            next_deadline: Instant::now(),
            timeout_range,
        };
        timer.reset();
        timer
    }

    pub(crate) fn reset(&mut self) {
        let (min, max) = self.timeout_range;
        let timeout = rand::Rng::gen_range(&mut rand::thread_rng(), min..=max);
        self.next_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.next_deadline <= Instant::now()
    }
}
