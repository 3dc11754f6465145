/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Retry scheduling for dropped sessions.

use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub trait BackoffPolicy: Send {
    fn next_backoff_amount_ms(&mut self) -> u64;
    fn reset(&mut self);
}

/// Fixed wait plus a uniformly random share of the backoff window. The
/// first retry draws from the short window, later ones from the long one.
pub struct FullJitterBackoff {
    fixed_wait_ms: u64,
    short_backoff_ms: u64,
    long_backoff_ms: u64,
    current_retry: u32,
    rng: SmallRng,
}

impl FullJitterBackoff {
    pub fn new(fixed_wait_ms: u64, short_backoff_ms: u64, long_backoff_ms: u64) -> Self {
        Self {
            fixed_wait_ms,
            short_backoff_ms,
            long_backoff_ms,
            current_retry: 0,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl BackoffPolicy for FullJitterBackoff {
    fn next_backoff_amount_ms(&mut self) -> u64 {
        let window = if self.current_retry == 0 {
            self.short_backoff_ms
        } else {
            self.long_backoff_ms
        };
        self.current_retry += 1;
        self.fixed_wait_ms + self.rng.gen_range(0..=window)
    }

    fn reset(&mut self) {
        self.current_retry = 0;
    }
}

pub struct ReconnectController {
    reconnect_timeout: Duration,
    backoff: Box<dyn BackoffPolicy>,
    should_reconnect: bool,
    only_restart_peer_connection: bool,
    first_connection_attempt_at: Option<Instant>,
    last_active_at: Option<Instant>,
    retry_count: u32,
    pending_retry: Option<CancellationToken>,
}

impl ReconnectController {
    pub fn new(reconnect_timeout: Duration, backoff: Box<dyn BackoffPolicy>) -> Self {
        Self {
            reconnect_timeout,
            backoff,
            should_reconnect: true,
            only_restart_peer_connection: false,
            first_connection_attempt_at: None,
            last_active_at: None,
            retry_count: 0,
            pending_retry: None,
        }
    }

    fn time_spent_reconnecting(&self) -> Duration {
        self.first_connection_attempt_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn time_since_last_active(&self) -> Duration {
        self.last_active_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn has_past_reconnect_deadline(&self) -> bool {
        self.time_spent_reconnecting() >= self.reconnect_timeout
            || self.time_since_last_active() >= self.reconnect_timeout
    }

    /// Forget the episode: backoff, retry count and deadlines start over.
    pub fn reset(&mut self) {
        self.cancel();
        self.should_reconnect = true;
        self.only_restart_peer_connection = false;
        self.first_connection_attempt_at = None;
        self.last_active_at = None;
        self.retry_count = 0;
        self.backoff.reset();
    }

    pub fn started_connection_attempt(&mut self) {
        if self.first_connection_attempt_at.is_none() {
            self.first_connection_attempt_at = Some(Instant::now());
        }
    }

    pub fn has_started_connection_attempt(&self) -> bool {
        self.first_connection_attempt_at.is_some()
    }

    /// The server answered recently, so the session counts as alive.
    pub fn mark_active(&mut self) {
        self.last_active_at = Some(Instant::now());
    }

    pub fn disable_reconnect(&mut self) {
        self.should_reconnect = false;
    }

    /// Signaling is healthy, so the next reconnect only rebuilds the peer
    /// connection.
    pub fn enable_restart_peer_connection(&mut self) {
        self.only_restart_peer_connection = true;
    }

    pub fn should_only_restart_peer_connection(&self) -> bool {
        self.only_restart_peer_connection
    }

    /// Retries scheduled in the current episode.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Stop retrying and drop any scheduled retry.
    pub fn cancel(&mut self) {
        self.disable_reconnect();
        if let Some(token) = self.pending_retry.take() {
            token.cancel();
        }
    }

    /// Schedule `retry` after the next backoff interval. Returns `false`
    /// when reconnecting is disabled or the deadline has passed.
    pub fn retry_with_backoff<F>(&mut self, retry: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let will_retry = self.should_reconnect && !self.has_past_reconnect_deadline();
        if !will_retry {
            info!("will not reconnect");
            return false;
        }
        self.retry_count += 1;
        let wait = Duration::from_millis(self.backoff.next_backoff_amount_ms());
        debug!("retry {} scheduled in {wait:?}", self.retry_count);

        let token = CancellationToken::new();
        if let Some(previous) = self.pending_retry.replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(wait) => retry.await,
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedBackoff(u64);

    impl BackoffPolicy for FixedBackoff {
        fn next_backoff_amount_ms(&mut self) -> u64 {
            self.0
        }

        fn reset(&mut self) {}
    }

    fn controller() -> ReconnectController {
        ReconnectController::new(Duration::from_secs(120), Box::new(FixedBackoff(100)))
    }

    #[test]
    fn jitter_stays_inside_window() {
        let mut backoff = FullJitterBackoff::new(10, 1000, 5000);
        let first = backoff.next_backoff_amount_ms();
        assert!((10..=1010).contains(&first));
        for _ in 0..20 {
            assert!((10..=5010).contains(&backoff.next_backoff_amount_ms()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_runs_after_backoff() {
        let mut controller = controller();
        controller.started_connection_attempt();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        assert!(controller.retry_with_backoff(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(controller.retry_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_retry_and_disables() {
        let mut controller = controller();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        controller.retry_with_backoff(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        controller.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!controller.retry_with_backoff(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retries_until_reset() {
        let mut controller = controller();
        controller.started_connection_attempt();
        assert!(controller.retry_with_backoff(async {}));
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!controller.retry_with_backoff(async {}));
        assert_eq!(controller.retry_count(), 1);

        controller.reset();
        assert_eq!(controller.retry_count(), 0);
        assert!(controller.retry_with_backoff(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn being_active_keeps_the_deadline_away() {
        let mut controller = controller();
        controller.mark_active();
        tokio::time::advance(Duration::from_secs(60)).await;
        controller.mark_active();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(controller.retry_with_backoff(async {}));
    }

    #[test]
    fn peer_only_restart_lasts_until_reset() {
        let mut controller = controller();
        assert!(!controller.should_only_restart_peer_connection());
        controller.enable_restart_peer_connection();
        assert!(controller.should_only_restart_peer_connection());
        controller.reset();
        assert!(!controller.should_only_restart_peer_connection());
    }
}
