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

//! Connection health data and the policy that decides when to reconnect.

use crate::config::ConnectionHealthPolicyConfiguration;
use log::warn;
use std::time::Duration;
use tokio::time::Instant;

/// A snapshot of connection health, fed by the ping and stats collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealthData {
    pub connection_started_at: Instant,
    pub consecutive_stats_with_no_packets: u32,
    pub consecutive_missed_pongs: u32,
    pub audio_speaker_delay_ms: u64,
}

impl Default for ConnectionHealthData {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHealthData {
    pub fn new() -> Self {
        Self {
            connection_started_at: Instant::now(),
            consecutive_stats_with_no_packets: 0,
            consecutive_missed_pongs: 0,
            audio_speaker_delay_ms: 0,
        }
    }

    pub fn is_connection_start_recent(&self, recent: Duration) -> bool {
        Instant::now() < self.connection_started_at + recent
    }
}

/// Health is 1 while the connection is usable and 0 when a reconnect is
/// recommended.
#[derive(Debug)]
pub struct ReconnectionHealthPolicy {
    configuration: ConnectionHealthPolicyConfiguration,
    current: ConnectionHealthData,
    last_health: u8,
    audio_delay_points_over_maximum: usize,
}

impl ReconnectionHealthPolicy {
    pub const MAXIMUM_HEALTH: u8 = 1;
    pub const MINIMUM_HEALTH: u8 = 0;

    pub fn new(
        configuration: ConnectionHealthPolicyConfiguration,
        data: ConnectionHealthData,
    ) -> Self {
        Self {
            configuration,
            current: data,
            last_health: Self::MAXIMUM_HEALTH,
            audio_delay_points_over_maximum: 0,
        }
    }

    pub fn update(&mut self, data: ConnectionHealthData) {
        self.current = data;
    }

    pub fn health(&mut self) -> u8 {
        let config = &self.configuration;
        let wait = Duration::from_millis(config.connection_wait_after_start_ms);
        if self.current.is_connection_start_recent(wait) {
            return Self::MAXIMUM_HEALTH;
        }

        let no_packets = self.current.consecutive_stats_with_no_packets
            >= config.consecutive_stats_with_no_packets_threshold;
        let missed_pongs =
            self.current.consecutive_missed_pongs >= config.missed_pongs_upper_threshold;

        if self.current.audio_speaker_delay_ms > config.maximum_audio_delay_ms {
            self.audio_delay_points_over_maximum += 1;
        } else {
            self.audio_delay_points_over_maximum = 0;
        }
        let bad_audio_delay =
            self.audio_delay_points_over_maximum > config.maximum_audio_delay_data_points;
        if bad_audio_delay {
            self.audio_delay_points_over_maximum = 0;
        }

        if no_packets || missed_pongs || bad_audio_delay {
            warn!(
                "reconnection recommended due to: no packets received: {no_packets}, missed pongs: {missed_pongs}, bad audio delay: {bad_audio_delay}"
            );
            return Self::MINIMUM_HEALTH;
        }
        Self::MAXIMUM_HEALTH
    }

    /// The new health value, only when it differs from the last one seen.
    pub fn health_if_changed(&mut self) -> Option<u8> {
        let health = self.health();
        if health != self.last_health {
            self.last_health = health;
            return Some(health);
        }
        None
    }
}
