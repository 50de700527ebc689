//! Automatic Transaction Generator (C8): per-connector session loop that
//! starts/stops transactions on a randomized schedule.
//!
//! Modeled as a pure state machine polled by the station mailbox (spec.md
//! §5's single cooperative worker per station) rather than a free-running
//! task: [`ConnectorAtg::tick`] is called once per mailbox iteration and
//! returns the action, if any, the station should carry out. All actual
//! OCPP requests (Authorize/StartTransaction/StopTransaction) stay in
//! `station.rs`, which owns the registry and connection.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct AtgConfig {
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub min_delay_between_transactions: Duration,
    pub max_delay_between_transactions: Duration,
    pub probability_of_start: f64,
    pub stop_after: Duration,
    pub stop_on_connection_failure: bool,
    pub require_authorize: bool,
}

/// Per-connector counters mirrored by `performanceStatistics` (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub authorize_requests: u64,
    pub authorize_accepted: u64,
    pub authorize_rejected: u64,
    pub start_transaction_requests: u64,
    pub start_transaction_accepted: u64,
    pub start_transaction_rejected: u64,
    pub stop_transaction_requests: u64,
    pub stop_transaction_accepted: u64,
    pub stop_transaction_rejected: u64,
    pub skipped_consecutive: u64,
    pub skipped_total: u64,
    pub start_date: Option<DateTime<Utc>>,
    pub stop_date: Option<DateTime<Utc>>,
    pub stopped_date: Option<DateTime<Utc>>,
    pub started: bool,
}

#[derive(Debug, Clone)]
enum State {
    WaitingNext { at: Instant },
    InTransaction { ends_at: Instant },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtgTick {
    None,
    Skipped,
    Start,
    Stop,
}

pub struct ConnectorAtg {
    pub connector_id: u32,
    config: AtgConfig,
    stats: SessionStats,
    state: State,
    run_started_at: DateTime<Utc>,
}

impl ConnectorAtg {
    /// `last_run_date` carries over an ATG run across a station restart; a
    /// missing value (no prior run recorded) is treated as zero *elapsed
    /// time* — the session budget starts fresh from now, rather than
    /// reading a stale configuration's `stopAfterHours` window as already
    /// elapsed.
    pub fn new(connector_id: u32, config: AtgConfig, last_run_date: Option<DateTime<Utc>>) -> Self {
        let run_started_at = last_run_date.unwrap_or_else(Utc::now);
        Self {
            connector_id,
            config,
            stats: SessionStats::default(),
            state: State::WaitingNext { at: Instant::now() },
            run_started_at,
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn elapsed_since_run_start(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.run_started_at)
            .to_std()
            .unwrap_or(Duration::MAX)
    }

    fn random_between(min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span_ms = (max - min).as_millis() as u64;
        let offset = rand::thread_rng().gen_range(0..=span_ms);
        min + Duration::from_millis(offset)
    }

    /// Advance the state machine. `connector_available` reflects whether the
    /// connector is currently `Available` and `Operative`.
    pub fn tick(&mut self, now: Instant, connector_available: bool) -> AtgTick {
        if matches!(self.state, State::Stopped) {
            return AtgTick::None;
        }

        if self.elapsed_since_run_start() > self.config.stop_after {
            self.state = State::Stopped;
            self.stats.stopped_date = Some(Utc::now());
            return AtgTick::None;
        }

        match self.state {
            State::InTransaction { ends_at } => {
                if now >= ends_at {
                    AtgTick::Stop
                } else {
                    AtgTick::None
                }
            }
            State::WaitingNext { at } => {
                if now < at {
                    return AtgTick::None;
                }
                if !connector_available {
                    self.state = State::WaitingNext {
                        at: now + Self::random_between(
                            self.config.min_delay_between_transactions,
                            self.config.max_delay_between_transactions,
                        ),
                    };
                    return AtgTick::None;
                }
                let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
                if roll > self.config.probability_of_start {
                    self.stats.skipped_consecutive += 1;
                    self.stats.skipped_total += 1;
                    self.state = State::WaitingNext {
                        at: now + Self::random_between(
                            self.config.min_delay_between_transactions,
                            self.config.max_delay_between_transactions,
                        ),
                    };
                    return AtgTick::Skipped;
                }
                AtgTick::Start
            }
            State::Stopped => AtgTick::None,
        }
    }

    pub fn config(&self) -> &AtgConfig {
        &self.config
    }

    pub fn require_authorize(&self) -> bool {
        self.config.require_authorize
    }

    pub fn record_authorize(&mut self, accepted: bool) {
        self.stats.authorize_requests += 1;
        if accepted {
            self.stats.authorize_accepted += 1;
        } else {
            self.stats.authorize_rejected += 1;
        }
    }

    /// Called once a StartTransaction has been accepted; begins the
    /// in-transaction window.
    pub fn record_started(&mut self, now: Instant, accepted: bool) {
        self.stats.start_transaction_requests += 1;
        if accepted {
            self.stats.start_transaction_accepted += 1;
            self.stats.skipped_consecutive = 0;
            self.stats.started = true;
            self.stats.start_date.get_or_insert(Utc::now());
            let duration = Self::random_between(self.config.min_duration, self.config.max_duration);
            self.state = State::InTransaction { ends_at: now + duration };
        } else {
            self.stats.start_transaction_rejected += 1;
            self.state = State::WaitingNext {
                at: now + Self::random_between(
                    self.config.min_delay_between_transactions,
                    self.config.max_delay_between_transactions,
                ),
            };
        }
    }

    pub fn record_stopped(&mut self, now: Instant, accepted: bool) {
        self.stats.stop_transaction_requests += 1;
        if accepted {
            self.stats.stop_transaction_accepted += 1;
        } else {
            self.stats.stop_transaction_rejected += 1;
        }
        self.stats.started = false;
        self.stats.stop_date = Some(Utc::now());
        self.state = State::WaitingNext {
            at: now + Self::random_between(
                self.config.min_delay_between_transactions,
                self.config.max_delay_between_transactions,
            ),
        };
    }

    /// A transport failure during an active session; `stopOnConnectionFailure`
    /// decides whether the ATG halts entirely or just retries on schedule.
    pub fn record_connection_failure(&mut self, now: Instant) {
        if self.config.stop_on_connection_failure {
            self.state = State::Stopped;
            self.stats.stopped_date = Some(Utc::now());
        } else {
            self.state = State::WaitingNext {
                at: now + Self::random_between(
                    self.config.min_delay_between_transactions,
                    self.config.max_delay_between_transactions,
                ),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AtgConfig {
        AtgConfig {
            min_duration: Duration::from_millis(1),
            max_duration: Duration::from_millis(2),
            min_delay_between_transactions: Duration::from_millis(1),
            max_delay_between_transactions: Duration::from_millis(2),
            probability_of_start: 1.0,
            stop_after: Duration::from_secs(3600),
            stop_on_connection_failure: false,
            require_authorize: false,
        }
    }

    #[test]
    fn always_starts_when_probability_is_one() {
        let mut atg = ConnectorAtg::new(1, cfg(), Some(Utc::now()));
        assert_eq!(atg.tick(Instant::now(), true), AtgTick::Start);
    }

    #[test]
    fn never_starts_when_probability_is_zero() {
        let mut c = cfg();
        c.probability_of_start = 0.0;
        let mut atg = ConnectorAtg::new(1, c, Some(Utc::now()));
        assert_eq!(atg.tick(Instant::now(), true), AtgTick::Skipped);
        assert_eq!(atg.stats().skipped_total, 1);
    }

    #[test]
    fn unavailable_connector_never_starts() {
        let mut atg = ConnectorAtg::new(1, cfg(), Some(Utc::now()));
        assert_eq!(atg.tick(Instant::now(), false), AtgTick::None);
    }

    #[test]
    fn missing_last_run_date_starts_with_a_fresh_session_budget() {
        let mut c = cfg();
        c.stop_after = Duration::from_secs(3600);
        let mut atg = ConnectorAtg::new(1, c, None);
        assert_eq!(atg.tick(Instant::now(), true), AtgTick::Start);
    }

    #[test]
    fn accepted_start_enters_transaction_then_eventually_stops() {
        let mut atg = ConnectorAtg::new(1, cfg(), Some(Utc::now()));
        let now = Instant::now();
        atg.record_started(now, true);
        assert!(atg.stats().started);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(atg.tick(Instant::now(), true), AtgTick::Stop);
    }

    #[test]
    fn rejected_start_resets_skip_is_not_counted_as_skip() {
        let mut atg = ConnectorAtg::new(1, cfg(), Some(Utc::now()));
        let now = Instant::now();
        atg.record_started(now, false);
        assert_eq!(atg.stats().skipped_total, 0);
        assert_eq!(atg.stats().start_transaction_rejected, 1);
    }
}
