//! Readiness detection - decides when a starting server has finished booting
//! by scanning captured console output for a sentinel line.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use super::output::OutputRing;
use super::state_machine::{Lifecycle, ServerState};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Predicate over a single console line.
pub trait SentinelMatcher: Send + Sync {
    fn matches(&self, line: &str) -> bool;

    fn describe(&self) -> String {
        "custom predicate".to_string()
    }
}

impl<F> SentinelMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, line: &str) -> bool {
        self(line)
    }
}

/// Matches a line containing every needle.
#[derive(Debug, Clone)]
pub struct ContainsAll {
    needles: Vec<String>,
}

impl ContainsAll {
    pub fn new<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            needles: needles.into_iter().map(Into::into).collect(),
        }
    }

    /// `[12:00:00] [Server thread/INFO]: Done (5.123s)! For help, type "help"`
    pub fn minecraft() -> Self {
        Self::new(["Done", "For help, type"])
    }
}

impl SentinelMatcher for ContainsAll {
    fn matches(&self, line: &str) -> bool {
        self.needles.iter().all(|n| line.contains(n.as_str()))
    }

    fn describe(&self) -> String {
        format!("line containing {:?}", self.needles)
    }
}

#[derive(Debug, Clone)]
pub struct PatternSentinel(Regex);

impl PatternSentinel {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }
}

impl SentinelMatcher for PatternSentinel {
    fn matches(&self, line: &str) -> bool {
        self.0.is_match(line)
    }

    fn describe(&self) -> String {
        format!("line matching /{}/", self.0.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    /// Soft failure: the server may simply be slow to log the sentinel.
    #[error("readiness sentinel not observed within {0:?}")]
    Timeout(Duration),
    #[error("server left the starting phase ({0}) before becoming ready")]
    Abandoned(Lifecycle),
}

#[derive(Clone)]
pub struct ReadinessDetector {
    matcher: Arc<dyn SentinelMatcher>,
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for ReadinessDetector {
    fn default() -> Self {
        Self::new(ContainsAll::minecraft())
    }
}

impl ReadinessDetector {
    pub fn new(matcher: impl SentinelMatcher + 'static) -> Self {
        Self {
            matcher: Arc::new(matcher),
            timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn describe(&self) -> String {
        self.matcher.describe()
    }

    /// Scan the ring once per poll interval until the sentinel shows up.
    ///
    /// Returns the time waited. Gives up with `Abandoned` as soon as the
    /// lifecycle leaves Starting, and with `Timeout` exactly at the deadline.
    pub async fn poll_until_ready(
        &self,
        ring: &OutputRing,
        mut lifecycle: watch::Receiver<ServerState>,
    ) -> Result<Duration, ReadinessError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut watching = true;

        loop {
            if ring.any_line(|line| self.matcher.matches(line)) {
                return Ok(started.elapsed());
            }

            let phase = lifecycle.borrow_and_update().lifecycle;
            if phase != Lifecycle::Starting {
                return Err(ReadinessError::Abandoned(phase));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReadinessError::Timeout(self.timeout));
            }
            let wake = (now + self.poll_interval).min(deadline);

            if watching {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    changed = lifecycle.changed() => {
                        // sender가 사라지면 주기 폴링만 계속
                        if changed.is_err() {
                            watching = false;
                        }
                    }
                }
            } else {
                tokio::time::sleep_until(wake).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::output::LogSource;
    use crate::supervisor::state_machine::StateMachine;

    fn starting_state() -> StateMachine {
        let sm = StateMachine::new();
        sm.begin_generation(Some(1)).unwrap();
        sm
    }

    #[test]
    fn minecraft_sentinel() {
        let m = ContainsAll::minecraft();
        assert!(m.matches("[12:00:00] [Server thread/INFO]: Done (5.123s)! For help, type \"help\""));
        assert!(!m.matches("[12:00:00] [Server thread/INFO]: Done preparing level"));
        assert!(!m.matches("For help, type \"help\""));
    }

    #[test]
    fn pattern_sentinel() {
        let m = PatternSentinel::new(r"Server started on port \d+").unwrap();
        assert!(m.matches("[INFO] Server started on port 7777"));
        assert!(!m.matches("[INFO] Server starting"));
        assert!(PatternSentinel::new("(").is_err());
    }

    #[test]
    fn closure_sentinel() {
        let detector = ReadinessDetector::new(|line: &str| line.ends_with("ready"));
        assert!(detector.matcher.matches("world ready"));
        assert_eq!(detector.describe(), "custom predicate");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_within_one_poll_interval_of_sentinel() {
        let sm = starting_state();
        let ring = OutputRing::new();
        ring.push(LogSource::Stdout, "Starting minecraft server version 1.21");

        let writer = ring.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            writer.push(LogSource::Stdout, "Done (2.5s)! For help, type \"help\"");
        });

        let detector = ReadinessDetector::default()
            .with_timeout(Duration::from_secs(60))
            .with_poll_interval(Duration::from_secs(1));
        let start = Instant::now();
        let waited = detector.poll_until_ready(&ring, sm.subscribe()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(waited, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_already_present_returns_immediately() {
        let sm = starting_state();
        let ring = OutputRing::new();
        ring.push(LogSource::Stdout, "Done (1.0s)! For help, type \"help\"");

        let waited = ReadinessDetector::default()
            .poll_until_ready(&ring, sm.subscribe())
            .await
            .unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_exactly_at_budget() {
        let sm = starting_state();
        let ring = OutputRing::new();
        ring.push(LogSource::Stdout, "Preparing level \"world\"");

        let detector = ReadinessDetector::default()
            .with_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_secs(1));
        let start = Instant::now();
        let result = detector.poll_until_ready(&ring, sm.subscribe()).await;

        assert_eq!(result, Err(ReadinessError::Timeout(Duration::from_secs(5))));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_not_multiple_of_interval_still_exact() {
        let sm = starting_state();
        let ring = OutputRing::new();

        let detector = ReadinessDetector::default()
            .with_timeout(Duration::from_millis(2300))
            .with_poll_interval(Duration::from_secs(1));
        let start = Instant::now();
        let result = detector.poll_until_ready(&ring, sm.subscribe()).await;

        assert!(matches!(result, Err(ReadinessError::Timeout(_))));
        assert_eq!(start.elapsed(), Duration::from_millis(2300));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_early_when_process_dies() {
        let sm = starting_state();
        let generation = sm.current().generation;
        let ring = OutputRing::new();

        let reporter = sm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            reporter.finish_generation(generation);
        });

        let detector = ReadinessDetector::default().with_timeout(Duration::from_secs(60));
        let start = Instant::now();
        let result = detector.poll_until_ready(&ring, sm.subscribe()).await;

        assert_eq!(result, Err(ReadinessError::Abandoned(Lifecycle::Failed)));
        // 폴링 주기를 기다리지 않고 상태 변화 즉시 종료
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn not_starting_is_abandoned_immediately() {
        let sm = StateMachine::new();
        let ring = OutputRing::new();
        let result = ReadinessDetector::default()
            .poll_until_ready(&ring, sm.subscribe())
            .await;
        assert_eq!(result, Err(ReadinessError::Abandoned(Lifecycle::NotStarted)));
    }
}
