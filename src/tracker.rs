use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::command::Command;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Finished,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Error)
    }

    /// Server statuses other than `finished` and `error` mean "keep polling".
    pub fn from_status(status: &str) -> JobState {
        match status.trim() {
            "finished" => JobState::Finished,
            "error" => JobState::Error,
            _ => JobState::Running,
        }
    }
}

/// Body of `GET /data/sync/progress`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
}

#[cfg(test)]
impl JobStatusResponse {
    pub fn running(current: u64, total: u64) -> Self {
        JobStatusResponse {
            status: "running".to_string(),
            message: None,
            current,
            total,
        }
    }

    pub fn finished(current: u64, total: u64) -> Self {
        JobStatusResponse {
            status: "finished".to_string(),
            message: Some("Finished".to_string()),
            current,
            total,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        JobStatusResponse {
            status: "error".to_string(),
            message: Some(message.into()),
            current: 0,
            total: 0,
        }
    }
}

/// Local view of the one background job being watched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncJob {
    pub state: JobState,
    pub message: String,
    pub current: u64,
    pub total: u64,
}

impl SyncJob {
    fn apply(&mut self, response: &JobStatusResponse) {
        self.state = JobState::from_status(&response.status);
        if let Some(message) = &response.message {
            self.message = message.clone();
        }
        self.total = response.total;
        self.current = if response.total > 0 {
            response.current.min(response.total)
        } else {
            response.current
        };
    }

    /// Whole-number percent, 0 while the total is unknown.
    pub fn percent(&self) -> u16 {
        if self.total == 0 {
            return 0;
        }
        ((self.current as f64 / self.total as f64) * 100.0).round() as u16
    }

    pub fn ratio(&self) -> f64 {
        f64::from(self.percent().min(100)) / 100.0
    }
}

/// Poll-generation token. Invalidating it cancels every poll loop that
/// captured the previous generation, including one whose request is in
/// flight.
#[derive(Debug, Clone, Default)]
pub struct PollToken {
    generation: Arc<AtomicU64>,
}

impl PollToken {
    pub fn new() -> Self {
        PollToken::default()
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Source of job status, normally the HTTP client.
pub trait StatusSource {
    fn fetch_status(&self) -> impl Future<Output = Result<JobStatusResponse>>;
}

/// Scheduler used by the poll loop. Tests swap in a virtual clock.
pub trait Clock {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

impl<S: StatusSource + ?Sized> StatusSource for &S {
    fn fetch_status(&self) -> impl Future<Output = Result<JobStatusResponse>> {
        (**self).fetch_status()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        (**self).sleep(duration)
    }
}

#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        TokioClock {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        TokioClock::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub timeout: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutcome {
    Finished {
        message: String,
        refresh_listing: bool,
    },
    Failed(String),
    TimedOut,
    Cancelled,
}

impl TrackerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrackerOutcome::Finished { .. } => "finished",
            TrackerOutcome::Failed(_) => "error",
            TrackerOutcome::TimedOut => "timeout",
            TrackerOutcome::Cancelled => "cancelled",
        }
    }
}

/// Watches one accepted sync job until it finishes, fails, times out, or
/// the caller tears it down. Progress and the single terminal report go
/// out on the command bus.
pub struct SyncTracker<S, C> {
    source: S,
    clock: C,
    config: TrackerConfig,
    token: PollToken,
    generation: u64,
    job: SyncJob,
    tx: broadcast::Sender<Command>,
}

impl<S: StatusSource, C: Clock> SyncTracker<S, C> {
    pub fn new(source: S, clock: C, config: TrackerConfig, tx: broadcast::Sender<Command>) -> Self {
        let token = PollToken::new();
        let generation = token.current();
        SyncTracker {
            source,
            clock,
            config,
            token,
            generation,
            job: SyncJob::default(),
            tx,
        }
    }

    /// Shares a token the caller already holds, e.g. one owned by a view.
    pub fn with_token(mut self, token: PollToken) -> Self {
        self.generation = token.current();
        self.token = token;
        self
    }

    #[cfg(test)]
    pub fn teardown(&self) {
        self.token.invalidate();
    }

    #[cfg(test)]
    pub fn state(&self) -> JobState {
        self.job.state
    }

    #[cfg(test)]
    pub fn job(&self) -> &SyncJob {
        &self.job
    }

    fn active(&self) -> bool {
        self.token.is_current(self.generation)
    }

    pub async fn run(&mut self) -> TrackerOutcome {
        if !self.active() {
            return self.cancelled();
        }
        self.job = SyncJob {
            state: JobState::Running,
            ..SyncJob::default()
        };
        info!(interval = ?self.config.poll_interval, "sync job accepted, polling progress");
        let started = self.clock.now();
        loop {
            self.clock.sleep(self.config.poll_interval).await;
            if !self.active() {
                return self.cancelled();
            }
            if let Some(limit) = self.config.timeout {
                if self.clock.now().saturating_sub(started) >= limit {
                    return self.timed_out(limit);
                }
            }
            let response = self.source.fetch_status().await;
            if !self.active() {
                return self.cancelled();
            }
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    warn!("sync progress poll failed, retrying: {err:#}");
                    let _ = self.tx.send(Command::Error(format!("进度查询失败: {err}")));
                    continue;
                }
            };
            debug!(
                status = %response.status,
                current = response.current,
                total = response.total,
                "sync progress"
            );
            self.job.apply(&response);
            let _ = self.tx.send(Command::SyncProgress(self.job.clone()));
            match self.job.state {
                JobState::Finished => return self.finish().await,
                JobState::Error => return self.fail(),
                JobState::Idle | JobState::Running => {}
            }
        }
    }

    async fn finish(&mut self) -> TrackerOutcome {
        self.clock.sleep(self.config.grace_period).await;
        if !self.active() {
            return self.cancelled();
        }
        self.token.invalidate();
        let message = self.job.message.clone();
        info!(message = %message, "sync job finished");
        let _ = self.tx.send(Command::SyncFinished {
            message: message.clone(),
            refresh_listing: true,
        });
        TrackerOutcome::Finished {
            message,
            refresh_listing: true,
        }
    }

    fn fail(&mut self) -> TrackerOutcome {
        self.token.invalidate();
        let message = self.job.message.clone();
        error!(message = %message, "sync job failed");
        let _ = self.tx.send(Command::SyncFailed(message.clone()));
        TrackerOutcome::Failed(message)
    }

    fn timed_out(&mut self, limit: Duration) -> TrackerOutcome {
        self.token.invalidate();
        warn!(limit = ?limit, "gave up waiting for sync job");
        let _ = self.tx.send(Command::SyncTimedOut);
        TrackerOutcome::TimedOut
    }

    fn cancelled(&self) -> TrackerOutcome {
        debug!("sync tracker torn down");
        TrackerOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use anyhow::anyhow;

    use super::*;

    #[derive(Default)]
    struct FakeClock {
        elapsed: Cell<Duration>,
        sleeps: RefCell<Vec<Duration>>,
        teardown_on_sleep: Option<(usize, PollToken)>,
    }

    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            self.elapsed.get()
        }

        async fn sleep(&self, duration: Duration) {
            self.elapsed.set(self.elapsed.get() + duration);
            self.sleeps.borrow_mut().push(duration);
            if let Some((at, token)) = &self.teardown_on_sleep {
                if *at == self.sleeps.borrow().len() {
                    token.invalidate();
                }
            }
            tokio::task::yield_now().await;
        }
    }

    struct ScriptedSource {
        script: RefCell<VecDeque<Result<JobStatusResponse>>>,
        polls: Cell<usize>,
        teardown_on_poll: Option<(usize, PollToken)>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<JobStatusResponse>>) -> Self {
            ScriptedSource {
                script: RefCell::new(script.into()),
                polls: Cell::new(0),
                teardown_on_poll: None,
            }
        }
    }

    impl StatusSource for ScriptedSource {
        async fn fetch_status(&self) -> Result<JobStatusResponse> {
            let poll = self.polls.get() + 1;
            self.polls.set(poll);
            if let Some((at, token)) = &self.teardown_on_poll {
                if *at == poll {
                    token.invalidate();
                }
            }
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(JobStatusResponse::running(0, 0)))
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Command>) -> Vec<Command> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn terminal_events(events: &[Command]) -> usize {
        events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    Command::SyncFinished { .. } | Command::SyncFailed(_) | Command::SyncTimedOut
                )
            })
            .count()
    }

    #[tokio::test]
    async fn completes_once_after_third_poll() {
        let source = ScriptedSource::new(vec![
            Ok(JobStatusResponse::running(30, 100)),
            Ok(JobStatusResponse::running(70, 100)),
            Ok(JobStatusResponse::finished(100, 100)),
        ]);
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker = SyncTracker::new(&source, &clock, TrackerConfig::default(), tx);
        assert_eq!(tracker.state(), JobState::Idle);

        let outcome = tracker.run().await;

        assert_eq!(
            outcome,
            TrackerOutcome::Finished {
                message: "Finished".to_string(),
                refresh_listing: true
            }
        );
        assert_eq!(source.polls.get(), 3);
        assert_eq!(tracker.state(), JobState::Finished);
        assert_eq!(tracker.job().percent(), 100);
        // three poll periods plus the grace period
        assert_eq!(clock.now(), Duration::from_secs(4));

        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 1);
        assert!(matches!(
            events.last(),
            Some(Command::SyncFinished {
                refresh_listing: true,
                ..
            })
        ));
        let progress: Vec<u16> = events
            .iter()
            .filter_map(|event| match event {
                Command::SyncProgress(job) => Some(job.percent()),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![30, 70, 100]);
    }

    #[tokio::test]
    async fn error_is_reported_immediately() {
        let source = ScriptedSource::new(vec![
            Ok(JobStatusResponse::running(10, 50)),
            Ok(JobStatusResponse::error("disk full")),
        ]);
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker = SyncTracker::new(&source, &clock, TrackerConfig::default(), tx);

        let outcome = tracker.run().await;

        assert_eq!(outcome, TrackerOutcome::Failed("disk full".to_string()));
        assert_eq!(source.polls.get(), 2);
        assert_eq!(tracker.state(), JobState::Error);
        assert_eq!(clock.now(), Duration::from_secs(2));
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 1);
        assert!(matches!(events.last(), Some(Command::SyncFailed(msg)) if msg == "disk full"));
    }

    #[tokio::test]
    async fn transport_errors_are_transient() {
        let source = ScriptedSource::new(vec![
            Err(anyhow!("connection refused")),
            Ok(JobStatusResponse::running(10, 50)),
            Err(anyhow!("timed out")),
            Ok(JobStatusResponse::finished(50, 50)),
        ]);
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker = SyncTracker::new(&source, &clock, TrackerConfig::default(), tx);

        let outcome = tracker.run().await;

        assert!(matches!(outcome, TrackerOutcome::Finished { .. }));
        assert_eq!(source.polls.get(), 4);
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 1);
        let faults = events
            .iter()
            .filter(|event| matches!(event, Command::Error(_)))
            .count();
        assert_eq!(faults, 2);
    }

    #[tokio::test]
    async fn unknown_statuses_keep_polling() {
        let source = ScriptedSource::new(vec![
            Ok(JobStatusResponse {
                status: "idle".to_string(),
                ..JobStatusResponse::default()
            }),
            Ok(JobStatusResponse {
                status: "queued".to_string(),
                ..JobStatusResponse::default()
            }),
            Ok(JobStatusResponse::finished(1, 1)),
        ]);
        let clock = FakeClock::default();
        let (tx, _rx) = broadcast::channel(16);
        let mut tracker = SyncTracker::new(&source, &clock, TrackerConfig::default(), tx);

        assert!(matches!(tracker.run().await, TrackerOutcome::Finished { .. }));
        assert_eq!(source.polls.get(), 3);
    }

    #[tokio::test]
    async fn teardown_before_start_never_polls() {
        let source = ScriptedSource::new(vec![Ok(JobStatusResponse::finished(1, 1))]);
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker = SyncTracker::new(&source, &clock, TrackerConfig::default(), tx);
        tracker.teardown();

        assert_eq!(tracker.run().await, TrackerOutcome::Cancelled);
        assert_eq!(source.polls.get(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn in_flight_response_after_teardown_is_discarded() {
        let token = PollToken::new();
        let mut source = ScriptedSource::new(vec![
            Ok(JobStatusResponse::running(1, 3)),
            Ok(JobStatusResponse::finished(3, 3)),
        ]);
        source.teardown_on_poll = Some((2, token.clone()));
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker =
            SyncTracker::new(&source, &clock, TrackerConfig::default(), tx).with_token(token);

        let outcome = tracker.run().await;

        assert_eq!(outcome, TrackerOutcome::Cancelled);
        assert_eq!(source.polls.get(), 2);
        assert_eq!(tracker.state(), JobState::Running);
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 0);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn teardown_during_grace_suppresses_completion() {
        let token = PollToken::new();
        let source = ScriptedSource::new(vec![Ok(JobStatusResponse::finished(3, 3))]);
        // sleep #1 is the poll period, sleep #2 the grace period
        let clock = FakeClock {
            teardown_on_sleep: Some((2, token.clone())),
            ..FakeClock::default()
        };
        let (tx, mut rx) = broadcast::channel(16);
        let mut tracker =
            SyncTracker::new(&source, &clock, TrackerConfig::default(), tx).with_token(token);

        assert_eq!(tracker.run().await, TrackerOutcome::Cancelled);
        assert_eq!(source.polls.get(), 1);
        assert_eq!(clock.sleeps.borrow().len(), 2);
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 0);
    }

    #[tokio::test]
    async fn times_out_when_job_never_finishes() {
        let source = ScriptedSource::new(Vec::new());
        let clock = FakeClock::default();
        let (tx, mut rx) = broadcast::channel(16);
        let config = TrackerConfig {
            timeout: Some(Duration::from_secs(3)),
            ..TrackerConfig::default()
        };
        let mut tracker = SyncTracker::new(&source, &clock, config, tx);

        assert_eq!(tracker.run().await, TrackerOutcome::TimedOut);
        assert_eq!(source.polls.get(), 2);
        let events = drain(&mut rx);
        assert_eq!(terminal_events(&events), 1);
        assert!(matches!(events.last(), Some(Command::SyncTimedOut)));
    }

    #[test]
    fn progress_is_clamped_and_rounded() {
        let mut job = SyncJob::default();
        job.apply(&JobStatusResponse::running(120, 100));
        assert_eq!(job.current, 100);
        assert_eq!(job.percent(), 100);
        job.apply(&JobStatusResponse::running(1, 3));
        assert_eq!(job.percent(), 33);
        job.apply(&JobStatusResponse::running(5, 0));
        assert_eq!(job.percent(), 0);
    }

    #[test]
    fn status_response_tolerates_missing_fields() {
        let parsed: JobStatusResponse =
            serde_json::from_str(r#"{"status":"running","type":"daily","message":null}"#).unwrap();
        assert_eq!(parsed.status, "running");
        assert_eq!(parsed.message, None);
        assert_eq!(parsed.total, 0);
        assert_eq!(JobState::from_status("idle"), JobState::Running);
    }
}
