//! Poll scheduler: waits for the next due time or a button press, then runs
//! one cycle of sensor read, compose, synthesize and play under the supervisor.

use crate::error::StageResult;
use crate::message::{self, MessagePolicy, Notification};
use crate::netatmo::{SensorReading, StationApi};
use crate::speaker::{self, Speaker};
use crate::speech::{SpeechArtifact, SpeechSynthesizer};
use crate::status_bridge::{Status, StatusIndicator};
use crate::supervisor::{FuseDepleted, Stage, Supervisor};
use crate::trigger_bridge::TriggerEvent;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{sleep_until, Duration, Instant};

/// The stage calls of one poll cycle, without any retry policy.
pub struct Pipeline {
    pub station: Arc<dyn StationApi>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub speaker: Arc<dyn Speaker>,
    pub location: String,
    pub speaker_name: String,
    pub language: String,
    pub policy: MessagePolicy,
}

impl Pipeline {
    /// Token and station read as one unit. The token is fetched fresh and
    /// dropped when the read completes.
    pub async fn read_reading(&self) -> StageResult<SensorReading> {
        let token = self.station.acquire_token().await?;
        self.station.read_co2(&token, &self.location).await
    }

    pub async fn synthesize(&self, text: &str) -> StageResult<SpeechArtifact> {
        self.synthesizer.synthesize(text, &self.language).await
    }

    pub async fn play(&self, artifact: &SpeechArtifact) -> StageResult<()> {
        speaker::dispatch(self.speaker.as_ref(), artifact, &self.speaker_name).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    next_due: Instant,
}

impl ScheduleState {
    /// Due immediately, so the first cycle runs at boot.
    pub fn new(now: Instant) -> Self {
        Self { next_due: now }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn advance(&mut self, now: Instant, interval: Duration) {
        self.next_due = now + interval;
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub reading: SensorReading,
    pub notification: Notification,
    pub spoken: bool,
    pub next_due: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Due,
    Pressed,
    TriggerClosed,
}

/// Drains queued presses without waiting. Drops the receiver once the
/// sending side is gone.
fn take_press(trigger: &mut Option<mpsc::Receiver<TriggerEvent>>) -> bool {
    let Some(rx) = trigger.as_mut() else {
        return false;
    };
    let mut pressed = false;
    let mut closed = false;
    loop {
        match rx.try_recv() {
            Ok(TriggerEvent::Pressed) => pressed = true,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                closed = true;
                break;
            }
        }
    }
    if closed {
        log::warn!("Trigger input closed, continuing on the timer only");
        *trigger = None;
    }
    pressed
}

pub struct PollScheduler {
    pipeline: Pipeline,
    supervisor: Supervisor,
    schedule: ScheduleState,
    interval: Duration,
    indicator: Arc<dyn StatusIndicator>,
}

impl PollScheduler {
    pub fn new(
        pipeline: Pipeline,
        supervisor: Supervisor,
        interval: Duration,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Self {
        Self {
            pipeline,
            supervisor,
            schedule: ScheduleState::new(Instant::now()),
            interval,
            indicator,
        }
    }

    #[cfg(test)]
    pub fn next_due(&self) -> Instant {
        self.schedule.next_due()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn run_cycle(&mut self, forced: bool) -> Result<CycleReport, FuseDepleted> {
        log::info!("Poll cycle for {} (forced={})", self.pipeline.location, forced);
        self.indicator.show(Status::Healthy).await;

        let pipeline = &self.pipeline;
        let reading = self
            .supervisor
            .guard(Stage::Compose, move || pipeline.read_reading())
            .await?;

        let notification = message::compose(&reading, forced, &pipeline.policy);

        let mut spoken = false;
        if !notification.is_suppressed() {
            let text = notification.text.as_str();
            let artifact = self
                .supervisor
                .guard(Stage::Synthesis, move || pipeline.synthesize(text))
                .await?;

            let artifact = &artifact;
            self.supervisor
                .guard(Stage::Playback, move || pipeline.play(artifact))
                .await?;
            spoken = true;
        }

        log::info!("Current time: {}", Utc::now().to_rfc2822());
        self.schedule.advance(Instant::now(), self.interval);
        log::info!(
            "Waiting for {} minute(s) before the next round...",
            self.interval.as_secs() / 60
        );
        self.indicator.show(Status::Waiting).await;

        Ok(CycleReport {
            reading,
            notification,
            spoken,
            next_due: self.schedule.next_due(),
        })
    }

    async fn wait(&self, trigger: &mut Option<mpsc::Receiver<TriggerEvent>>) -> Wake {
        if take_press(trigger) {
            return Wake::Pressed;
        }
        let due = self.schedule.next_due();
        if self.schedule.is_due(Instant::now()) {
            return Wake::Due;
        }
        let Some(rx) = trigger.as_mut() else {
            sleep_until(due).await;
            return Wake::Due;
        };
        tokio::select! {
            _ = sleep_until(due) => Wake::Due,
            event = rx.recv() => match event {
                Some(TriggerEvent::Pressed) => Wake::Pressed,
                None => Wake::TriggerClosed,
            },
        }
    }

    /// Runs cycles until the fuse is depleted. Presses that arrive while a
    /// cycle is running are dropped.
    pub async fn run(
        &mut self,
        mut trigger: Option<mpsc::Receiver<TriggerEvent>>,
    ) -> Result<(), FuseDepleted> {
        loop {
            let wake = self.wait(&mut trigger).await;
            if wake == Wake::TriggerClosed {
                log::warn!("Trigger input closed, continuing on the timer only");
                trigger = None;
                continue;
            }

            let forced = wake == Wake::Pressed;
            if forced || self.schedule.is_due(Instant::now()) {
                let report = self.run_cycle(forced).await?;
                log::debug!(
                    "Cycle done: found={}, spoken={}, message='{}', fuse={}, next in {:?}",
                    report.reading.found(),
                    report.spoken,
                    report.notification.text,
                    self.supervisor.remaining(),
                    report.next_due.saturating_duration_since(Instant::now())
                );
                if take_press(&mut trigger) {
                    log::debug!("Dropped button presses queued during the cycle");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::netatmo::Token;
    use crate::speaker::SpeakerTarget;
    use crate::status_bridge::NoIndicator;
    use crate::supervisor::tests::{delays, CountingRestart};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ADVICE: &str = " Open a window.";
    const INTERVAL: Duration = Duration::from_secs(600);

    struct FakeStation {
        co2: Option<i64>,
        token_failures: AtomicUsize,
        always_fail: bool,
        reads: AtomicUsize,
    }

    impl FakeStation {
        fn with(co2: Option<i64>) -> Self {
            Self {
                co2,
                token_failures: AtomicUsize::new(0),
                always_fail: false,
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StationApi for FakeStation {
        async fn acquire_token(&self) -> StageResult<Token> {
            if self.always_fail {
                return Err(StageError::Auth("bad credentials".into()));
            }
            let left = self.token_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.token_failures.store(left - 1, Ordering::SeqCst);
                return Err(StageError::Network("timeout".into()));
            }
            Ok(Token {
                access_token: "tok".into(),
                refresh_token: None,
                obtained_at: Utc::now(),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> StageResult<Token> {
            self.acquire_token().await
        }

        async fn read_co2(&self, token: &Token, location: &str) -> StageResult<SensorReading> {
            assert_eq!(token.access_token, "tok");
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(SensorReading {
                location: location.to_string(),
                co2_ppm: self.co2,
            })
        }
    }

    /// Takes one scripted failure if any are left.
    fn take_failure(left: &AtomicUsize) -> bool {
        left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[derive(Default)]
    struct FakeTts {
        failures: AtomicUsize,
        attempts: AtomicUsize,
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeTts {
        async fn synthesize(&self, text: &str, language: &str) -> StageResult<SpeechArtifact> {
            assert_eq!(language, "ja");
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failures) {
                return Err(StageError::Synthesis("captcha".into()));
            }
            self.texts.lock().unwrap().push(text.to_string());
            Ok(SpeechArtifact {
                source_url: format!("http://tts.local/{}", self.texts.lock().unwrap().len()),
            })
        }
    }

    #[derive(Default)]
    struct FakeSpeaker {
        failures: AtomicUsize,
        always_fail: bool,
        attempts: AtomicUsize,
        played: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Speaker for FakeSpeaker {
        async fn discover(&self, name: &str) -> StageResult<SpeakerTarget> {
            assert_eq!(name, "Kitchen speaker");
            Ok(SpeakerTarget {
                name: name.into(),
                address: None,
                model: None,
            })
        }

        async fn play(&self, _target: &SpeakerTarget, url: &str) -> StageResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.always_fail || take_failure(&self.failures) {
                return Err(StageError::Playback("speaker busy".into()));
            }
            self.played.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct Rig {
        scheduler: PollScheduler,
        station: Arc<FakeStation>,
        tts: Arc<FakeTts>,
        speaker: Arc<FakeSpeaker>,
        restart: CountingRestart,
    }

    fn rig(station: FakeStation, fuse: u32) -> Rig {
        rig_with(station, FakeTts::default(), FakeSpeaker::default(), fuse)
    }

    fn rig_with(station: FakeStation, tts: FakeTts, speaker: FakeSpeaker, fuse: u32) -> Rig {
        let station = Arc::new(station);
        let tts = Arc::new(tts);
        let speaker = Arc::new(speaker);
        let restart = CountingRestart::default();
        let indicator: Arc<dyn StatusIndicator> = Arc::new(NoIndicator);

        let pipeline = Pipeline {
            station: station.clone(),
            synthesizer: tts.clone(),
            speaker: speaker.clone(),
            location: "Living".into(),
            speaker_name: "Kitchen speaker".into(),
            language: "ja".into(),
            policy: MessagePolicy {
                threshold: 800,
                report: "{location} CO2 is {value} ppm.".into(),
                advice: ADVICE.into(),
            },
        };
        let supervisor = Supervisor::new(fuse, delays(), Box::new(restart.clone()), indicator.clone());

        Rig {
            scheduler: PollScheduler::new(pipeline, supervisor, INTERVAL, indicator),
            station,
            tts,
            speaker,
            restart,
        }
    }

    #[test]
    fn schedule_advances_by_interval_from_completion() {
        let start = Instant::now();
        let mut schedule = ScheduleState::new(start);
        assert!(schedule.is_due(start));

        let done = start + Duration::from_secs(3);
        schedule.advance(done, INTERVAL);
        assert_eq!(schedule.next_due(), done + INTERVAL);
        assert!(!schedule.is_due(done + Duration::from_secs(599)));
        assert!(schedule.is_due(done + INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn high_reading_is_spoken_with_advice() {
        let mut rig = rig(FakeStation::with(Some(850)), 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        assert!(report.spoken);
        assert_eq!(report.notification.text, format!("Living CO2 is 850 ppm.{}", ADVICE));
        assert_eq!(rig.tts.texts.lock().unwrap().as_slice(), &[report.notification.text.clone()]);
        assert_eq!(rig.speaker.played.lock().unwrap().as_slice(), &["http://tts.local/1".to_string()]);
        assert_eq!(report.next_due, before + INTERVAL);
        assert_eq!(rig.scheduler.next_due(), before + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_low_reading_is_spoken_without_advice() {
        let mut rig = rig(FakeStation::with(Some(200)), 5);

        let report = rig.scheduler.run_cycle(true).await.unwrap();

        assert!(report.spoken);
        assert_eq!(report.notification.text, "Living CO2 is 200 ppm.");
        assert!(!report.notification.text.contains(ADVICE));
    }

    #[tokio::test(start_paused = true)]
    async fn low_reading_is_suppressed_but_schedule_advances() {
        let mut rig = rig(FakeStation::with(Some(450)), 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        assert!(!report.spoken);
        assert!(rig.tts.texts.lock().unwrap().is_empty());
        assert_eq!(report.next_due, before + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_module_completes_without_notification() {
        let mut rig = rig(FakeStation::with(None), 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(true).await.unwrap();

        assert!(!report.reading.found());
        assert!(report.notification.is_suppressed());
        assert!(!report.spoken);
        assert!(rig.speaker.played.lock().unwrap().is_empty());
        assert_eq!(report.next_due, before + INTERVAL);
        assert_eq!(rig.restart.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_token_failures_are_retried_with_compose_delay() {
        let station = FakeStation::with(Some(900));
        station.token_failures.store(2, Ordering::SeqCst);
        let mut rig = rig(station, 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        assert!(report.spoken);
        assert_eq!(rig.station.reads.load(Ordering::SeqCst), 1);
        assert_eq!(rig.scheduler.supervisor().remaining(), 5);
        assert_eq!(report.next_due, before + Duration::from_secs(14) + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failures_are_retried_with_playback_delay() {
        let speaker = FakeSpeaker {
            failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let mut rig = rig_with(FakeStation::with(Some(900)), FakeTts::default(), speaker, 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        assert!(report.spoken);
        assert_eq!(rig.speaker.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(rig.speaker.played.lock().unwrap().len(), 1);
        // synthesis is not repeated when only playback fails
        assert_eq!(rig.tts.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(rig.scheduler.supervisor().remaining(), 5);
        assert_eq!(report.next_due, before + Duration::from_secs(20) + INTERVAL);
        assert_eq!(rig.restart.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failures_are_retried_with_synthesis_delay() {
        let tts = FakeTts {
            failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let mut rig = rig_with(FakeStation::with(Some(900)), tts, FakeSpeaker::default(), 5);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        assert!(report.spoken);
        assert_eq!(rig.tts.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(rig.scheduler.supervisor().remaining(), 5);
        assert_eq!(report.next_due, before + Duration::from_secs(2) + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn every_stage_retries_within_one_cycle() {
        let station = FakeStation::with(Some(900));
        station.token_failures.store(1, Ordering::SeqCst);
        let tts = FakeTts {
            failures: AtomicUsize::new(1),
            ..Default::default()
        };
        let speaker = FakeSpeaker {
            failures: AtomicUsize::new(1),
            ..Default::default()
        };
        let mut rig = rig_with(station, tts, speaker, 2);

        let before = Instant::now();
        let report = rig.scheduler.run_cycle(false).await.unwrap();

        // a fuse of 2 survives one failure per stage because each success refills it
        assert!(report.spoken);
        assert_eq!(rig.restart.count(), 0);
        assert_eq!(rig.scheduler.supervisor().remaining(), 2);
        assert_eq!(report.next_due, before + Duration::from_secs(7 + 1 + 10) + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failures_deplete_the_shared_fuse() {
        let station = FakeStation::with(Some(900));
        station.token_failures.store(2, Ordering::SeqCst);
        let tts = FakeTts {
            failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let speaker = FakeSpeaker {
            always_fail: true,
            ..Default::default()
        };
        let mut rig = rig_with(station, tts, speaker, 3);

        let before = Instant::now();
        let err = rig.scheduler.run_cycle(false).await.unwrap_err();

        assert_eq!(err.stage, Stage::Playback);
        assert!(matches!(err.last_error, Some(StageError::Playback(_))));
        assert_eq!(rig.restart.count(), 1);
        assert_eq!(rig.speaker.attempts.load(Ordering::SeqCst), 3);
        assert!(rig.scheduler.supervisor().is_depleted());
        assert_eq!(rig.scheduler.supervisor().remaining(), 0);
        // the schedule does not advance past a failed cycle
        assert_eq!(rig.scheduler.next_due(), before);

        // a depleted supervisor refuses the next cycle without retrying
        let again = rig.scheduler.run_cycle(true).await.unwrap_err();
        assert_eq!(again.stage, Stage::Compose);
        assert_eq!(rig.restart.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_forces_a_cycle() {
        let mut rig = rig(FakeStation::with(Some(200)), 5);
        let (tx, rx) = mpsc::channel(4);
        tx.send(TriggerEvent::Pressed).await.unwrap();

        let run = tokio::time::timeout(Duration::from_secs(60), rig.scheduler.run(Some(rx))).await;
        assert!(run.is_err(), "scheduler should still be waiting");

        // the forced cycle spoke a below-threshold reading
        assert_eq!(
            rig.tts.texts.lock().unwrap().as_slice(),
            &["Living CO2 is 200 ppm.".to_string()]
        );
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drives_cycles_without_trigger() {
        let mut rig = rig(FakeStation::with(Some(1000)), 5);

        let run = tokio::time::timeout(INTERVAL * 2 + Duration::from_secs(1), rig.scheduler.run(None)).await;
        assert!(run.is_err());

        // boot cycle plus one per elapsed interval
        assert_eq!(rig.station.reads.load(Ordering::SeqCst), 3);
        assert_eq!(rig.speaker.played.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_depletes_fuse_and_stops() {
        let mut station = FakeStation::with(Some(900));
        station.always_fail = true;
        let mut rig = rig(station, 3);

        let err = rig.scheduler.run(None).await.unwrap_err();

        assert_eq!(err.stage, Stage::Compose);
        assert!(matches!(err.last_error, Some(StageError::Auth(_))));
        assert_eq!(rig.restart.count(), 1);
        assert!(rig.tts.texts.lock().unwrap().is_empty());
    }
}
