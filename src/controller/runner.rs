//! The calibration session loop.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::{Command, StopFlag};
use crate::capture::{CaptureError, FramePair, FrameSource};
use crate::display::PresentationSink;
use crate::engine::{CalibrationEngine, EstimateOutcome, SaveOutcome};

/// Default bounded wait for a key press each iteration.
pub const DEFAULT_KEY_WAIT: Duration = Duration::from_millis(1);

/// Default pause before grabbing again from a closed capture stream.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub key_wait: Duration,
    /// Pause after a grab that failed without waiting, so the loop never spins.
    pub retry_wait: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            key_wait: DEFAULT_KEY_WAIT,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StopReason {
    /// The `q` key.
    Quit,
    /// The stop flag was raised from outside (Ctrl-C).
    #[default]
    Interrupted,
}

/// Counters collected over one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub iterations: u64,
    /// Iterations skipped because a frame could not be grabbed.
    pub dropped_pairs: u64,
    pub presented: u64,
    pub engine_errors: u64,
    pub display_errors: u64,
    /// Recognised commands dispatched, `q` included.
    pub commands: u64,
    pub estimates: u64,
    pub saves: u64,
    pub resets: u64,
    pub stop_reason: StopReason,
}

/// Owns the session resources and drives the capture/calibrate/present loop.
pub struct Controller<S, E, P> {
    first: S,
    second: S,
    engine: E,
    sink: P,
    stop: StopFlag,
    options: LoopOptions,
}

impl<S, E, P> Controller<S, E, P>
where
    S: FrameSource,
    E: CalibrationEngine,
    P: PresentationSink,
{
    pub fn new(first: S, second: S, engine: E, sink: P, stop: StopFlag) -> Self {
        Self {
            first,
            second,
            engine,
            sink,
            stop,
            options: LoopOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Run until `q` or the stop flag; all resources are released on return.
    pub async fn run(mut self) -> SessionSummary {
        let mut summary = SessionSummary::default();
        let mut quit = false;
        let mut stream_closed = false;

        info!("Calibration loop started (keys: c=estimate s=save r=reset q=quit)");

        while !self.stop.is_raised() {
            summary.iterations += 1;

            let (first, second) = tokio::join!(self.first.grab(), self.second.grab());
            let pair = match (first, second) {
                (Ok(a), Ok(b)) => FramePair::new(a, b),
                (Err(CaptureError::Closed), _) | (_, Err(CaptureError::Closed)) => {
                    Err(CaptureError::Closed)
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            match pair {
                Ok(pair) => {
                    stream_closed = false;
                    self.process(&pair, &mut summary);
                }
                Err(CaptureError::Closed) => {
                    if !stream_closed {
                        warn!("Capture stream closed; press q to quit");
                    }
                    stream_closed = true;
                    summary.dropped_pairs += 1;
                    tokio::time::sleep(self.options.retry_wait).await;
                }
                // Skip to the key poll.
                Err(e) => {
                    warn!("Skipping iteration {}: {}", summary.iterations, e);
                    summary.dropped_pairs += 1;
                }
            }

            let Some(key) = self.sink.poll_key(self.options.key_wait).await else {
                continue;
            };
            let Some(command) = Command::from_key(key) else {
                debug!("Ignoring key {:?}", key);
                continue;
            };
            summary.commands += 1;
            if self.dispatch(command, &mut summary) {
                quit = true;
            }
        }

        summary.stop_reason = if quit {
            StopReason::Quit
        } else {
            StopReason::Interrupted
        };
        info!(
            "Calibration loop ended ({:?}) after {} iterations, {} dropped",
            summary.stop_reason, summary.iterations, summary.dropped_pairs
        );
        summary
    }

    /// Feed one pair to the engine and present the result.
    fn process(&mut self, pair: &FramePair, summary: &mut SessionSummary) {
        if let Err(e) = self.engine.feed(pair) {
            warn!("Feed failed: {}", e);
            summary.engine_errors += 1;
        }

        let matches = self.engine.visualize_matches(pair);
        let evaluated = self.engine.evaluate(pair);
        match (matches, evaluated) {
            (Ok(matches), Ok((quality, stitched))) => {
                match self.sink.present(&matches, &stitched, &quality) {
                    Ok(()) => summary.presented += 1,
                    Err(e) => {
                        warn!("Presentation failed: {}", e);
                        summary.display_errors += 1;
                    }
                }
            }
            (matches, evaluated) => {
                if let Err(e) = matches {
                    warn!("Match visualization failed: {}", e);
                    summary.engine_errors += 1;
                }
                if let Err(e) = evaluated {
                    warn!("Evaluation failed: {}", e);
                    summary.engine_errors += 1;
                }
            }
        }
    }

    /// Apply one command; returns true for `Quit`.
    fn dispatch(&mut self, command: Command, summary: &mut SessionSummary) -> bool {
        debug!("Command {:?}", command);
        match command {
            Command::Estimate => {
                summary.estimates += 1;
                match self.engine.estimate() {
                    Ok(EstimateOutcome::Updated { inliers, rms }) => {
                        info!("Estimated transform: {} inliers, rms {:.3} px", inliers, rms)
                    }
                    Ok(EstimateOutcome::InsufficientData { have, need }) => {
                        info!("Not enough correspondences yet ({}/{})", have, need)
                    }
                    Ok(EstimateOutcome::NoConsensus) => {
                        info!("No consistent transform found; keeping the previous one")
                    }
                    Err(e) => {
                        warn!("Estimate failed: {}", e);
                        summary.engine_errors += 1;
                    }
                }
            }
            Command::Save => {
                summary.saves += 1;
                match self.engine.save() {
                    Ok(SaveOutcome::Saved(path)) => info!("Saved {}", path.display()),
                    Ok(SaveOutcome::NoTransform) => info!("Nothing to save yet"),
                    Err(e) => {
                        warn!("Save failed: {}", e);
                        summary.engine_errors += 1;
                    }
                }
            }
            Command::Reset => {
                summary.resets += 1;
                self.engine.reset();
            }
            Command::Quit => {
                self.stop.raise();
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::display::DisplayError;
    use crate::engine::{EngineError, QualitySnapshot};
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn count(log: &Log, entry: &str) -> usize {
        log.lock().unwrap().iter().filter(|e| e.as_str() == entry).count()
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockSource {
        size: (u32, u32),
        failures: usize,
        /// Every grab reports a closed stream.
        closed: bool,
        _drops: DropCounter,
    }

    impl FrameSource for MockSource {
        async fn grab(&mut self) -> Result<RgbImage, CaptureError> {
            if self.closed {
                return Err(CaptureError::Closed);
            }
            if self.failures > 0 {
                self.failures -= 1;
                return Err(CaptureError::Timeout(500));
            }
            Ok(RgbImage::new(self.size.0, self.size.1))
        }
    }

    struct MockEngine {
        log: Log,
        fail_evaluate: bool,
        _drops: DropCounter,
    }

    impl CalibrationEngine for MockEngine {
        fn build(_config: &SessionConfig) -> Result<Self, EngineError> {
            Ok(Self {
                log: Log::default(),
                fail_evaluate: false,
                _drops: DropCounter(Arc::new(AtomicUsize::new(0))),
            })
        }

        fn feed(&mut self, pair: &FramePair) -> Result<(), EngineError> {
            let (w, h) = pair.dimensions();
            self.log.lock().unwrap().push(format!("feed {}x{}", w, h));
            Ok(())
        }

        fn visualize_matches(&self, pair: &FramePair) -> Result<RgbImage, EngineError> {
            Ok(pair.first.clone())
        }

        fn estimate(&mut self) -> Result<EstimateOutcome, EngineError> {
            self.log.lock().unwrap().push("estimate".to_string());
            Ok(EstimateOutcome::InsufficientData { have: 0, need: 8 })
        }

        fn evaluate(
            &self,
            pair: &FramePair,
        ) -> Result<(QualitySnapshot, RgbImage), EngineError> {
            if self.fail_evaluate {
                return Err(EngineError::Warp("mock".to_string()));
            }
            Ok((QualitySnapshot::default(), pair.second.clone()))
        }

        fn save(&self) -> Result<SaveOutcome, EngineError> {
            self.log.lock().unwrap().push("save".to_string());
            Ok(SaveOutcome::NoTransform)
        }

        fn reset(&mut self) {
            self.log.lock().unwrap().push("reset".to_string());
        }
    }

    struct MockSink {
        keys: VecDeque<Option<char>>,
        log: Log,
        /// Raise this flag on the given poll, simulating Ctrl-C.
        interrupt: Option<(usize, StopFlag)>,
        polls: usize,
        _drops: DropCounter,
    }

    impl PresentationSink for MockSink {
        fn present(
            &mut self,
            matches: &RgbImage,
            stitched: &RgbImage,
            quality: &QualitySnapshot,
        ) -> Result<(), DisplayError> {
            self.log.lock().unwrap().push(format!(
                "present {}x{} {}x{} {}",
                matches.width(),
                matches.height(),
                stitched.width(),
                stitched.height(),
                quality.is_measured()
            ));
            Ok(())
        }

        async fn poll_key(&mut self, _wait: Duration) -> Option<char> {
            self.polls += 1;
            self.log.lock().unwrap().push("poll".to_string());
            if let Some((at, flag)) = &self.interrupt {
                if *at == self.polls {
                    flag.raise();
                }
            }
            self.keys.pop_front().flatten()
        }
    }

    struct Rig {
        log: Log,
        drops: Arc<AtomicUsize>,
        stop: StopFlag,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                log: Log::default(),
                drops: Arc::new(AtomicUsize::new(0)),
                stop: StopFlag::new(),
            }
        }

        fn source(&self, size: (u32, u32), failures: usize) -> MockSource {
            MockSource {
                size,
                failures,
                closed: false,
                _drops: DropCounter(self.drops.clone()),
            }
        }

        fn engine(&self) -> MockEngine {
            MockEngine {
                log: self.log.clone(),
                fail_evaluate: false,
                _drops: DropCounter(self.drops.clone()),
            }
        }

        fn sink(&self, keys: &[Option<char>]) -> MockSink {
            MockSink {
                keys: keys.iter().copied().collect(),
                log: self.log.clone(),
                interrupt: None,
                polls: 0,
                _drops: DropCounter(self.drops.clone()),
            }
        }

        fn controller(
            &self,
            engine: MockEngine,
            sink: MockSink,
        ) -> Controller<MockSource, MockEngine, MockSink> {
            Controller::new(
                self.source((64, 48), 0),
                self.source((64, 48), 0),
                engine,
                sink,
                self.stop.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_quit_ends_loop_and_releases_once() {
        let rig = Rig::new();
        let controller = rig.controller(rig.engine(), rig.sink(&[None, Some('x'), Some('q')]));

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.stop_reason, StopReason::Quit);
        assert_eq!(summary.commands, 1);
        assert!(rig.stop.is_raised());
        // Two sources, engine and sink.
        assert_eq!(rig.drops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_estimate_save_quit() {
        let rig = Rig::new();
        let controller = rig.controller(rig.engine(), rig.sink(&[Some('c'), Some('s'), Some('q')]));

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.presented, 3);
        assert_eq!(summary.estimates, 1);
        assert_eq!(summary.saves, 1);
        assert_eq!(count(&rig.log, "estimate"), 1);
        assert_eq!(count(&rig.log, "save"), 1);
        assert_eq!(count(&rig.log, "feed 64x48"), 3);

        // The loop ends right after the third presentation and key poll.
        let log = rig.log.lock().unwrap();
        let tail: Vec<&str> = log.iter().rev().take(2).map(|s| s.as_str()).collect();
        assert_eq!(tail, vec!["poll", "present 64x48 64x48 false"]);
    }

    #[tokio::test]
    async fn test_first_iteration_at_full_hd() {
        let rig = Rig::new();
        let controller = Controller::new(
            rig.source((1920, 1080), 0),
            rig.source((1920, 1080), 0),
            rig.engine(),
            rig.sink(&[Some('q')]),
            rig.stop.clone(),
        );

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 1);
        let log = rig.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "feed 1920x1080".to_string(),
                "present 1920x1080 1920x1080 false".to_string(),
                "poll".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_quit_while_capture_fails() {
        let rig = Rig::new();
        let controller = Controller::new(
            rig.source((64, 48), 0),
            rig.source((64, 48), 2),
            rig.engine(),
            rig.sink(&[Some('q')]),
            rig.stop.clone(),
        );

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.dropped_pairs, 1);
        assert_eq!(summary.presented, 0);
        assert_eq!(summary.stop_reason, StopReason::Quit);
        assert_eq!(count(&rig.log, "feed 64x48"), 0);
        assert_eq!(count(&rig.log, "poll"), 1);
    }

    #[tokio::test]
    async fn test_capture_failure_then_recovery() {
        let rig = Rig::new();
        let controller = Controller::new(
            rig.source((64, 48), 0),
            rig.source((64, 48), 2),
            rig.engine(),
            rig.sink(&[None, None, Some('q')]),
            rig.stop.clone(),
        );

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.dropped_pairs, 2);
        assert_eq!(summary.presented, 1);
        assert_eq!(count(&rig.log, "feed 64x48"), 1);
        assert_eq!(count(&rig.log, "poll"), 3);
    }

    #[tokio::test]
    async fn test_quit_with_closed_capture() {
        let rig = Rig::new();
        let mut closed = rig.source((64, 48), 0);
        closed.closed = true;
        let controller = Controller::new(
            rig.source((64, 48), 0),
            closed,
            rig.engine(),
            rig.sink(&[None, None, Some('q')]),
            rig.stop.clone(),
        )
        .with_options(LoopOptions {
            key_wait: DEFAULT_KEY_WAIT,
            retry_wait: Duration::from_millis(20),
        });

        let started = std::time::Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(5), controller.run())
            .await
            .expect("q must end the loop while a stream is closed");

        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.dropped_pairs, 3);
        assert_eq!(summary.presented, 0);
        assert_eq!(summary.stop_reason, StopReason::Quit);
        assert_eq!(count(&rig.log, "poll"), 3);
        assert_eq!(count(&rig.log, "feed 64x48"), 0);
        // Every closed grab waits before the next attempt.
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(rig.drops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_interrupt_stops_loop() {
        let rig = Rig::new();
        let mut sink = rig.sink(&[]);
        sink.interrupt = Some((2, rig.stop.clone()));
        let controller = rig.controller(rig.engine(), sink);

        let summary = controller.run().await;
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(rig.drops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_raised_flag_skips_loop() {
        let rig = Rig::new();
        rig.stop.raise();
        let summary = rig.controller(rig.engine(), rig.sink(&[])).run().await;
        assert_eq!(summary.iterations, 0);
        assert!(rig.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_error_skips_presentation() {
        let rig = Rig::new();
        let mut engine = rig.engine();
        engine.fail_evaluate = true;
        let controller = rig.controller(engine, rig.sink(&[Some('r'), Some('q')]));

        let summary = controller.run().await;
        assert_eq!(summary.presented, 0);
        assert_eq!(summary.engine_errors, 2);
        assert_eq!(summary.resets, 1);
        assert_eq!(count(&rig.log, "poll"), 2);
        assert_eq!(count(&rig.log, "reset"), 1);
    }
}
