// Pipeline orchestrator: owns the capture source and drives every frame
//
// Capture -> inference scheduler -> overlay -> broadcaster, with detection
// events appended on fresh cycles. Runs on one dedicated thread, the only
// caller into the oracles. Sustained capture failure ends the loop offline.

use crate::error::CaptureError;
use crate::event_log::EventLog;
use crate::pipeline::broadcaster::Broadcaster;
use crate::pipeline::overlay::{compose, Hud};
use crate::pipeline::scheduler::InferenceScheduler;
pub use crate::pipeline::types::PipelineState;
use crate::pipeline::types::{DetectionEvent, Frame, PipelinePhase};
use crate::video::CaptureSource;
use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_CAPTURE_RETRIES: u32 = 5;
pub const DEFAULT_CAPTURE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_CAPTURE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Consecutive capture failures tolerated before going offline.
    pub capture_retries: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub capture_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_retries: DEFAULT_CAPTURE_RETRIES,
            capture_backoff: DEFAULT_CAPTURE_BACKOFF,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_CAPTURE_BACKOFF)
}

pub struct Pipeline {
    source: Box<dyn CaptureSource>,
    scheduler: InferenceScheduler,
    broadcaster: Arc<Broadcaster>,
    events: Arc<EventLog>,
    state: Arc<PipelineState>,
    config: PipelineConfig,
    frame_count: u64,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn CaptureSource>,
        scheduler: InferenceScheduler,
        broadcaster: Arc<Broadcaster>,
        events: Arc<EventLog>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            scheduler,
            broadcaster,
            events,
            state: Arc::new(PipelineState::new()),
            config,
            frame_count: 0,
        }
    }

    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    /// Capture, infer, composite and publish exactly one frame.
    ///
    /// The source must already be open. Only capture can fail; every other
    /// problem is logged and the iteration still completes.
    pub fn run_iteration(&mut self) -> Result<(), CaptureError> {
        let image = self.source.next_frame()?;
        self.frame_count += 1;
        let frame = Frame::new(self.frame_count, Utc::now(), image);

        let inference = self.scheduler.observe(&frame);
        debug_assert!(inference.source_seq <= frame.seq());
        let detections = inference.detections.as_slice();
        let person_detected = !detections.is_empty();

        let hud = Hud {
            person_detected,
            frame_count: self.frame_count,
            timestamp: frame.captured_at(),
        };
        let composed = compose(&frame, detections, &hud);
        self.broadcaster.publish(&composed);

        if inference.fresh {
            if let Some(event) = DetectionEvent::from_detections(frame.captured_at(), detections) {
                if let Err(e) = self.events.append(&event) {
                    tracing::warn!("Failed to record detection event: {:#}", e);
                }
            }
        }

        let frame_count = self.frame_count;
        self.state.update(|status| {
            status.person_detected = person_detected;
            status.frame_count = frame_count;
            status.detections_count = detections.len() as u32;
            status.pipeline = PipelinePhase::Running;
        });
        Ok(())
    }

    /// Run until shutdown is requested or capture fails for good.
    ///
    /// A message on `shutdown`, or the sender being dropped, stops the loop.
    pub fn run(mut self, shutdown: Receiver<()>) -> PipelinePhase {
        tracing::info!(
            "Pipeline starting on {} (inference every {} frame(s))",
            self.source.describe(),
            self.scheduler.skip_interval()
        );

        let mut opened = false;
        let mut failures = 0u32;
        let outcome = loop {
            if shutdown_requested(&shutdown) {
                break PipelinePhase::Stopped;
            }

            // Only a delivered frame clears the failure count; a device that
            // opens but never reads still runs out of retries.
            let result = if opened {
                self.run_iteration().map(|()| failures = 0)
            } else {
                self.source.open().map(|()| opened = true)
            };

            if let Err(e) = result {
                opened = false;
                failures += 1;
                if failures > self.config.capture_retries {
                    tracing::error!(
                        "Capture source {} failed {} times in a row, going offline: {}",
                        self.source.describe(),
                        failures,
                        e
                    );
                    break PipelinePhase::Offline;
                }
                let delay = backoff_delay(self.config.capture_backoff, failures);
                tracing::warn!(
                    "Capture failed ({}); retry {}/{} in {:?}",
                    e,
                    failures,
                    self.config.capture_retries,
                    delay
                );
                if wait_for_shutdown(&shutdown, delay) {
                    break PipelinePhase::Stopped;
                }
            }
        };

        self.state.set_phase(outcome);
        self.broadcaster.close();
        self.source.release();
        tracing::info!(
            "Pipeline {:?} after {} frame(s)",
            outcome,
            self.frame_count
        );
        outcome
    }

    /// Move the loop onto its own thread.
    pub fn spawn(self) -> Result<PipelineHandle> {
        let state = self.state.clone();
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let thread = thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || self.run(shutdown_rx))
            .context("Failed to spawn pipeline thread")?;
        Ok(PipelineHandle {
            state,
            shutdown: shutdown_tx,
            thread,
        })
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn wait_for_shutdown(shutdown: &Receiver<()>, delay: Duration) -> bool {
    !matches!(shutdown.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

/// Owner's handle on a running pipeline. Dropping it also stops the loop.
pub struct PipelineHandle {
    state: Arc<PipelineState>,
    shutdown: Sender<()>,
    thread: JoinHandle<PipelinePhase>,
}

impl PipelineHandle {
    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signal shutdown and wait for the loop to release the capture source.
    pub fn stop(self) -> PipelinePhase {
        let _ = self.shutdown.try_send(());
        match self.thread.join() {
            Ok(phase) => phase,
            Err(_) => {
                tracing::error!("Pipeline thread panicked");
                self.state.set_phase(PipelinePhase::Stopped);
                PipelinePhase::Stopped
            }
        }
    }
}
