//! Capture orchestration: temperature gating, the continuous-capture loop,
//! dithering, and delivery of finished exposures.
//!
//! [`CameraController`] sits above one [`CcdDevice`] and runs capture
//! sessions: `Idle → WaitingForTemperature → [WaitingForGuider] → Exposing →
//! WaitingForNextExposure → (Dithering) → …`, with `Cancelled` or `Failed`
//! reachable from any state. External concerns (the cooler, the autoguider)
//! are trait collaborators so the loop stays testable without hardware.
//!
//! Finished exposures are broadcast as [`Exposure`] values; slow consumers
//! miss frames rather than stalling the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::device::{CcdDevice, ExposureRegion, ExposureTiming, SensorDescriptor};
use crate::error::{CamResult, CameraError, DeviceError};
use crate::reconstruct::ReconstructedImage;

/// How often the temperature gate re-reads the cooler.
const TEMPERATURE_POLL: Duration = Duration::from_millis(500);

/// Sensor cooler collaborator. External to this crate; the wire protocol has
/// no cooler command, cooler-equipped models expose it out of band.
#[async_trait]
pub trait Cooler: Send + Sync {
    /// Current sensor temperature in degrees Celsius.
    async fn temperature_c(&self) -> anyhow::Result<f64>;

    /// Request a new setpoint.
    async fn set_target_c(&self, target: f64) -> anyhow::Result<()>;
}

/// Autoguider collaborator.
#[async_trait]
pub trait Guider: Send + Sync {
    /// Resolve once guiding is locked and stable enough to expose.
    async fn settle(&self) -> anyhow::Result<()>;

    /// Issue a dither offset and resolve once it has settled.
    async fn dither(&self) -> anyhow::Result<()>;
}

/// Temperature-lock gate configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TemperatureLock {
    /// Setpoint in degrees Celsius.
    pub target_c: f64,
    /// Accepted band around the setpoint.
    #[serde(default = "default_tolerance")]
    pub tolerance_c: f64,
    /// How long to wait for convergence.
    #[serde(with = "humantime_serde", default = "default_temperature_timeout")]
    pub timeout: Duration,
    /// Whether a convergence timeout aborts the session. When false the
    /// session continues unlocked with a warning.
    #[serde(default)]
    pub fatal: bool,
}

fn default_tolerance() -> f64 {
    0.5
}

fn default_temperature_timeout() -> Duration {
    Duration::from_secs(300)
}

/// One capture session's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub region: ExposureRegion,
    pub timing: ExposureTiming,
    /// Exposures to take; `None` runs until cancelled.
    pub capture_count: Option<u32>,
    /// Pause between exposures.
    #[serde(with = "humantime_serde", default)]
    pub interval: Duration,
    /// Dither through the guider between exposures.
    #[serde(default)]
    pub dither: bool,
    /// Temperature gate; absent means no gating.
    #[serde(default)]
    pub temperature: Option<TemperatureLock>,
}

/// Orchestrator phases, broadcast at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    WaitingForTemperature,
    WaitingForGuider,
    Exposing,
    WaitingForNextExposure,
    Dithering,
    Cancelled,
    Failed,
}

/// A finished exposure with its provenance.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub id: Uuid,
    /// Zero-based index within the session.
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub region: ExposureRegion,
    pub image: ReconstructedImage,
    pub sensor: SensorDescriptor,
    /// Free-form acquisition metadata.
    pub meta: serde_json::Value,
}

/// Outcome of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub exposures_completed: u32,
    pub terminal: CaptureState,
}

/// Runs capture sessions against one device.
pub struct CameraController {
    device: Arc<CcdDevice>,
    settings: CaptureSettings,
    cooler: Option<Arc<dyn Cooler>>,
    guider: Option<Arc<dyn Guider>>,
    states: broadcast::Sender<CaptureState>,
    exposures: broadcast::Sender<Arc<Exposure>>,
}

impl CameraController {
    /// A controller with no cooler or guider attached.
    pub fn new(device: Arc<CcdDevice>, settings: CaptureSettings) -> Self {
        let (states, _) = broadcast::channel(64);
        let (exposures, _) = broadcast::channel(16);
        Self {
            device,
            settings,
            cooler: None,
            guider: None,
            states,
            exposures,
        }
    }

    /// Attach a cooler for temperature gating.
    pub fn with_cooler(mut self, cooler: Arc<dyn Cooler>) -> Self {
        self.cooler = Some(cooler);
        self
    }

    /// Attach a guider for settling and dithering.
    pub fn with_guider(mut self, guider: Arc<dyn Guider>) -> Self {
        self.guider = Some(guider);
        self
    }

    /// Subscribe to orchestrator state transitions.
    pub fn state_stream(&self) -> broadcast::Receiver<CaptureState> {
        self.states.subscribe()
    }

    /// Subscribe to finished exposures.
    pub fn exposure_stream(&self) -> broadcast::Receiver<Arc<Exposure>> {
        self.exposures.subscribe()
    }

    fn emit(&self, state: CaptureState) {
        let _ = self.states.send(state);
    }

    /// Run the session to completion, cancellation, or failure.
    ///
    /// Cancellation is a clean outcome: the summary reports `Cancelled` and
    /// the call returns `Ok`. Device and collaborator failures return the
    /// error after emitting `Failed`.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancelToken) -> CamResult<CaptureSummary> {
        self.emit(CaptureState::Idle);
        let mut completed = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(completed));
            }

            if let Some(lock) = self.settings.temperature {
                match self.wait_for_temperature(&lock, cancel).await {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => return Ok(self.cancelled(completed)),
                    Err(err) => {
                        self.emit(CaptureState::Failed);
                        return Err(err);
                    }
                }
            }

            if let Some(guider) = &self.guider {
                self.emit(CaptureState::WaitingForGuider);
                tokio::select! {
                    settled = guider.settle() => {
                        if let Err(err) = settled {
                            self.emit(CaptureState::Failed);
                            return Err(CameraError::Guider(err));
                        }
                    }
                    _ = cancel.cancelled() => return Ok(self.cancelled(completed)),
                }
            }

            if cancel.is_cancelled() {
                return Ok(self.cancelled(completed));
            }
            self.emit(CaptureState::Exposing);
            let started_at = Utc::now();
            match self
                .device
                .expose(self.settings.region, self.settings.timing, cancel)
                .await
            {
                Ok(image) => {
                    let exposure = self.package(completed, started_at, image);
                    debug!(index = exposure.index, id = %exposure.id, "exposure complete");
                    let _ = self.exposures.send(Arc::new(exposure));
                    completed += 1;
                }
                Err(err) if err.is_cancelled() => return Ok(self.cancelled(completed)),
                Err(err) => {
                    self.emit(CaptureState::Failed);
                    return Err(err);
                }
            }

            if let Some(count) = self.settings.capture_count {
                if completed >= count {
                    break;
                }
            }

            if self.settings.dither {
                if let Some(guider) = &self.guider {
                    self.emit(CaptureState::Dithering);
                    tokio::select! {
                        dithered = guider.dither() => {
                            if let Err(err) = dithered {
                                self.emit(CaptureState::Failed);
                                return Err(CameraError::Guider(err));
                            }
                        }
                        _ = cancel.cancelled() => return Ok(self.cancelled(completed)),
                    }
                }
            }

            if !self.settings.interval.is_zero() {
                self.emit(CaptureState::WaitingForNextExposure);
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.interval) => {}
                    _ = cancel.cancelled() => return Ok(self.cancelled(completed)),
                }
            }
        }

        info!(exposures = completed, "capture session complete");
        self.emit(CaptureState::Idle);
        Ok(CaptureSummary {
            exposures_completed: completed,
            terminal: CaptureState::Idle,
        })
    }

    fn cancelled(&self, completed: u32) -> CaptureSummary {
        info!(exposures = completed, "capture session cancelled");
        self.emit(CaptureState::Cancelled);
        CaptureSummary {
            exposures_completed: completed,
            terminal: CaptureState::Cancelled,
        }
    }

    async fn wait_for_temperature(
        &self,
        lock: &TemperatureLock,
        cancel: &CancelToken,
    ) -> CamResult<()> {
        let Some(cooler) = &self.cooler else {
            warn!("temperature lock configured but no cooler attached");
            return Ok(());
        };
        self.emit(CaptureState::WaitingForTemperature);
        cooler
            .set_target_c(lock.target_c)
            .await
            .map_err(CameraError::Cooler)?;

        let deadline = tokio::time::Instant::now() + lock.timeout;
        loop {
            let current = cooler.temperature_c().await.map_err(CameraError::Cooler)?;
            if (current - lock.target_c).abs() <= lock.tolerance_c {
                debug!(current, target = lock.target_c, "temperature locked");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    current,
                    target = lock.target_c,
                    "temperature did not converge"
                );
                if lock.fatal {
                    return Err(DeviceError::TemperatureTimeout.into());
                }
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(TEMPERATURE_POLL) => {}
                _ = cancel.cancelled() => return Err(CameraError::Cancelled),
            }
        }
    }

    fn package(&self, index: u32, started_at: DateTime<Utc>, image: ReconstructedImage) -> Exposure {
        let sensor = self.device.descriptor().clone();
        let meta = json!({
            "model": sensor.model_name,
            "firmware": format!("{}.{}", sensor.firmware.0, sensor.firmware.1),
            "bin": [self.settings.region.bin_x, self.settings.region.bin_y],
            "timing": self.settings.timing.mode,
        });
        Exposure {
            id: Uuid::new_v4(),
            index,
            started_at,
            duration: self.settings.timing.duration,
            region: self.settings.region,
            image,
            sensor,
            meta,
        }
    }
}
