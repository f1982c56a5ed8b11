//! One connected camera: sensor identity, supplemental operations, and the
//! exposure state machine.
//!
//! `CcdDevice::connect` resets the controller, reads the parameter block,
//! model code and firmware version, and freezes them into a
//! [`SensorDescriptor`]. The readout strategy ([`ExposeCommandKind`]) is
//! chosen once here; everything downstream matches on the tag instead of
//! re-deriving sensor quirks.
//!
//! An exposure runs `Idle → Flushing → Exposing → Latching → Reading →
//! {Complete, Failed, Cancelled}`. Transitions are broadcast so callers can
//! observe progress; cancellation is polled at every boundary and never
//! interrupts an in-flight transfer.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{CamResult, CameraError, DeviceError, ProtocolError};
use crate::protocol::command::{
    decode_camera_model, decode_firmware_version, decode_timer, CcdCommand, ExposureWindow,
    STAR2K_STOP,
};
use crate::protocol::params::{
    CcdParams, ColorMatrix, CAP_COMPRESS, CAP_EEPROM, CAP_GUIDER, CAP_SHUTTER, CAP_STAR2K,
};
use crate::protocol::FieldSelector;
use crate::queue::CommandQueue;
use crate::reconstruct::{
    deinterleave_packed, interleave_fields, reconstruct_interlaced, FieldOrder, FrameGeometry,
    InterlacedInput, ReconstructedImage,
};
use crate::transport::Transport;

/// Model-code bit marking an interlaced readout register.
const MODEL_INTERLACED: u16 = 0x40;

/// A binned sub-frame request, in binned pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRegion {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub bin_x: u8,
    pub bin_y: u8,
}

impl ExposureRegion {
    /// Full frame at the given binning.
    pub fn full_frame(sensor: &SensorDescriptor, bin: u8) -> Self {
        Self {
            x: 0,
            y: 0,
            width: sensor.width / u16::from(bin.max(1)),
            height: sensor.height / u16::from(bin.max(1)),
            bin_x: bin.max(1),
            bin_y: bin.max(1),
        }
    }

    fn samples(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }
}

/// Who counts the exposure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMode {
    /// The host sleeps for the duration, then latches and reads.
    HostTimed,
    /// The device's internal timer runs the exposure; one combined
    /// delayed-read command returns the pixels.
    DeviceTimed,
}

/// Exposure duration and timing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureTiming {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub mode: TimingMode,
}

impl ExposureTiming {
    /// Host-timed exposure of the given duration.
    pub fn host_timed(duration: Duration) -> Self {
        Self {
            duration,
            mode: TimingMode::HostTimed,
        }
    }

    /// Device-timed exposure of the given duration.
    pub fn device_timed(duration: Duration) -> Self {
        Self {
            duration,
            mode: TimingMode::DeviceTimed,
        }
    }
}

/// Readout strategy, fixed per sensor model at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposeCommandKind {
    /// Progressive sensor: latch both fields, one bulk read, no reshaping.
    Plain,
    /// Packed progressive readout: one buffer with two image rows
    /// sample-interleaved per register line.
    InterlacedM25C,
    /// Rotated dual-field readout: two field reads, weave and derotate.
    InterlacedM26C,
    /// Interlaced guide sensor: two field reads, plain row interleave.
    Lodestar,
}

impl ExposeCommandKind {
    /// Pick the strategy for a model code.
    ///
    /// Known codes map directly; unknown interlaced models degrade to the
    /// row-interleave path, everything else to `Plain`.
    pub fn classify(model: u16) -> Self {
        match model & 0xFF {
            0x59 => ExposeCommandKind::InterlacedM25C,
            0x5A => ExposeCommandKind::InterlacedM26C,
            0x46 => ExposeCommandKind::Lodestar,
            m if m & MODEL_INTERLACED != 0 => {
                warn!(model = format_args!("{model:#04x}"), "unknown interlaced model, using row interleave");
                ExposeCommandKind::Lodestar
            }
            _ => ExposeCommandKind::Plain,
        }
    }
}

fn model_name(model: u16) -> String {
    match model & 0xFF {
        0x05 => "SXVF-M5".into(),
        0x45 => "SXVF-M5C".into(),
        0x09 => "SXVF-H9".into(),
        0x47 => "SXVF-M7C".into(),
        0x46 => "Lodestar".into(),
        0x59 => "SXVR-M25C".into(),
        0x5A => "SXVR-M26C".into(),
        _ => format!("SX model {model:#04x}"),
    }
}

/// Immutable per-device facts, read once at connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub model_code: u16,
    pub model_name: String,
    /// Native sensor size in unbinned pixels.
    pub width: u16,
    pub height: u16,
    /// Pixel pitch in microns.
    pub pix_width: f32,
    pub pix_height: f32,
    pub color_matrix: ColorMatrix,
    pub bits_per_pixel: u8,
    pub interlaced: bool,
    pub kind: ExposeCommandKind,
    pub field_order: FieldOrder,
    pub has_star2k_port: bool,
    pub has_compressed_pixels: bool,
    pub has_eeprom: bool,
    pub has_integrated_guider: bool,
    pub has_shutter: bool,
    pub num_serial_ports: u8,
    /// Firmware `(major, minor)`.
    pub firmware: (u16, u16),
}

impl SensorDescriptor {
    /// Build from the connect-time responses.
    pub fn new(params: &CcdParams, model: u16, firmware: (u16, u16)) -> Self {
        Self {
            model_code: model,
            model_name: model_name(model),
            width: params.width,
            height: params.height,
            pix_width: params.pix_width,
            pix_height: params.pix_height,
            color_matrix: params.color_matrix,
            bits_per_pixel: params.bits_per_pixel,
            interlaced: model & MODEL_INTERLACED != 0,
            kind: ExposeCommandKind::classify(model),
            field_order: FieldOrder::default(),
            has_star2k_port: params.has_cap(CAP_STAR2K),
            has_compressed_pixels: params.has_cap(CAP_COMPRESS),
            has_eeprom: params.has_cap(CAP_EEPROM),
            has_integrated_guider: params.has_cap(CAP_GUIDER),
            has_shutter: params.has_cap(CAP_SHUTTER),
            num_serial_ports: params.num_serial_ports,
            firmware,
        }
    }

    /// Check a region against the binned sensor bounds.
    pub fn validate_region(&self, region: &ExposureRegion) -> Result<(), DeviceError> {
        if region.bin_x == 0 || region.bin_y == 0 {
            return Err(DeviceError::InvalidRegion(
                "binning factors must be at least 1".into(),
            ));
        }
        if region.width == 0 || region.height == 0 {
            return Err(DeviceError::InvalidRegion("empty region".into()));
        }
        let max_w = u32::from(self.width) / u32::from(region.bin_x);
        let max_h = u32::from(self.height) / u32::from(region.bin_y);
        if u32::from(region.x) + u32::from(region.width) > max_w
            || u32::from(region.y) + u32::from(region.height) > max_h
        {
            return Err(DeviceError::InvalidRegion(format!(
                "{}x{}+{}+{} exceeds {max_w}x{max_h} at {}x{} binning",
                region.width, region.height, region.x, region.y, region.bin_x, region.bin_y
            )));
        }
        self.validate_readout_layout(region)
    }

    /// Constraints the model's readout layout puts on a region, checked
    /// before anything is flushed or exposed.
    fn validate_readout_layout(&self, region: &ExposureRegion) -> Result<(), DeviceError> {
        match self.kind {
            ExposeCommandKind::Plain => Ok(()),
            // Both-field readouts split rows across two transfers.
            ExposeCommandKind::InterlacedM25C | ExposeCommandKind::Lodestar => {
                if region.height % 2 != 0 {
                    return Err(DeviceError::InvalidRegion(format!(
                        "height {} must be even on a two-field readout",
                        region.height
                    )));
                }
                Ok(())
            }
            ExposeCommandKind::InterlacedM26C => {
                if region.bin_x != region.bin_y {
                    return Err(DeviceError::InvalidRegion(
                        "asymmetric binning not supported on this sensor".into(),
                    ));
                }
                // Register lines run along the vertical axis: the weave
                // needs an even line length and a line count matching its
                // period (four lines unbinned, two lines binned).
                let line_period = match region.bin_x {
                    1 => 4,
                    2 | 4 => 2,
                    other => {
                        return Err(DeviceError::InvalidRegion(format!(
                            "unsupported binning {other} on this sensor"
                        )))
                    }
                };
                if region.height % 2 != 0 || u32::from(region.width) % line_period != 0 {
                    return Err(DeviceError::InvalidRegion(format!(
                        "{}x{} does not fit the field layout at {}x{} binning",
                        region.width, region.height, region.bin_x, region.bin_y
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Exposure state machine phases, broadcast at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureState {
    Idle,
    Flushing,
    Exposing,
    Latching,
    Reading,
    Complete,
    Failed,
    Cancelled,
}

/// One connected camera.
pub struct CcdDevice {
    queue: CommandQueue,
    descriptor: SensorDescriptor,
    cam_index: u16,
    states: broadcast::Sender<ExposureState>,
    exposure_lock: tokio::sync::Mutex<()>,
}

impl CcdDevice {
    /// Open the transport, identify the sensor, and return a ready device.
    pub async fn connect(mut transport: Box<dyn Transport>) -> CamResult<Self> {
        transport.connect().await?;
        let queue = CommandQueue::spawn(transport);
        queue.submit(&CcdCommand::Reset).await?;

        let params_bytes = queue.submit(&CcdCommand::GetCcd { cam_index: 0 }).await?;
        let params = CcdParams::from_bytes(&params_bytes)?;
        let model = decode_camera_model(&queue.submit(&CcdCommand::GetCameraModel).await?)?;
        let firmware =
            decode_firmware_version(&queue.submit(&CcdCommand::GetFirmwareVersion).await?)?;

        let descriptor = SensorDescriptor::new(&params, model, firmware);
        info!(
            model = %descriptor.model_name,
            width = descriptor.width,
            height = descriptor.height,
            kind = ?descriptor.kind,
            firmware_major = firmware.0,
            firmware_minor = firmware.1,
            "camera connected"
        );

        let (states, _) = broadcast::channel(64);
        Ok(Self {
            queue,
            descriptor,
            cam_index: 0,
            states,
            exposure_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The sensor facts read at connect time.
    pub fn descriptor(&self) -> &SensorDescriptor {
        &self.descriptor
    }

    /// Subscribe to exposure state transitions.
    pub fn state_stream(&self) -> broadcast::Receiver<ExposureState> {
        self.states.subscribe()
    }

    /// Reset the controller to its power-on state.
    pub async fn reset(&self) -> CamResult<()> {
        self.queue.submit(&CcdCommand::Reset).await?;
        Ok(())
    }

    /// Round-trip a payload through the controller.
    pub async fn echo(&self, payload: Bytes) -> CamResult<Bytes> {
        self.queue.submit(&CcdCommand::Echo { payload }).await
    }

    /// Re-read the parameter block from the device.
    pub async fn read_params(&self) -> CamResult<CcdParams> {
        let bytes = self
            .queue
            .submit(&CcdCommand::GetCcd {
                cam_index: self.cam_index,
            })
            .await?;
        Ok(CcdParams::from_bytes(&bytes)?)
    }

    /// Overwrite the device's parameter block.
    pub async fn write_params(&self, params: CcdParams) -> CamResult<()> {
        self.queue
            .submit(&CcdCommand::SetCcd {
                cam_index: self.cam_index,
                params,
            })
            .await?;
        Ok(())
    }

    /// Program the device millisecond timer.
    pub async fn set_timer(&self, msec: u32) -> CamResult<()> {
        self.queue.submit(&CcdCommand::SetTimer { msec }).await?;
        Ok(())
    }

    /// Read back the device millisecond timer.
    pub async fn timer(&self) -> CamResult<u32> {
        let bytes = self.queue.submit(&CcdCommand::GetTimer).await?;
        Ok(decode_timer(&bytes)?)
    }

    /// Close the guide relays for `duration`, then open them all.
    pub async fn pulse_guide(&self, relays: u16, duration: Duration) -> CamResult<()> {
        if !self.descriptor.has_star2k_port {
            return Err(DeviceError::Unsupported("STAR2000 guide port").into());
        }
        self.queue.submit(&CcdCommand::SetStar2k { relays }).await?;
        tokio::time::sleep(duration).await;
        self.queue
            .submit(&CcdCommand::SetStar2k {
                relays: STAR2K_STOP,
            })
            .await?;
        Ok(())
    }

    /// Write through a pass-through serial port.
    pub async fn serial_write(&self, port: u16, payload: Bytes, flush: bool) -> CamResult<()> {
        self.queue
            .submit(&CcdCommand::WriteSerialPort {
                port,
                flush,
                payload,
            })
            .await?;
        Ok(())
    }

    /// Read from a pass-through serial port.
    pub async fn serial_read(&self, port: u16, len: u16) -> CamResult<Bytes> {
        self.queue
            .submit(&CcdCommand::ReadSerialPort { port, len })
            .await
    }

    /// Read a span of the controller EEPROM.
    pub async fn read_eeprom(&self, address: u16, len: u16) -> CamResult<Bytes> {
        if !self.descriptor.has_eeprom {
            return Err(DeviceError::Unsupported("EEPROM").into());
        }
        self.queue
            .submit(&CcdCommand::LoadEeprom { address, len })
            .await
    }

    /// Run one exposure to a reconstructed image.
    ///
    /// At most one exposure runs at a time; a second call while one is in
    /// progress fails with [`DeviceError::Busy`]. The region is validated
    /// before anything touches the wire.
    #[instrument(skip(self, cancel), fields(model = %self.descriptor.model_name))]
    pub async fn expose(
        &self,
        region: ExposureRegion,
        timing: ExposureTiming,
        cancel: &CancelToken,
    ) -> CamResult<ReconstructedImage> {
        self.descriptor.validate_region(&region)?;
        let _guard = self
            .exposure_lock
            .try_lock()
            .map_err(|_| DeviceError::Busy)?;

        let driver = ExposureDriver {
            queue: &self.queue,
            descriptor: &self.descriptor,
            cam_index: self.cam_index,
            states: &self.states,
            cancel,
            region,
            timing,
        };
        match driver.run().await {
            Ok(image) => {
                self.emit(ExposureState::Complete);
                Ok(image)
            }
            Err(err) if err.is_cancelled() => {
                debug!("exposure cancelled");
                self.emit(ExposureState::Cancelled);
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "exposure failed");
                self.emit(ExposureState::Failed);
                Err(err)
            }
        }
    }

    fn emit(&self, state: ExposureState) {
        let _ = self.states.send(state);
    }
}

struct ExposureDriver<'a> {
    queue: &'a CommandQueue,
    descriptor: &'a SensorDescriptor,
    cam_index: u16,
    states: &'a broadcast::Sender<ExposureState>,
    cancel: &'a CancelToken,
    region: ExposureRegion,
    timing: ExposureTiming,
}

impl ExposureDriver<'_> {
    fn emit(&self, state: ExposureState) {
        let _ = self.states.send(state);
    }

    fn checkpoint(&self) -> CamResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CameraError::Cancelled);
        }
        Ok(())
    }

    async fn run(&self) -> CamResult<ReconstructedImage> {
        self.emit(ExposureState::Idle);

        self.checkpoint()?;
        self.emit(ExposureState::Flushing);
        self.flush().await?;

        self.checkpoint()?;
        self.emit(ExposureState::Exposing);
        match self.timing.mode {
            TimingMode::HostTimed => {
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.duration) => {}
                    _ = self.cancel.cancelled() => return Err(CameraError::Cancelled),
                }
                self.checkpoint()?;
                self.emit(ExposureState::Latching);
                self.checkpoint()?;
                self.emit(ExposureState::Reading);
                let image = self.latch_and_read().await?;
                self.checkpoint()?;
                Ok(image)
            }
            TimingMode::DeviceTimed => {
                // One combined command times the exposure in hardware and
                // returns the pixels; no separate latch or read phase.
                let image = self.device_timed_read().await?;
                self.checkpoint()?;
                Ok(image)
            }
        }
    }

    async fn flush(&self) -> CamResult<()> {
        if self.descriptor.interlaced {
            for field in [FieldSelector::Odd, FieldSelector::Even] {
                self.queue
                    .submit(&CcdCommand::ClearPixels {
                        field,
                        flags: 0,
                        cam_index: self.cam_index,
                    })
                    .await?;
            }
        } else {
            self.queue
                .submit(&CcdCommand::ClearPixels {
                    field: FieldSelector::Both,
                    flags: 0,
                    cam_index: self.cam_index,
                })
                .await?;
        }
        Ok(())
    }

    fn window(&self, field: FieldSelector) -> ExposureWindow {
        let r = &self.region;
        match self.descriptor.kind {
            // Packed readout drains two image rows per register line.
            ExposeCommandKind::InterlacedM25C => ExposureWindow {
                x_offset: r.x * 2,
                y_offset: r.y / 2,
                width: r.width * 2,
                height: r.height / 2,
                x_bin: r.bin_x,
                y_bin: r.bin_y,
            },
            _ => {
                let height = match field {
                    FieldSelector::Both => r.height,
                    FieldSelector::Odd | FieldSelector::Even => r.height / 2,
                };
                ExposureWindow {
                    x_offset: r.x,
                    y_offset: r.y,
                    width: r.width,
                    height,
                    x_bin: r.bin_x,
                    y_bin: r.bin_y,
                }
            }
        }
    }

    /// M26C register geometry: lines run along the image's vertical axis.
    fn m26c_geometry(&self) -> FrameGeometry {
        FrameGeometry {
            line_length: usize::from(self.region.height),
            line_count: usize::from(self.region.width),
        }
    }

    async fn read_field(&self, field: FieldSelector, samples: usize) -> CamResult<Vec<u16>> {
        self.queue
            .submit(&CcdCommand::LatchPixels {
                field,
                cam_index: self.cam_index,
                window: self.window(field),
            })
            .await?;
        let bytes = self
            .queue
            .submit(&CcdCommand::BulkRead {
                byte_len: samples * 2,
                allows_underrun: true,
            })
            .await?;
        self.expect_samples(bytes, samples)
    }

    fn expect_samples(&self, bytes: Bytes, expected: usize) -> CamResult<Vec<u16>> {
        if bytes.len() != expected * 2 {
            // A short pixel transfer is normal when the exposure was
            // aborted under us; otherwise the frame is unusable.
            if self.cancel.is_cancelled() {
                return Err(CameraError::Cancelled);
            }
            return Err(ProtocolError::LengthMismatch {
                expected: expected * 2,
                actual: bytes.len(),
            }
            .into());
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    async fn latch_and_read(&self) -> CamResult<ReconstructedImage> {
        let r = &self.region;
        let width = usize::from(r.width);
        let height = usize::from(r.height);

        match self.descriptor.kind {
            ExposeCommandKind::Plain => {
                let samples = self.read_field(FieldSelector::Both, r.samples()).await?;
                Ok(ReconstructedImage {
                    width,
                    height,
                    pixels: samples,
                })
            }
            ExposeCommandKind::InterlacedM25C => {
                let samples = self.read_field(FieldSelector::Both, r.samples()).await?;
                let pixels = deinterleave_packed(&samples, width, height)?;
                Ok(ReconstructedImage {
                    width,
                    height,
                    pixels,
                })
            }
            ExposeCommandKind::Lodestar => {
                let field_samples = r.samples() / 2;
                let even = self.read_field(FieldSelector::Even, field_samples).await?;
                let odd = self.read_field(FieldSelector::Odd, field_samples).await?;
                let pixels = interleave_fields(&even, &odd, width, height)?;
                Ok(ReconstructedImage {
                    width,
                    height,
                    pixels,
                })
            }
            ExposeCommandKind::InterlacedM26C => {
                let geometry = self.m26c_geometry();
                let image = match r.bin_x {
                    1 | 2 => {
                        let field1 =
                            self.read_field(FieldSelector::Odd, geometry.field_samples()).await?;
                        let field2 =
                            self.read_field(FieldSelector::Even, geometry.field_samples()).await?;
                        let input = if r.bin_x == 1 {
                            InterlacedInput::Bin1 {
                                field1: &field1,
                                field2: &field2,
                            }
                        } else {
                            InterlacedInput::Bin2 {
                                field1: &field1,
                                field2: &field2,
                            }
                        };
                        reconstruct_interlaced(input, geometry, self.descriptor.field_order)?
                    }
                    4 => {
                        let frame =
                            self.read_field(FieldSelector::Both, geometry.full_samples()).await?;
                        reconstruct_interlaced(
                            InterlacedInput::Bin4 { frame: &frame },
                            geometry,
                            self.descriptor.field_order,
                        )?
                    }
                    other => {
                        return Err(DeviceError::InvalidRegion(format!(
                            "unsupported binning {other} on this sensor"
                        ))
                        .into())
                    }
                };
                Ok(image)
            }
        }
    }

    async fn device_timed_read(&self) -> CamResult<ReconstructedImage> {
        if self.descriptor.kind != ExposeCommandKind::Plain {
            return Err(DeviceError::TimerUnsupported.into());
        }
        let r = &self.region;
        let delay_ms = u32::try_from(self.timing.duration.as_millis()).unwrap_or(u32::MAX);
        let bytes = self
            .queue
            .submit(&CcdCommand::ReadPixelsDelayed {
                field: FieldSelector::Both,
                cam_index: self.cam_index,
                window: self.window(FieldSelector::Both),
                delay_ms,
                response_len: r.samples() * 2,
            })
            .await?;
        let pixels = self.expect_samples(bytes, r.samples())?;
        Ok(ReconstructedImage {
            width: usize::from(r.width),
            height: usize::from(r.height),
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::STAR2K_NORTH;
    use crate::protocol::Opcode;
    use crate::transport::sim::SimTransport;

    async fn connect_sim(width: u16, height: u16) -> (CcdDevice, crate::transport::sim::SimHandle) {
        let sim = SimTransport::progressive(width, height);
        let handle = sim.handle();
        let device = CcdDevice::connect(Box::new(sim)).await.unwrap();
        (device, handle)
    }

    #[test]
    fn model_classification() {
        assert_eq!(ExposeCommandKind::classify(0x09), ExposeCommandKind::Plain);
        assert_eq!(
            ExposeCommandKind::classify(0x59),
            ExposeCommandKind::InterlacedM25C
        );
        assert_eq!(
            ExposeCommandKind::classify(0x5A),
            ExposeCommandKind::InterlacedM26C
        );
        assert_eq!(
            ExposeCommandKind::classify(0x46),
            ExposeCommandKind::Lodestar
        );
        // Unknown interlaced model falls back to the row-interleave path.
        assert_eq!(
            ExposeCommandKind::classify(0x47),
            ExposeCommandKind::Lodestar
        );
        assert_eq!(ExposeCommandKind::classify(0x05), ExposeCommandKind::Plain);
    }

    #[tokio::test]
    async fn connect_reads_the_sensor_identity() {
        let (device, _) = connect_sim(1392, 1040).await;
        let descriptor = device.descriptor();
        assert_eq!(descriptor.width, 1392);
        assert_eq!(descriptor.height, 1040);
        assert_eq!(descriptor.kind, ExposeCommandKind::Plain);
        assert!(!descriptor.interlaced);
        assert!(descriptor.has_star2k_port);
        assert_eq!(descriptor.firmware, (1, 12));
        assert_eq!(descriptor.model_name, "SXVF-H9");
    }

    #[tokio::test]
    async fn invalid_region_fails_before_any_wire_traffic() {
        let (device, handle) = connect_sim(100, 100).await;
        let writes_before = handle.write_opcodes().len();

        let err = device
            .expose(
                ExposureRegion {
                    x: 60,
                    y: 0,
                    width: 50,
                    height: 50,
                    bin_x: 1,
                    bin_y: 1,
                },
                ExposureTiming::host_timed(Duration::from_millis(1)),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CameraError::Device(DeviceError::InvalidRegion(_))
        ));
        assert_eq!(handle.write_opcodes().len(), writes_before);
    }

    #[tokio::test]
    async fn region_validation_respects_binning() {
        let (device, _) = connect_sim(100, 100).await;
        let descriptor = device.descriptor();
        // 100/2 = 50 binned pixels per axis.
        assert!(descriptor
            .validate_region(&ExposureRegion {
                x: 0,
                y: 0,
                width: 50,
                height: 50,
                bin_x: 2,
                bin_y: 2,
            })
            .is_ok());
        assert!(descriptor
            .validate_region(&ExposureRegion {
                x: 1,
                y: 0,
                width: 50,
                height: 50,
                bin_x: 2,
                bin_y: 2,
            })
            .is_err());
        assert!(descriptor
            .validate_region(&ExposureRegion {
                x: 0,
                y: 0,
                width: 10,
                height: 10,
                bin_x: 0,
                bin_y: 1,
            })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn interlaced_layout_limits_fail_before_any_wire_traffic() {
        let sim = SimTransport::new(
            CcdParams {
                hfront_porch: 0,
                hback_porch: 0,
                width: 120,
                vfront_porch: 0,
                vback_porch: 0,
                height: 120,
                pix_width: 6.45,
                pix_height: 6.45,
                color_matrix: ColorMatrix::Monochrome,
                bits_per_pixel: 16,
                num_serial_ports: 0,
                extra_caps: 0,
                vclk_delay: 0,
            },
            0x5A,
        );
        let handle = sim.handle();
        let device = CcdDevice::connect(Box::new(sim)).await.unwrap();
        assert_eq!(device.descriptor().kind, ExposeCommandKind::InterlacedM26C);
        let writes_before = handle.write_opcodes().len();

        // Asymmetric binning, a bin factor with no weave layout, and a
        // width off the unbinned line period: all in bounds, none latchable.
        let bad_regions = [
            (40u16, 40u16, 1u8, 2u8),
            (40, 40, 3, 3),
            (42, 40, 1, 1),
        ];
        for (width, height, bin_x, bin_y) in bad_regions {
            let err = device
                .expose(
                    ExposureRegion {
                        x: 0,
                        y: 0,
                        width,
                        height,
                        bin_x,
                        bin_y,
                    },
                    ExposureTiming::host_timed(Duration::from_secs(10)),
                    &CancelToken::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                CameraError::Device(DeviceError::InvalidRegion(_))
            ));
        }
        assert_eq!(handle.write_opcodes().len(), writes_before);
    }

    #[tokio::test(start_paused = true)]
    async fn host_timed_exposure_walks_the_state_sequence() {
        let (device, _) = connect_sim(100, 100).await;
        let mut states = device.state_stream();

        let image = device
            .expose(
                ExposureRegion {
                    x: 0,
                    y: 0,
                    width: 100,
                    height: 100,
                    bin_x: 1,
                    bin_y: 1,
                },
                ExposureTiming::host_timed(Duration::from_millis(500)),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(image.width, 100);
        assert_eq!(image.height, 100);
        assert_eq!(image.pixels.len(), 10_000);
        // Ramp data passes through the identity path untouched.
        assert_eq!(image.pixels[0], 0);
        assert_eq!(image.pixels[9_999], 9_999);

        let mut seen = Vec::new();
        while let Ok(state) = states.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ExposureState::Idle,
                ExposureState::Flushing,
                ExposureState::Exposing,
                ExposureState::Latching,
                ExposureState::Reading,
                ExposureState::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn device_timed_exposure_skips_latch_and_read_states() {
        let (device, handle) = connect_sim(64, 64).await;
        let mut states = device.state_stream();

        let image = device
            .expose(
                ExposureRegion {
                    x: 0,
                    y: 0,
                    width: 64,
                    height: 64,
                    bin_x: 1,
                    bin_y: 1,
                },
                ExposureTiming::device_timed(Duration::from_millis(5)),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(image.pixels.len(), 64 * 64);

        let mut seen = Vec::new();
        while let Ok(state) = states.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ExposureState::Idle,
                ExposureState::Flushing,
                ExposureState::Exposing,
                ExposureState::Complete,
            ]
        );
        assert!(handle
            .write_opcodes()
            .contains(&Opcode::ReadPixelsDelayed));
    }

    #[tokio::test]
    async fn pre_cancelled_token_terminates_cleanly() {
        let (device, handle) = connect_sim(100, 100).await;
        let cancel = CancelToken::new();
        cancel.cancel();
        let writes_before = handle.write_opcodes().len();

        let err = device
            .expose(
                ExposureRegion {
                    x: 0,
                    y: 0,
                    width: 100,
                    height: 100,
                    bin_x: 1,
                    bin_y: 1,
                },
                ExposureTiming::host_timed(Duration::from_millis(50)),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        // Cancelled before Flushing: nothing was written.
        assert_eq!(handle.write_opcodes().len(), writes_before);
    }

    #[tokio::test]
    async fn concurrent_exposures_report_busy() {
        let (device, _) = connect_sim(100, 100).await;
        let device = std::sync::Arc::new(device);
        let cancel = CancelToken::new();

        let background = {
            let device = std::sync::Arc::clone(&device);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                device
                    .expose(
                        ExposureRegion {
                            x: 0,
                            y: 0,
                            width: 100,
                            height: 100,
                            bin_x: 1,
                            bin_y: 1,
                        },
                        ExposureTiming::host_timed(Duration::from_millis(500)),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = device
            .expose(
                ExposureRegion {
                    x: 0,
                    y: 0,
                    width: 10,
                    height: 10,
                    bin_x: 1,
                    bin_y: 1,
                },
                ExposureTiming::host_timed(Duration::from_millis(1)),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CameraError::Device(DeviceError::Busy)));

        cancel.cancel();
        assert!(background.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn guide_pulse_drives_and_releases_the_relays() {
        let (device, handle) = connect_sim(64, 64).await;
        device
            .pulse_guide(STAR2K_NORTH, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(handle.last_relays(), STAR2K_STOP);
        let relays: Vec<u16> = handle
            .events()
            .iter()
            .filter_map(|e| match e {
                crate::transport::sim::WireEvent::Write {
                    opcode: Opcode::SetStar2k,
                    value,
                    ..
                } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(relays, vec![STAR2K_NORTH, STAR2K_STOP]);
    }

    #[tokio::test]
    async fn timer_and_echo_round_trip() {
        let (device, _) = connect_sim(64, 64).await;
        device.set_timer(750).await.unwrap();
        assert_eq!(device.timer().await.unwrap(), 750);
        let echoed = device.echo(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(echoed, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn eeprom_and_serial_passthrough() {
        let (device, handle) = connect_sim(64, 64).await;
        let eeprom = device.read_eeprom(0, 16).await.unwrap();
        assert_eq!(eeprom.len(), 16);
        assert!(eeprom.iter().all(|b| *b == 0xA5));

        handle.load_serial_rx(b"ok");
        device
            .serial_write(0, Bytes::from_static(b"cmd"), true)
            .await
            .unwrap();
        assert_eq!(handle.serial_tx(), b"cmd");
        let read = device.serial_read(0, 2).await.unwrap();
        assert_eq!(&read[..], b"ok");
    }
}
