//! In-process simulated camera.
//!
//! [`SimTransport`] implements [`Transport`] over a small firmware model:
//! writes are parsed as wire commands, responses are queued as bytes and
//! drained by `read_chunk`. Pixel responses are a deterministic ramp (each
//! sample is its linear index, little-endian), which makes full-frame
//! assertions cheap in tests.
//!
//! A [`SimHandle`] shares the model state, so tests can inspect the wire
//! event log, preload serial data, or inject short reads and disconnects
//! while the transport itself is owned by the command queue.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::trace;

use crate::error::TransportError;
use crate::protocol::params::{CcdParams, ColorMatrix, CAP_EEPROM, CAP_STAR2K};
use crate::protocol::{Opcode, SetupPacket};
use crate::transport::Transport;

/// One observed wire operation, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A command write, identified by its header.
    Write {
        opcode: Opcode,
        value: u16,
        index: u16,
        length: u16,
    },
    /// A response chunk handed back to the host.
    Read { len: usize },
}

struct SimState {
    params: CcdParams,
    model: u16,
    firmware: (u16, u16),
    timer_ms: u32,
    connected: bool,
    pending: Vec<u8>,
    chunk_limit: usize,
    read_delay: std::time::Duration,
    short_next_pixels_by: usize,
    noise: bool,
    last_relays: u16,
    serial_rx: Vec<u8>,
    serial_tx: Vec<u8>,
    eeprom: Vec<u8>,
    events: Vec<WireEvent>,
}

impl SimState {
    fn handle_command(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let packet = SetupPacket::parse(bytes)
            .map_err(|e| TransportError::Disconnected(format!("malformed command: {e}")))?;
        let payload = &bytes[SetupPacket::LEN..];
        self.events.push(WireEvent::Write {
            opcode: packet.opcode,
            value: packet.value,
            index: packet.index,
            length: packet.length,
        });
        trace!(opcode = ?packet.opcode, value = packet.value, "sim command");

        match packet.opcode {
            Opcode::Echo => self.pending.extend_from_slice(payload),
            Opcode::ClearPixels => {}
            Opcode::ReadPixels | Opcode::ReadPixelsDelayed => {
                let width = u16::from_le_bytes([payload[4], payload[5]]);
                let height = u16::from_le_bytes([payload[6], payload[7]]);
                self.queue_pixels(usize::from(width) * usize::from(height));
            }
            Opcode::SetTimer => {
                self.timer_ms = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            }
            Opcode::GetTimer => self.pending.extend_from_slice(&self.timer_ms.to_le_bytes()),
            Opcode::Reset => self.pending.clear(),
            Opcode::GetCcd => {
                let block = self.params.to_bytes();
                self.pending.extend_from_slice(&block);
            }
            Opcode::SetCcd => {
                self.params.hfront_porch = payload[0];
                self.params.hback_porch = payload[1];
                self.params.width = u16::from_le_bytes([payload[2], payload[3]]);
                self.params.vfront_porch = payload[4];
                self.params.vback_porch = payload[5];
                self.params.height = u16::from_le_bytes([payload[6], payload[7]]);
                self.params.vclk_delay = payload[14];
            }
            Opcode::SetStar2k => self.last_relays = packet.value,
            Opcode::WriteSerialPort => self.serial_tx.extend_from_slice(payload),
            Opcode::ReadSerialPort => {
                let want = usize::from(packet.length);
                let take = want.min(self.serial_rx.len());
                let mut chunk: Vec<u8> = self.serial_rx.drain(..take).collect();
                chunk.resize(want, 0);
                self.pending.extend_from_slice(&chunk);
            }
            Opcode::SetSerial => {}
            Opcode::GetSerial => self.pending.extend_from_slice(&[0, 0]),
            Opcode::CameraModel => self.pending.extend_from_slice(&self.model.to_le_bytes()),
            Opcode::LoadEeprom => {
                let start = usize::from(packet.value).min(self.eeprom.len());
                let end = (start + usize::from(packet.length)).min(self.eeprom.len());
                let mut chunk = self.eeprom[start..end].to_vec();
                chunk.resize(usize::from(packet.length), 0);
                self.pending.extend_from_slice(&chunk);
            }
            Opcode::GetFirmwareVersion => {
                let word = (u32::from(self.firmware.0) << 16) | u32::from(self.firmware.1);
                self.pending.extend_from_slice(&word.to_le_bytes());
            }
        }
        Ok(())
    }

    fn queue_pixels(&mut self, samples: usize) {
        let mut data = Vec::with_capacity(samples * 2);
        if self.noise {
            let mut rng = rand::thread_rng();
            for _ in 0..samples {
                data.extend_from_slice(&rng.gen::<u16>().to_le_bytes());
            }
        } else {
            for i in 0..samples {
                data.extend_from_slice(&(i as u16).to_le_bytes());
            }
        }
        let trim = self.short_next_pixels_by.min(data.len());
        data.truncate(data.len() - trim);
        self.short_next_pixels_by = 0;
        self.pending.extend_from_slice(&data);
    }
}

/// Test-side handle to a [`SimTransport`]'s firmware model.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot of the wire event log.
    pub fn events(&self) -> Vec<WireEvent> {
        self.lock().events.clone()
    }

    /// Opcodes of the command writes observed so far, in order.
    pub fn write_opcodes(&self) -> Vec<Opcode> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write { opcode, .. } => Some(*opcode),
                WireEvent::Read { .. } => None,
            })
            .collect()
    }

    /// Cap the size of each response chunk, forcing multi-chunk reads.
    pub fn set_chunk_limit(&self, limit: usize) {
        self.lock().chunk_limit = limit.max(1);
    }

    /// Delay every response chunk, so reads take simulated time.
    pub fn set_read_delay(&self, delay: std::time::Duration) {
        self.lock().read_delay = delay;
    }

    /// Trim the next pixel response by `bytes`, simulating an underrun.
    pub fn short_next_pixel_read(&self, bytes: usize) {
        self.lock().short_next_pixels_by = bytes;
    }

    /// Replace ramp pixel data with random samples.
    pub fn set_noise(&self, noise: bool) {
        self.lock().noise = noise;
    }

    /// Drop the link; every subsequent transport call fails.
    pub fn unplug(&self) {
        self.lock().connected = false;
    }

    /// Preload bytes for the pass-through serial port to return.
    pub fn load_serial_rx(&self, bytes: &[u8]) {
        self.lock().serial_rx.extend_from_slice(bytes);
    }

    /// Bytes written to the pass-through serial port so far.
    pub fn serial_tx(&self) -> Vec<u8> {
        self.lock().serial_tx.clone()
    }

    /// Guide relay bits from the last `SET_STAR2K`.
    pub fn last_relays(&self) -> u16 {
        self.lock().last_relays
    }

    /// Current parameter block (reflects any `SET_CCD`).
    pub fn params(&self) -> CcdParams {
        self.lock().params
    }

    /// Milliseconds programmed by the last `SET_TIMER`.
    pub fn timer_ms(&self) -> u32 {
        self.lock().timer_ms
    }
}

/// A simulated camera behind the [`Transport`] trait.
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    /// A simulated camera with the given parameter block and model code.
    pub fn new(params: CcdParams, model: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                params,
                model,
                firmware: (1, 12),
                timer_ms: 0,
                connected: false,
                pending: Vec::new(),
                chunk_limit: 65536,
                read_delay: std::time::Duration::ZERO,
                short_next_pixels_by: 0,
                noise: false,
                last_relays: 0,
                serial_rx: Vec::new(),
                serial_tx: Vec::new(),
                eeprom: vec![0xA5; 256],
                events: Vec::new(),
            })),
        }
    }

    /// A progressive monochrome sensor of the given size, model code 0x09.
    pub fn progressive(width: u16, height: u16) -> Self {
        Self::new(
            CcdParams {
                hfront_porch: 0,
                hback_porch: 0,
                width,
                vfront_porch: 0,
                vback_porch: 0,
                height,
                pix_width: 6.45,
                pix_height: 6.45,
                color_matrix: ColorMatrix::Monochrome,
                bits_per_pixel: 16,
                num_serial_ports: 1,
                extra_caps: CAP_STAR2K | CAP_EEPROM,
                vclk_delay: 0,
            },
            0x09,
        )
    }

    /// Control handle shared with the firmware model.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn name(&self) -> &str {
        "sim"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.lock().connected = false;
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected("sim unplugged".into()));
        }
        state.handle_command(bytes)
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected("sim unplugged".into()));
        }
        let take = len.min(state.chunk_limit).min(state.pending.len());
        let chunk: Vec<u8> = state.pending.drain(..take).collect();
        state.events.push(WireEvent::Read { len: chunk.len() });
        Ok(chunk)
    }
}

/// Convenience for tests: a command write followed by its full response.
pub async fn roundtrip(
    transport: &mut SimTransport,
    write: &Bytes,
    response_len: usize,
) -> Result<Vec<u8>, TransportError> {
    transport.write_all(write).await?;
    let mut out = Vec::with_capacity(response_len);
    while out.len() < response_len {
        let chunk = transport.read_chunk(response_len - out.len()).await?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::CcdCommand;

    #[tokio::test]
    async fn serves_the_parameter_block() {
        let mut sim = SimTransport::progressive(1392, 1040);
        sim.connect().await.unwrap();
        let req = CcdCommand::GetCcd { cam_index: 0 }.request();
        let bytes = roundtrip(&mut sim, &req.write, req.response_len)
            .await
            .unwrap();
        let params = CcdParams::from_bytes(&bytes).unwrap();
        assert_eq!(params.width, 1392);
        assert_eq!(params.height, 1040);
    }

    #[tokio::test]
    async fn pixel_ramp_counts_samples() {
        let mut sim = SimTransport::progressive(100, 50);
        sim.connect().await.unwrap();
        let req = CcdCommand::LatchPixels {
            field: crate::protocol::FieldSelector::Both,
            cam_index: 0,
            window: crate::protocol::command::ExposureWindow {
                x_offset: 0,
                y_offset: 0,
                width: 100,
                height: 50,
                x_bin: 1,
                y_bin: 1,
            },
        }
        .request();
        sim.write_all(&req.write).await.unwrap();
        let read = CcdCommand::BulkRead {
            byte_len: 100 * 50 * 2,
            allows_underrun: true,
        }
        .request();
        let mut pixels = Vec::new();
        while pixels.len() < read.response_len {
            let chunk = sim
                .read_chunk(read.response_len - pixels.len())
                .await
                .unwrap();
            if chunk.is_empty() {
                break;
            }
            pixels.extend_from_slice(&chunk);
        }
        assert_eq!(pixels.len(), 10_000);
        assert_eq!(u16::from_le_bytes([pixels[0], pixels[1]]), 0);
        assert_eq!(u16::from_le_bytes([pixels[9998], pixels[9999]]), 4999);
    }

    #[tokio::test]
    async fn chunk_limit_splits_reads() {
        let mut sim = SimTransport::progressive(4, 4);
        sim.connect().await.unwrap();
        let handle = sim.handle();
        handle.set_chunk_limit(7);
        let req = CcdCommand::Echo {
            payload: Bytes::from_static(b"0123456789"),
        }
        .request();
        sim.write_all(&req.write).await.unwrap();
        let first = sim.read_chunk(10).await.unwrap();
        assert_eq!(first.len(), 7);
        let second = sim.read_chunk(3).await.unwrap();
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn unplug_fails_every_call() {
        let mut sim = SimTransport::progressive(4, 4);
        sim.connect().await.unwrap();
        sim.handle().unplug();
        assert!(matches!(
            sim.write_all(&[0x40, 6, 0, 0, 0, 0, 0, 0]).await,
            Err(TransportError::Disconnected(_))
        ));
    }
}
