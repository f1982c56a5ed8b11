//! Typed commands and their wire encoding.
//!
//! A [`CcdCommand`] describes one logical operation; [`CcdCommand::request`]
//! lowers it to a [`CommandRequest`], the unit the command queue actually
//! executes: bytes to write, how many response bytes to collect, and whether
//! the device is allowed to return fewer (some readout paths legitimately
//! deliver short final transfers).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::params::CcdParams;
use crate::protocol::{FieldSelector, Opcode, SetupPacket};

/// Guide relay bit: all relays open.
pub const STAR2K_STOP: u16 = 0;
/// Guide relay bit: west.
pub const STAR2K_WEST: u16 = 1;
/// Guide relay bit: south.
pub const STAR2K_SOUTH: u16 = 2;
/// Guide relay bit: north.
pub const STAR2K_NORTH: u16 = 4;
/// Guide relay bit: east.
pub const STAR2K_EAST: u16 = 8;

/// A binned sub-frame of the sensor, in binned coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureWindow {
    pub x_offset: u16,
    pub y_offset: u16,
    pub width: u16,
    pub height: u16,
    pub x_bin: u8,
    pub y_bin: u8,
}

impl ExposureWindow {
    /// Wire size of the window payload.
    pub const LEN: usize = 10;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.x_offset);
        buf.put_u16_le(self.y_offset);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u8(self.x_bin);
        buf.put_u8(self.y_bin);
    }
}

/// One executable unit for the command queue.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Bytes to write before reading. Empty for raw bulk reads.
    pub write: Bytes,
    /// Number of response bytes to collect. Zero for write-only commands.
    pub response_len: usize,
    /// Whether a response shorter than `response_len` terminates the read
    /// normally instead of raising a length mismatch.
    pub allows_underrun: bool,
}

impl CommandRequest {
    fn write_only(write: Bytes) -> Self {
        Self {
            write,
            response_len: 0,
            allows_underrun: false,
        }
    }
}

/// Every operation the controller firmware understands.
#[derive(Debug, Clone)]
pub enum CcdCommand {
    /// Reset the controller to its power-on state.
    Reset,
    /// Write a payload and expect it echoed back unchanged.
    Echo { payload: Bytes },
    /// Discard accumulated charge from the selected field(s).
    ClearPixels {
        field: FieldSelector,
        /// Extra `FLAG_*` bits or'd into the field flags.
        flags: u16,
        cam_index: u16,
    },
    /// Latch a sub-frame into the readout register for immediate transfer.
    LatchPixels {
        field: FieldSelector,
        cam_index: u16,
        window: ExposureWindow,
    },
    /// Latch and read a sub-frame after a device-timed delay; the response
    /// is the pixel data itself.
    ReadPixelsDelayed {
        field: FieldSelector,
        cam_index: u16,
        window: ExposureWindow,
        delay_ms: u32,
        /// Pixel bytes expected back.
        response_len: usize,
    },
    /// Collect pixel bytes already latched by a previous command. Writes
    /// nothing on the wire.
    BulkRead {
        byte_len: usize,
        allows_underrun: bool,
    },
    /// Program the device millisecond timer.
    SetTimer { msec: u32 },
    /// Read back the device millisecond timer.
    GetTimer,
    /// Read the CCD parameter block.
    GetCcd { cam_index: u16 },
    /// Overwrite the CCD parameter block.
    SetCcd { cam_index: u16, params: CcdParams },
    /// Drive the guide-port relays (`STAR2K_*` bits).
    SetStar2k { relays: u16 },
    /// Write through a pass-through serial port, optionally flushing.
    WriteSerialPort {
        port: u16,
        flush: bool,
        payload: Bytes,
    },
    /// Read from a pass-through serial port.
    ReadSerialPort { port: u16, len: u16 },
    /// Query a serial port property word.
    GetSerial { port: u16, property: u16 },
    /// Read the camera model code.
    GetCameraModel,
    /// Read a span of the controller EEPROM.
    LoadEeprom { address: u16, len: u16 },
    /// Read the firmware version.
    GetFirmwareVersion,
}

impl CcdCommand {
    /// Lower to the bytes and read expectation the queue executes.
    pub fn request(&self) -> CommandRequest {
        match self {
            CcdCommand::Reset => {
                CommandRequest::write_only(encode_header(SetupPacket::out(Opcode::Reset, 0, 0, 0)))
            }
            CcdCommand::Echo { payload } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + payload.len());
                SetupPacket::out(Opcode::Echo, 0, 0, payload.len() as u16).encode(&mut buf);
                buf.put_slice(payload);
                CommandRequest {
                    write: buf.freeze(),
                    response_len: payload.len(),
                    allows_underrun: false,
                }
            }
            CcdCommand::ClearPixels {
                field,
                flags,
                cam_index,
            } => CommandRequest::write_only(encode_header(SetupPacket::out(
                Opcode::ClearPixels,
                field.flags() | flags,
                *cam_index,
                0,
            ))),
            CcdCommand::LatchPixels {
                field,
                cam_index,
                window,
            } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + ExposureWindow::LEN);
                SetupPacket::out(
                    Opcode::ReadPixels,
                    field.flags(),
                    *cam_index,
                    ExposureWindow::LEN as u16,
                )
                .encode(&mut buf);
                window.put(&mut buf);
                CommandRequest::write_only(buf.freeze())
            }
            CcdCommand::ReadPixelsDelayed {
                field,
                cam_index,
                window,
                delay_ms,
                response_len,
            } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + ExposureWindow::LEN + 4);
                SetupPacket::out(
                    Opcode::ReadPixelsDelayed,
                    field.flags(),
                    *cam_index,
                    (ExposureWindow::LEN + 4) as u16,
                )
                .encode(&mut buf);
                window.put(&mut buf);
                buf.put_u32_le(*delay_ms);
                CommandRequest {
                    write: buf.freeze(),
                    response_len: *response_len,
                    allows_underrun: true,
                }
            }
            CcdCommand::BulkRead {
                byte_len,
                allows_underrun,
            } => CommandRequest {
                write: Bytes::new(),
                response_len: *byte_len,
                allows_underrun: *allows_underrun,
            },
            CcdCommand::SetTimer { msec } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + 4);
                SetupPacket::out(Opcode::SetTimer, 0, 0, 4).encode(&mut buf);
                buf.put_u32_le(*msec);
                CommandRequest::write_only(buf.freeze())
            }
            CcdCommand::GetTimer => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::GetTimer, 0, 0, 4)),
                response_len: 4,
                allows_underrun: false,
            },
            CcdCommand::GetCcd { cam_index } => CommandRequest {
                write: encode_header(SetupPacket::input(
                    Opcode::GetCcd,
                    0,
                    *cam_index,
                    CcdParams::LEN as u16,
                )),
                response_len: CcdParams::LEN,
                allows_underrun: false,
            },
            CcdCommand::SetCcd { cam_index, params } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + CcdParams::SET_LEN);
                SetupPacket::out(Opcode::SetCcd, 0, *cam_index, CcdParams::SET_LEN as u16)
                    .encode(&mut buf);
                buf.put_slice(&params.set_payload());
                CommandRequest::write_only(buf.freeze())
            }
            CcdCommand::SetStar2k { relays } => CommandRequest::write_only(encode_header(
                SetupPacket::out(Opcode::SetStar2k, *relays, 0, 0),
            )),
            CcdCommand::WriteSerialPort {
                port,
                flush,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(SetupPacket::LEN + payload.len());
                SetupPacket::out(
                    Opcode::WriteSerialPort,
                    u16::from(*flush),
                    *port,
                    payload.len() as u16,
                )
                .encode(&mut buf);
                buf.put_slice(payload);
                CommandRequest::write_only(buf.freeze())
            }
            CcdCommand::ReadSerialPort { port, len } => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::ReadSerialPort, 0, *port, *len)),
                response_len: usize::from(*len),
                allows_underrun: false,
            },
            CcdCommand::GetSerial { port, property } => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::GetSerial, *property, *port, 2)),
                response_len: 2,
                allows_underrun: false,
            },
            CcdCommand::GetCameraModel => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::CameraModel, 0, 0, 2)),
                response_len: 2,
                allows_underrun: false,
            },
            CcdCommand::LoadEeprom { address, len } => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::LoadEeprom, *address, 0, *len)),
                response_len: usize::from(*len),
                allows_underrun: false,
            },
            CcdCommand::GetFirmwareVersion => CommandRequest {
                write: encode_header(SetupPacket::input(Opcode::GetFirmwareVersion, 0, 0, 4)),
                response_len: 4,
                allows_underrun: false,
            },
        }
    }
}

fn encode_header(packet: SetupPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(SetupPacket::LEN);
    packet.encode(&mut buf);
    buf.freeze()
}

/// Decode the 4-byte `GET_TIMER` response into milliseconds.
pub fn decode_timer(bytes: &[u8]) -> Result<u32, ProtocolError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ProtocolError::LengthMismatch {
            expected: 4,
            actual: bytes.len(),
        })?;
    Ok(u32::from_le_bytes(raw))
}

/// Decode the 2-byte `CAMERA_MODEL` response.
pub fn decode_camera_model(bytes: &[u8]) -> Result<u16, ProtocolError> {
    let raw: [u8; 2] = bytes
        .try_into()
        .map_err(|_| ProtocolError::LengthMismatch {
            expected: 2,
            actual: bytes.len(),
        })?;
    Ok(u16::from_le_bytes(raw))
}

/// Decode the firmware version response into `(major, minor)`.
pub fn decode_firmware_version(bytes: &[u8]) -> Result<(u16, u16), ProtocolError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ProtocolError::LengthMismatch {
            expected: 4,
            actual: bytes.len(),
        })?;
    let word = u32::from_le_bytes(raw);
    Ok(((word >> 16) as u16, (word & 0xFFFF) as u16))
}
