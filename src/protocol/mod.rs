//! Vendor wire protocol for the CCD controller.
//!
//! Every command starts with an 8-byte USB control-transfer setup packet,
//! little-endian throughout:
//!
//! ```text
//! [ requestType | opcode | valueL | valueH | indexL | indexH | lengthL | lengthH | payload… ]
//! ```
//!
//! `requestType` packs the vendor class tag with the transfer direction in
//! bit 7 (0 = host-to-device, 1 = device-to-host). `value`, `index` and the
//! payload layout are command-specific; the `length` field carries the
//! payload size for OUT commands and the expected response size for IN
//! commands.
//!
//! Submodules:
//! - [`command`]: typed commands and their wire encoding/decoding.
//! - [`params`]: the 17-byte CCD parameter block, color-matrix tags and
//!   capability bits reported by `GET_CCD`.

pub mod command;
pub mod params;

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

/// Vendor class tag carried in every request type byte.
pub const REQ_VENDOR: u8 = 2 << 5;
/// Direction bit: device-to-host.
pub const REQ_DATA_IN: u8 = 0x80;
/// Direction bit: host-to-device.
pub const REQ_DATA_OUT: u8 = 0x00;

/// Exposure flag: read/clear the odd field only.
pub const FLAG_FIELD_ODD: u16 = 1;
/// Exposure flag: read/clear the even field only.
pub const FLAG_FIELD_EVEN: u16 = 2;
/// Exposure flag: both fields.
pub const FLAG_FIELD_BOTH: u16 = FLAG_FIELD_ODD | FLAG_FIELD_EVEN;
/// Exposure flag: accumulate instead of binning.
pub const FLAG_NOBIN_ACCUM: u16 = 4;
/// Exposure flag: do not wipe the frame before clearing.
pub const FLAG_NOWIPE_FRAME: u16 = 8;
/// Exposure flag: time-delay-integration readout.
pub const FLAG_TDI: u16 = 32;
/// Exposure flag: skip the clear entirely.
pub const FLAG_NOCLEAR_FRAME: u16 = 64;

/// Command codes understood by the CCD controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Connectivity check; echoes the payload back.
    Echo = 0,
    /// Discard accumulated charge ahead of an integration.
    ClearPixels = 1,
    /// Latch and read a sub-frame after a device-timed delay.
    ReadPixelsDelayed = 2,
    /// Latch a sub-frame for immediate transfer.
    ReadPixels = 3,
    /// Program the device millisecond timer.
    SetTimer = 4,
    /// Read back the device millisecond timer.
    GetTimer = 5,
    /// Reset the controller.
    Reset = 6,
    /// Overwrite the CCD parameter block.
    SetCcd = 7,
    /// Read the CCD parameter block.
    GetCcd = 8,
    /// Drive the guide-port relays.
    SetStar2k = 9,
    /// Write bytes through the pass-through serial port.
    WriteSerialPort = 10,
    /// Read bytes from the pass-through serial port.
    ReadSerialPort = 11,
    /// Configure a pass-through serial port property.
    SetSerial = 12,
    /// Query a pass-through serial port property.
    GetSerial = 13,
    /// Get or set the camera model code.
    CameraModel = 14,
    /// Read or write the controller EEPROM.
    LoadEeprom = 15,
    /// Read the firmware version.
    GetFirmwareVersion = 255,
}

impl Opcode {
    /// Decode a wire opcode byte.
    pub fn from_wire(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            0 => Opcode::Echo,
            1 => Opcode::ClearPixels,
            2 => Opcode::ReadPixelsDelayed,
            3 => Opcode::ReadPixels,
            4 => Opcode::SetTimer,
            5 => Opcode::GetTimer,
            6 => Opcode::Reset,
            7 => Opcode::SetCcd,
            8 => Opcode::GetCcd,
            9 => Opcode::SetStar2k,
            10 => Opcode::WriteSerialPort,
            11 => Opcode::ReadSerialPort,
            12 => Opcode::SetSerial,
            13 => Opcode::GetSerial,
            14 => Opcode::CameraModel,
            15 => Opcode::LoadEeprom,
            255 => Opcode::GetFirmwareVersion,
            other => return Err(ProtocolError::UnsupportedOpcode(other)),
        })
    }
}

/// Which interlaced field(s) a read or clear targets.
///
/// Only meaningful on interlaced sensors; progressive sensors always use
/// [`FieldSelector::Both`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelector {
    /// Both fields in one transfer.
    Both,
    /// Odd rows only.
    Odd,
    /// Even rows only.
    Even,
}

impl FieldSelector {
    /// The exposure flag bits selecting this field.
    pub fn flags(self) -> u16 {
        match self {
            FieldSelector::Both => FLAG_FIELD_BOTH,
            FieldSelector::Odd => FLAG_FIELD_ODD,
            FieldSelector::Even => FLAG_FIELD_EVEN,
        }
    }
}

/// The 8-byte control-transfer header at the front of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// True for device-to-host transfers.
    pub data_in: bool,
    /// Command code.
    pub opcode: Opcode,
    /// Command-specific value field (e.g. exposure flags).
    pub value: u16,
    /// Command-specific index field (e.g. camera index).
    pub index: u16,
    /// Payload length (OUT) or expected response length (IN).
    pub length: u16,
}

impl SetupPacket {
    /// Wire size of the header.
    pub const LEN: usize = 8;

    /// Build an OUT (host-to-device) header.
    pub fn out(opcode: Opcode, value: u16, index: u16, length: u16) -> Self {
        Self {
            data_in: false,
            opcode,
            value,
            index,
            length,
        }
    }

    /// Build an IN (device-to-host) header.
    pub fn input(opcode: Opcode, value: u16, index: u16, length: u16) -> Self {
        Self {
            data_in: true,
            opcode,
            value,
            index,
            length,
        }
    }

    /// Append the 8 header bytes to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let direction = if self.data_in {
            REQ_DATA_IN
        } else {
            REQ_DATA_OUT
        };
        buf.put_u8(REQ_VENDOR | direction);
        buf.put_u8(self.opcode as u8);
        buf.put_u16_le(self.value);
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.length);
    }

    /// Parse a header from the first 8 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::LengthMismatch {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            data_in: bytes[0] & REQ_DATA_IN != 0,
            opcode: Opcode::from_wire(bytes[1])?,
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}
