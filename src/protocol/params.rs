//! The CCD parameter block and its capability/color tags.
//!
//! `GET_CCD` returns a 17-byte block describing the sensor:
//!
//! ```text
//! offset  field             type
//! 0       hfront_porch      u8
//! 1       hback_porch       u8
//! 2..4    width             u16
//! 4       vfront_porch      u8
//! 5       vback_porch       u8
//! 6..8    height            u16
//! 8..10   pix_width         u16, 8.8 fixed point (value / 256.0 microns)
//! 10..12  pix_height        u16, 8.8 fixed point
//! 12..14  color_matrix      u16
//! 14      bits_per_pixel    u8
//! 15      num_serial_ports  u8
//! 16      extra_caps        u8
//! ```
//!
//! The `SET_CCD` payload is the 15-byte write-side variant of the same block:
//! it drops `bits_per_pixel` and `num_serial_ports`/`extra_caps` (which are
//! facts about the hardware) and appends the `vclk_delay` tuning byte.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Capability bit: STAR2000 guide port present.
pub const CAP_STAR2K: u8 = 0x01;
/// Capability bit: compressed pixel readout supported.
pub const CAP_COMPRESS: u8 = 0x02;
/// Capability bit: EEPROM present.
pub const CAP_EEPROM: u8 = 0x04;
/// Capability bit: integrated guider head attached.
pub const CAP_GUIDER: u8 = 0x08;
/// Capability bit: mechanical shutter fitted (later firmware only).
pub const CAP_SHUTTER: u8 = 0x40;

const COLOR_MONOCHROME: u16 = 0x0FFF;
const COLOR_PACKED_RGB: u16 = 0x8000;
const COLOR_PACKED_BGR: u16 = 0x4000;

/// Color-filter layout tag reported in the parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMatrix {
    /// No color filter.
    Monochrome,
    /// Packed RGB pixels, sizes in the low 12 bits.
    PackedRgb(u16),
    /// Packed BGR pixels, sizes in the low 12 bits.
    PackedBgr(u16),
    /// 2x2 Bayer mosaic; the word carries the per-channel position masks.
    Bayer2x2(u16),
}

impl ColorMatrix {
    /// Decode the raw color-matrix word.
    pub fn from_raw(raw: u16) -> Self {
        if raw == COLOR_MONOCHROME {
            ColorMatrix::Monochrome
        } else if raw & COLOR_PACKED_RGB != 0 {
            ColorMatrix::PackedRgb(raw)
        } else if raw & COLOR_PACKED_BGR != 0 {
            ColorMatrix::PackedBgr(raw)
        } else {
            ColorMatrix::Bayer2x2(raw)
        }
    }

    /// The wire representation.
    pub fn raw(self) -> u16 {
        match self {
            ColorMatrix::Monochrome => COLOR_MONOCHROME,
            ColorMatrix::PackedRgb(raw)
            | ColorMatrix::PackedBgr(raw)
            | ColorMatrix::Bayer2x2(raw) => raw,
        }
    }

    /// True for any color-filtered sensor.
    pub fn is_color(self) -> bool {
        !matches!(self, ColorMatrix::Monochrome)
    }
}

/// The sensor description reported by `GET_CCD`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcdParams {
    /// Horizontal front porch (masked columns before the image area).
    pub hfront_porch: u8,
    /// Horizontal back porch.
    pub hback_porch: u8,
    /// Native sensor width in pixels.
    pub width: u16,
    /// Vertical front porch.
    pub vfront_porch: u8,
    /// Vertical back porch.
    pub vback_porch: u8,
    /// Native sensor height in pixels.
    pub height: u16,
    /// Pixel pitch in microns (8.8 fixed point on the wire).
    pub pix_width: f32,
    /// Pixel pitch in microns (8.8 fixed point on the wire).
    pub pix_height: f32,
    /// Color-filter layout.
    pub color_matrix: ColorMatrix,
    /// Sample depth.
    pub bits_per_pixel: u8,
    /// Pass-through serial ports on the controller.
    pub num_serial_ports: u8,
    /// Capability bits (`CAP_*`).
    pub extra_caps: u8,
    /// Vertical clock delay tuning byte. Not reported by `GET_CCD`; only
    /// meaningful when writing the block back with `SET_CCD`.
    pub vclk_delay: u8,
}

impl CcdParams {
    /// Wire size of the `GET_CCD` response.
    pub const LEN: usize = 17;
    /// Wire size of the `SET_CCD` payload.
    pub const SET_LEN: usize = 15;

    /// Parse the 17-byte `GET_CCD` response.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::LEN {
            return Err(ProtocolError::LengthMismatch {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            hfront_porch: bytes[0],
            hback_porch: bytes[1],
            width: u16::from_le_bytes([bytes[2], bytes[3]]),
            vfront_porch: bytes[4],
            vback_porch: bytes[5],
            height: u16::from_le_bytes([bytes[6], bytes[7]]),
            pix_width: f32::from(u16::from_le_bytes([bytes[8], bytes[9]])) / 256.0,
            pix_height: f32::from(u16::from_le_bytes([bytes[10], bytes[11]])) / 256.0,
            color_matrix: ColorMatrix::from_raw(u16::from_le_bytes([bytes[12], bytes[13]])),
            bits_per_pixel: bytes[14],
            num_serial_ports: bytes[15],
            extra_caps: bytes[16],
            vclk_delay: 0,
        })
    }

    /// Encode as a 17-byte `GET_CCD`-shaped block.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.hfront_porch;
        out[1] = self.hback_porch;
        out[2..4].copy_from_slice(&self.width.to_le_bytes());
        out[4] = self.vfront_porch;
        out[5] = self.vback_porch;
        out[6..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..10].copy_from_slice(&fixed_8_8(self.pix_width).to_le_bytes());
        out[10..12].copy_from_slice(&fixed_8_8(self.pix_height).to_le_bytes());
        out[12..14].copy_from_slice(&self.color_matrix.raw().to_le_bytes());
        out[14] = self.bits_per_pixel;
        out[15] = self.num_serial_ports;
        out[16] = self.extra_caps;
        out
    }

    /// Encode the 15-byte `SET_CCD` payload.
    pub fn set_payload(&self) -> [u8; Self::SET_LEN] {
        let mut out = [0u8; Self::SET_LEN];
        out[0] = self.hfront_porch;
        out[1] = self.hback_porch;
        out[2..4].copy_from_slice(&self.width.to_le_bytes());
        out[4] = self.vfront_porch;
        out[5] = self.vback_porch;
        out[6..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..10].copy_from_slice(&fixed_8_8(self.pix_width).to_le_bytes());
        out[10..12].copy_from_slice(&fixed_8_8(self.pix_height).to_le_bytes());
        out[12..14].copy_from_slice(&self.color_matrix.raw().to_le_bytes());
        out[14] = self.vclk_delay;
        out
    }

    /// True when the capability bit is set.
    pub fn has_cap(&self, cap: u8) -> bool {
        self.extra_caps & cap != 0
    }
}

/// Convert a pixel pitch in microns to its 8.8 fixed-point wire form.
fn fixed_8_8(value: f32) -> u16 {
    (value * 256.0).round() as u16
}
