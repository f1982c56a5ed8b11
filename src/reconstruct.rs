//! Frame reconstruction for interlaced and packed sensor readouts.
//!
//! Interlaced sensors deliver each exposure as one or two raw field buffers
//! whose sample order follows the readout register, not the image. This
//! module turns those buffers back into a display-ordered image in two
//! passes:
//!
//! 1. **Weave**: scatter the field samples into a work buffer of
//!    `line_length` columns by `line_count` rows. The scatter pattern depends
//!    on the binning level because on-chip binning changes how the register
//!    drains.
//! 2. **Derotate**: the woven buffer is the sensor's transfer-register view,
//!    rotated relative to the optical image. The output pixel at row `x`,
//!    column `y` is the work sample at row `y`, column `x`.
//!
//! Every pass is a pure index permutation: each input sample lands in
//! exactly one output slot, so reconstruction is deterministic and
//! lossless. Geometry that cannot satisfy a pass's stride (odd line
//! lengths, line counts not divisible by the weave period) is rejected up
//! front rather than clamped.

use serde::{Deserialize, Serialize};

use crate::error::ReconstructError;

/// Raw readout geometry of one exposure, in transfer-register coordinates.
///
/// `line_length` is the number of samples per register line (work-buffer
/// columns); `line_count` is the number of lines (work-buffer rows). After
/// derotation the image is `line_count` wide and `line_length` tall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub line_length: usize,
    pub line_count: usize,
}

impl FrameGeometry {
    /// Samples in the full frame.
    pub fn full_samples(&self) -> usize {
        self.line_length * self.line_count
    }

    /// Samples in one field (half the frame).
    pub fn field_samples(&self) -> usize {
        self.full_samples() / 2
    }

    fn require_even_lines(&self) -> Result<(), ReconstructError> {
        if self.line_length == 0 || self.line_length % 2 != 0 {
            return Err(ReconstructError::UnsupportedGeometry(format!(
                "line length {} must be even and non-zero",
                self.line_length
            )));
        }
        Ok(())
    }

    fn require_line_count_multiple(&self, period: usize) -> Result<(), ReconstructError> {
        if self.line_count == 0 || self.line_count % period != 0 {
            return Err(ReconstructError::UnsupportedGeometry(format!(
                "line count {} must be a non-zero multiple of {period}",
                self.line_count
            )));
        }
        Ok(())
    }
}

/// Which raw field carries the even-position samples.
///
/// The two fields of an interlaced sensor arrive in read order; which one
/// belongs to the even columns (unbinned) or even rows (binned) is a fixed
/// property of the sensor wiring. Field-two-first is what the M26C-class
/// sensors do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOrder {
    /// The first-read field holds the even positions.
    Field1First,
    /// The second-read field holds the even positions.
    #[default]
    Field2First,
}

/// The raw buffers of one interlaced exposure, by binning level.
#[derive(Debug, Clone, Copy)]
pub enum InterlacedInput<'a> {
    /// Unbinned: two fields, one per column parity.
    Bin1 {
        field1: &'a [u16],
        field2: &'a [u16],
    },
    /// 2x2 binned: two fields, one per row parity.
    Bin2 {
        field1: &'a [u16],
        field2: &'a [u16],
    },
    /// 4x4 binned: the register drains as a single buffer.
    Bin4 { frame: &'a [u16] },
}

/// A display-ordered image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedImage {
    /// Pixels per row.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// Row-major samples, `width * height` of them.
    pub pixels: Vec<u16>,
}

/// Reconstruct an interlaced exposure into a display-ordered image.
pub fn reconstruct_interlaced(
    input: InterlacedInput<'_>,
    geometry: FrameGeometry,
    order: FieldOrder,
) -> Result<ReconstructedImage, ReconstructError> {
    let work = match input {
        InterlacedInput::Bin1 { field1, field2 } => {
            let (even, odd) = order_fields(order, field1, field2);
            weave_bin1(even, odd, geometry)?
        }
        InterlacedInput::Bin2 { field1, field2 } => {
            let (even, odd) = order_fields(order, field1, field2);
            weave_bin2(even, odd, geometry)?
        }
        InterlacedInput::Bin4 { frame } => weave_bin4(frame, geometry)?,
    };
    Ok(derotate(&work, geometry))
}

fn order_fields<'a>(
    order: FieldOrder,
    field1: &'a [u16],
    field2: &'a [u16],
) -> (&'a [u16], &'a [u16]) {
    match order {
        FieldOrder::Field1First => (field1, field2),
        FieldOrder::Field2First => (field2, field1),
    }
}

fn check_field_len(field: &[u16], expected: usize) -> Result<(), ReconstructError> {
    if field.len() != expected {
        return Err(ReconstructError::FieldLength {
            expected,
            actual: field.len(),
        });
    }
    Ok(())
}

/// Unbinned weave: each field supplies one column parity, four lines per
/// period, alternating register drain direction.
///
/// The register drains two lines downward and two upward per period, so the
/// line count must divide by four.
fn weave_bin1(
    even_field: &[u16],
    odd_field: &[u16],
    geometry: FrameGeometry,
) -> Result<Vec<u16>, ReconstructError> {
    geometry.require_even_lines()?;
    geometry.require_line_count_multiple(4)?;
    check_field_len(even_field, geometry.field_samples())?;
    check_field_len(odd_field, geometry.field_samples())?;

    let l = geometry.line_length;
    let c = geometry.line_count;
    let mut work = vec![0u16; geometry.full_samples()];

    for (field, col_offset) in [(even_field, 0usize), (odd_field, 1usize)] {
        for k in 0..c / 4 {
            let down_a = 4 * k;
            let down_b = 4 * k + 2;
            let up_a = c - 1 - 4 * k;
            let up_b = c - 3 - 4 * k;
            for x in (0..l).step_by(2) {
                let i = k * 2 * l + 2 * x;
                work[down_a * l + x + col_offset] = field[i];
                work[up_a * l + x + col_offset] = field[i + 1];
                work[down_b * l + x + col_offset] = field[i + 2];
                work[up_b * l + x + col_offset] = field[i + 3];
            }
        }
    }
    Ok(work)
}

/// 2x2 weave: each field supplies one row parity, samples alternating
/// between a descending and an ascending line cursor.
fn weave_bin2(
    even_field: &[u16],
    odd_field: &[u16],
    geometry: FrameGeometry,
) -> Result<Vec<u16>, ReconstructError> {
    geometry.require_even_lines()?;
    geometry.require_line_count_multiple(2)?;
    check_field_len(even_field, geometry.field_samples())?;
    check_field_len(odd_field, geometry.field_samples())?;

    let l = geometry.line_length;
    let c = geometry.line_count;
    let mut work = vec![0u16; geometry.full_samples()];

    for y in 0..c / 2 {
        for x in (0..l).step_by(2) {
            let i = y * l + x;
            work[(1 + 2 * y) * l + x + 1] = odd_field[i];
            work[(c - 1 - 2 * y) * l + x] = odd_field[i + 1];
            work[(2 * y) * l + x + 1] = even_field[i];
            work[(c - 2 - 2 * y) * l + x] = even_field[i + 1];
        }
    }
    Ok(work)
}

/// 4x4 weave: the register drains both fields as one buffer, lines
/// alternating top-down and bottom-up.
fn weave_bin4(frame: &[u16], geometry: FrameGeometry) -> Result<Vec<u16>, ReconstructError> {
    geometry.require_even_lines()?;
    geometry.require_line_count_multiple(2)?;
    check_field_len(frame, geometry.full_samples())?;

    let l = geometry.line_length;
    let c = geometry.line_count;
    let mut work = vec![0u16; geometry.full_samples()];

    for y in 0..c / 2 {
        for x in 0..l {
            let i = 2 * (y * l + x);
            work[2 * y * l + x] = frame[i];
            work[(c - 1 - 2 * y) * l + x] = frame[i + 1];
        }
    }
    Ok(work)
}

/// Transpose the work buffer into display order.
fn derotate(work: &[u16], geometry: FrameGeometry) -> ReconstructedImage {
    let l = geometry.line_length;
    let c = geometry.line_count;
    let mut pixels = vec![0u16; work.len()];
    for x in 0..l {
        for y in 0..c {
            pixels[x * c + y] = work[y * l + x];
        }
    }
    ReconstructedImage {
        width: c,
        height: l,
        pixels,
    }
}

/// Split a sample-interleaved readout into its two row halves.
///
/// Some packed progressive sensors drain two image rows per register line,
/// alternating samples. `width` and `height` are the output dimensions;
/// the input holds `width * height` samples in `height / 2` doubled lines.
pub fn deinterleave_packed(
    input: &[u16],
    width: usize,
    height: usize,
) -> Result<Vec<u16>, ReconstructError> {
    if height == 0 || height % 2 != 0 {
        return Err(ReconstructError::UnsupportedGeometry(format!(
            "packed readout needs an even row count, got {height}"
        )));
    }
    check_field_len(input, width * height)?;

    let mut out = vec![0u16; input.len()];
    for y in 0..height / 2 {
        for x in 0..width {
            let i = y * 2 * width + 2 * x;
            out[2 * y * width + x] = input[i];
            out[(2 * y + 1) * width + x] = input[i + 1];
        }
    }
    Ok(out)
}

/// Interleave two progressive field reads row by row.
///
/// The first field lands on even rows, the second on odd rows. Used by
/// interlaced guide sensors that are read one field at a time but carry no
/// register rotation.
pub fn interleave_fields(
    first: &[u16],
    second: &[u16],
    width: usize,
    height: usize,
) -> Result<Vec<u16>, ReconstructError> {
    if height == 0 || height % 2 != 0 {
        return Err(ReconstructError::UnsupportedGeometry(format!(
            "field interleave needs an even row count, got {height}"
        )));
    }
    let field_samples = width * height / 2;
    check_field_len(first, field_samples)?;
    check_field_len(second, field_samples)?;

    let mut out = vec![0u16; width * height];
    for r in 0..height / 2 {
        out[2 * r * width..(2 * r + 1) * width].copy_from_slice(&first[r * width..(r + 1) * width]);
        out[(2 * r + 1) * width..(2 * r + 2) * width]
            .copy_from_slice(&second[r * width..(r + 1) * width]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOM_4X4: FrameGeometry = FrameGeometry {
        line_length: 4,
        line_count: 4,
    };

    fn ramp(start: u16, len: usize) -> Vec<u16> {
        (start..start + len as u16).collect()
    }

    #[test]
    fn unbinned_weave_and_derotate() {
        let even = ramp(0, 8);
        let odd = ramp(8, 8);
        let image = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &even,
                field2: &odd,
            },
            GEOM_4X4,
            FieldOrder::Field1First,
        )
        .unwrap();

        assert_eq!(image.width, 4);
        assert_eq!(image.height, 4);
        #[rustfmt::skip]
        let expected = vec![
             0,  3,  2,  1,
             8, 11, 10,  9,
             4,  7,  6,  5,
            12, 15, 14, 13,
        ];
        assert_eq!(image.pixels, expected);
    }

    #[test]
    fn bin2_weave_and_derotate() {
        let field1 = ramp(0, 8);
        let field2 = ramp(8, 8);
        let image = reconstruct_interlaced(
            InterlacedInput::Bin2 {
                field1: &field1,
                field2: &field2,
            },
            GEOM_4X4,
            FieldOrder::Field2First,
        )
        .unwrap();

        #[rustfmt::skip]
        let expected = vec![
            13,  5,  9,  1,
             8,  0, 12,  4,
            15,  7, 11,  3,
            10,  2, 14,  6,
        ];
        assert_eq!(image.pixels, expected);
    }

    #[test]
    fn bin4_weave_and_derotate() {
        let frame = ramp(0, 16);
        let image = reconstruct_interlaced(
            InterlacedInput::Bin4 { frame: &frame },
            GEOM_4X4,
            FieldOrder::Field2First,
        )
        .unwrap();

        #[rustfmt::skip]
        let expected = vec![
            0,  9,  8, 1,
            2, 11, 10, 3,
            4, 13, 12, 5,
            6, 15, 14, 7,
        ];
        assert_eq!(image.pixels, expected);
    }

    #[test]
    fn reconstruction_is_a_bijection() {
        // Distinct samples in, the same multiset out: nothing lost, nothing
        // duplicated.
        let geometry = FrameGeometry {
            line_length: 8,
            line_count: 8,
        };
        let field1 = ramp(0, geometry.field_samples());
        let field2 = ramp(100, geometry.field_samples());

        for input in [
            InterlacedInput::Bin1 {
                field1: &field1,
                field2: &field2,
            },
            InterlacedInput::Bin2 {
                field1: &field1,
                field2: &field2,
            },
        ] {
            let image = reconstruct_interlaced(input, geometry, FieldOrder::Field2First).unwrap();
            let mut got = image.pixels.clone();
            got.sort_unstable();
            let mut want: Vec<u16> = field1.iter().chain(field2.iter()).copied().collect();
            want.sort_unstable();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn unbinned_weave_covers_the_last_period() {
        // Multi-period frame: the last period's ascending rows sit at the
        // very top of the work buffer, so its line indices must land exactly
        // on rows 0..4 without wrapping.
        let geometry = FrameGeometry {
            line_length: 4,
            line_count: 12,
        };
        let field1 = ramp(0, geometry.field_samples());
        let field2 = ramp(1000, geometry.field_samples());
        let image = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &field1,
                field2: &field2,
            },
            geometry,
            FieldOrder::Field2First,
        )
        .unwrap();

        let mut got = image.pixels.clone();
        got.sort_unstable();
        let mut want: Vec<u16> = field1.iter().chain(field2.iter()).copied().collect();
        want.sort_unstable();
        assert_eq!(got, want);
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let field1 = ramp(0, 8);
        let field2 = ramp(8, 8);
        let input = InterlacedInput::Bin1 {
            field1: &field1,
            field2: &field2,
        };
        let a = reconstruct_interlaced(input, GEOM_4X4, FieldOrder::Field2First).unwrap();
        let b = reconstruct_interlaced(input, GEOM_4X4, FieldOrder::Field2First).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn field_order_swaps_column_parity() {
        let field1 = ramp(0, 8);
        let field2 = ramp(8, 8);
        let first = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &field1,
                field2: &field2,
            },
            GEOM_4X4,
            FieldOrder::Field1First,
        )
        .unwrap();
        let second = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &field2,
                field2: &field1,
            },
            GEOM_4X4,
            FieldOrder::Field2First,
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn odd_geometry_is_rejected() {
        let field = ramp(0, 6);
        let err = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &field,
                field2: &field,
            },
            FrameGeometry {
                line_length: 3,
                line_count: 4,
            },
            FieldOrder::Field2First,
        )
        .unwrap_err();
        assert!(matches!(err, ReconstructError::UnsupportedGeometry(_)));

        let err = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &field,
                field2: &field,
            },
            FrameGeometry {
                line_length: 2,
                line_count: 6,
            },
            FieldOrder::Field2First,
        )
        .unwrap_err();
        assert!(matches!(err, ReconstructError::UnsupportedGeometry(_)));
    }

    #[test]
    fn wrong_field_length_is_rejected() {
        let short = ramp(0, 7);
        let ok = ramp(0, 8);
        let err = reconstruct_interlaced(
            InterlacedInput::Bin1 {
                field1: &short,
                field2: &ok,
            },
            GEOM_4X4,
            FieldOrder::Field2First,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::FieldLength {
                expected: 8,
                actual: 7
            }
        ));
    }

    #[test]
    fn packed_deinterleave_splits_doubled_lines() {
        // One register line of 8 samples carries image rows 0 and 1.
        let input: Vec<u16> = vec![0, 10, 1, 11, 2, 12, 3, 13];
        let out = deinterleave_packed(&input, 4, 2).unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 10, 11, 12, 13]);
    }

    #[test]
    fn field_interleave_alternates_rows() {
        let first = vec![0, 1, 2, 3];
        let second = vec![10, 11, 12, 13];
        let out = interleave_fields(&first, &second, 2, 4).unwrap();
        assert_eq!(out, vec![0, 1, 10, 11, 2, 3, 12, 13]);
    }
}
