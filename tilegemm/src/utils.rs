use divrem::DivCeil;
use std::fmt;

/// Integer division rounding toward positive infinity.
pub fn ceil_div(a: u32, b: u32) -> u32 {
    DivCeil::div_ceil(a, b)
}

pub fn ceil_div_u64(a: u64, b: u64) -> u64 {
    DivCeil::div_ceil(a, b)
}

/// Round `a` up to the next multiple of `align`.
pub fn round_up(a: u32, align: u32) -> u32 {
    ceil_div(a, align) * align
}

pub fn round_up_u64(a: u64, align: u64) -> u64 {
    ceil_div_u64(a, align) * align
}

pub fn round_down(a: u32, align: u32) -> u32 {
    a / align * align
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Wraps a byte slice so it is displayed as lowercase hex in groups of eight bytes.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(8).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            for b in chunk {
                write!(f, "{b:02x}")?;
            }
        }
        Ok(())
    }
}
