use serde::{Deserialize, Serialize};

/// First order lowpass filter
///
/// Fixed-point single pole IIR with the cutoff set by `alpha`
/// (`1 << 15` being unity). The first sample seeds the state so the
/// filter starts on the signal instead of slewing up from zero. The
/// half-up rounding keeps the output from sticking one LSB below a
/// constant input.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Lowpass {
    /// Filter coefficient, `1 << 15` is unity gain.
    pub alpha: i32,
    y: Option<i32>,
}

impl Lowpass {
    pub fn new(alpha: i32) -> Self {
        Self { alpha, y: None }
    }

    /// Clear the filter state. The next sample seeds it again.
    pub fn reset(&mut self) {
        self.y = None;
    }

    /// Update the filter with a new sample.
    pub fn update(&mut self, x: i32) -> i32 {
        let y = match self.y {
            None => x,
            Some(y) => {
                let scaled = self.alpha.wrapping_mul(x.wrapping_sub(y)) >> 15;
                y.wrapping_add(scaled >> 1).wrapping_add(scaled & 1)
            }
        };
        self.y = Some(y);
        y
    }
}
