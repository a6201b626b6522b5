//! Bit-depth reduction with TPDF dither and noise shaping
//!
//! Quantizes normalized samples onto the grid of the target bit depth
//! (expressed in the full-scale i32 domain) with triangular-PDF dither and
//! a first-order error-feedback shaper. One instance per channel; the error
//! state persists across chunks.

use crate::Sample;
use crate::convert::I32_FULL_SCALE;

/// TPDF dither + first-order noise shaping for one channel.
#[derive(Debug, Clone)]
pub struct NoiseShaper {
    /// Quantization step in the i32 domain (1 LSB at the target depth).
    quant_step: f64,
    /// Previous quantization error, fed back into the next sample.
    err: f64,
    /// xorshift64 state.
    rng_state: u64,
}

impl NoiseShaper {
    pub fn new(target_bits: u8) -> Self {
        let shift = 32u32.saturating_sub(target_bits as u32);
        Self {
            quant_step: (1u64 << shift) as f64,
            err: 0.0,
            rng_state: 0x853c49e6748fea9b,
        }
    }

    /// Fast xorshift64 random in [-1, 1].
    #[inline(always)]
    fn next_rand(&mut self) -> f64 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        let r = self.rng_state.wrapping_mul(0x2545F4914F6CDD1D);
        (r as i64 as f64) / (i64::MAX as f64)
    }

    /// Quantize one normalized sample to a full-scale i32 aligned to the
    /// target depth.
    #[inline]
    pub fn process(&mut self, input: Sample) -> i32 {
        let v = input * I32_FULL_SCALE;
        let target = v - self.err;

        let tpdf = (self.next_rand() + self.next_rand()) * 0.5 * self.quant_step;
        let q = ((target + tpdf) / self.quant_step).round() * self.quant_step;

        self.err = q - target;

        q.clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }

    pub fn reset(&mut self) {
        self.err = 0.0;
    }
}
