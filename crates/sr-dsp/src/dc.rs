//! DC offset removal
//!
//! Per-channel highpass biquad at ~5 Hz. DC bias steals headroom and, after
//! volume scaling, turns into a constant error across every downstream
//! stage. State persists across chunks.

use crate::biquad::{BiquadCoeffs, BiquadTDF2};
use crate::{MonoProcessor, Processor, Sample};

/// Cutoff of the DC removal highpass.
const DC_CUTOFF_HZ: f64 = 5.0;

/// DC removal filter for one channel.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    filter: BiquadTDF2,
}

impl DcBlocker {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            filter: BiquadTDF2::with_coeffs(BiquadCoeffs::highpass(
                DC_CUTOFF_HZ,
                0.707,
                sample_rate,
            )),
        }
    }
}

impl Processor for DcBlocker {
    fn reset(&mut self) {
        self.filter.reset();
    }
}

impl MonoProcessor for DcBlocker {
    #[inline(always)]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.filter.process_sample(input)
    }
}
