//! Polyphase windowed-sinc resampling
//!
//! One resampler instance per channel. Upsampling and downsampling use
//! distinct constructions: the downsampler carries a longer kernel and
//! moves its cutoff to the output Nyquist to anti-alias before decimation.
//! State persists across packets; latency is half the kernel length in
//! input samples, constant per configuration.

use crate::Sample;

/// Kernel length of the upsampling path.
const UP_TAPS: usize = 64;

/// Kernel length of the downsampling path. Longer, since the whole input
/// band above the output Nyquist must be attenuated.
const DOWN_TAPS: usize = 96;

/// Phase-table resolution; fractional positions blend adjacent rows.
const PHASES: usize = 128;

/// Kaiser window beta (roughly 90 dB stopband).
const KAISER_BETA: f64 = 9.2;

/// Cutoff as a fraction of the limiting Nyquist.
const ROLLOFF: f64 = 0.936;

/// Streaming polyphase resampler for one channel.
#[derive(Debug, Clone)]
pub struct SincResampler {
    /// Input samples consumed per output sample.
    step: f64,
    taps: usize,
    half: usize,
    /// (PHASES + 1) rows of `taps` coefficients.
    table: Vec<f64>,
    /// Sliding input window; the front `half` entries prime the filter.
    buffer: Vec<f64>,
    /// Fractional read position into `buffer`.
    pos: f64,
}

impl SincResampler {
    /// Resampler for `input_rate < output_rate`.
    pub fn upsampler(input_rate: u32, output_rate: u32) -> Self {
        Self::build(input_rate, output_rate, UP_TAPS)
    }

    /// Resampler for `input_rate > output_rate`.
    pub fn downsampler(input_rate: u32, output_rate: u32) -> Self {
        Self::build(input_rate, output_rate, DOWN_TAPS)
    }

    /// Pick the construction matching the rate direction.
    pub fn for_rates(input_rate: u32, output_rate: u32) -> Self {
        if input_rate < output_rate {
            Self::upsampler(input_rate, output_rate)
        } else {
            Self::downsampler(input_rate, output_rate)
        }
    }

    fn build(input_rate: u32, output_rate: u32, taps: usize) -> Self {
        let half = taps / 2;
        let ratio = output_rate as f64 / input_rate as f64;
        // Cutoff in cycles per input sample, pulled down to the output
        // Nyquist when decimating.
        let fc = 0.5 * ratio.min(1.0) * ROLLOFF;

        let mut table = vec![0.0; (PHASES + 1) * taps];
        for phase in 0..=PHASES {
            let frac = phase as f64 / PHASES as f64;
            let row = &mut table[phase * taps..(phase + 1) * taps];
            let mut sum = 0.0;
            for (j, coeff) in row.iter_mut().enumerate() {
                let d = j as f64 - half as f64 + 1.0 - frac;
                let window = kaiser(d / half as f64, KAISER_BETA);
                *coeff = 2.0 * fc * sinc(2.0 * fc * d) * window;
                sum += *coeff;
            }
            // Unity DC gain per phase.
            for coeff in row.iter_mut() {
                *coeff /= sum;
            }
        }

        Self {
            step: input_rate as f64 / output_rate as f64,
            taps,
            half,
            table,
            buffer: vec![0.0; half],
            pos: (half - 1) as f64,
        }
    }

    /// Latency in input samples.
    pub fn latency(&self) -> usize {
        self.half
    }

    /// Feed a block of input and append all producible output samples.
    pub fn process(&mut self, input: &[Sample], output: &mut Vec<Sample>) {
        self.buffer.extend_from_slice(input);

        loop {
            let i0 = self.pos as usize;
            if i0 + self.half >= self.buffer.len() {
                break;
            }
            output.push(self.interpolate(i0));
            self.pos += self.step;
        }

        // Compact consumed history, keeping the filter's look-back window.
        let i0 = self.pos as usize;
        if i0 >= self.half + 4096 {
            let drop = i0 - (self.half - 1);
            self.buffer.drain(..drop);
            self.pos -= drop as f64;
        }
    }

    #[inline]
    fn interpolate(&self, i0: usize) -> Sample {
        let frac = self.pos - i0 as f64;
        let x = frac * PHASES as f64;
        let p0 = x as usize;
        let blend = x - p0 as f64;

        let row0 = &self.table[p0 * self.taps..(p0 + 1) * self.taps];
        let row1 = &self.table[(p0 + 1) * self.taps..(p0 + 2) * self.taps];
        let start = i0 + 1 - self.half;

        let mut acc = 0.0;
        for j in 0..self.taps {
            let coeff = row0[j] + (row1[j] - row0[j]) * blend;
            acc += self.buffer[start + j] * coeff;
        }
        acc
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer.resize(self.half, 0.0);
        self.pos = (self.half - 1) as f64;
    }
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Kaiser window over x in [-1, 1].
fn kaiser(x: f64, beta: f64) -> f64 {
    let arg = 1.0 - x * x;
    if arg <= 0.0 {
        return 0.0;
    }
    bessel_i0(beta * arg.sqrt()) / bessel_i0(beta)
}

/// Modified Bessel function I0 (for the Kaiser window)
fn bessel_i0(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 3.75 {
        let y = (x / 3.75).powi(2);
        1.0 + y
            * (3.5156229
                + y * (3.0899424
                    + y * (1.2067492 + y * (0.2659732 + y * (0.0360768 + y * 0.0045813)))))
    } else {
        let y = 3.75 / ax;
        (ax.exp() / ax.sqrt())
            * (0.39894228
                + y * (0.01328592
                    + y * (0.00225319
                        + y * (-0.00157565
                            + y * (0.00916281
                                + y * (-0.02057706
                                    + y * (0.02635537
                                        + y * (-0.01647633 + y * 0.00392377))))))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(resampler: &mut SincResampler, input: &[f64]) -> Vec<f64> {
        let mut out = Vec::new();
        resampler.process(input, &mut out);
        out
    }

    #[test]
    fn output_count_follows_ratio() {
        let mut rs = SincResampler::upsampler(44100, 48000);
        let input = vec![0.0; 44100];
        let out = run(&mut rs, &input);
        let expected = 48000.0;
        assert!(
            (out.len() as f64 - expected).abs() < 200.0,
            "got {} outputs",
            out.len()
        );
    }

    #[test]
    fn dc_preserved() {
        let mut rs = SincResampler::upsampler(44100, 48000);
        let out = run(&mut rs, &vec![0.5; 8000]);
        // Skip the priming transient.
        for &v in &out[1000..] {
            assert!((v - 0.5).abs() < 1e-6, "DC drifted to {v}");
        }
    }

    #[test]
    fn sine_amplitude_preserved_upsample() {
        let mut rs = SincResampler::upsampler(44100, 48000);
        let input: Vec<f64> = (0..44100)
            .map(|i| (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 44100.0).sin())
            .collect();
        let out = run(&mut rs, &input);
        let peak = out[4800..].iter().fold(0.0f64, |m, &v| m.max(v.abs()));
        assert!((peak - 1.0).abs() < 0.01, "peak {peak}");
    }

    #[test]
    fn downsample_rejects_above_output_nyquist() {
        let mut rs = SincResampler::downsampler(96000, 48000);
        // 30 kHz tone is inaudible at 48 kHz output and must be attenuated.
        let input: Vec<f64> = (0..96000)
            .map(|i| (2.0 * std::f64::consts::PI * 30000.0 * i as f64 / 96000.0).sin())
            .collect();
        let out = run(&mut rs, &input);
        let peak = out[4800..].iter().fold(0.0f64, |m, &v| m.max(v.abs()));
        assert!(peak < 0.01, "aliased energy {peak}");
    }

    #[test]
    fn white_noise_level_survives_upsampling() {
        use rand::Rng;
        let mut rng = rand::rng();
        let input: Vec<f64> = (0..44100).map(|_| rng.random_range(-0.5..0.5)).collect();
        let in_rms = (input.iter().map(|v| v * v).sum::<f64>() / input.len() as f64).sqrt();

        let mut rs = SincResampler::upsampler(44100, 48000);
        let out = run(&mut rs, &input);
        let body = &out[4800..];
        let out_rms = (body.iter().map(|v| v * v).sum::<f64>() / body.len() as f64).sqrt();

        // The kernel cuts the top few percent of the input band, so a
        // little energy loss is expected.
        let ratio = out_rms / in_rms;
        assert!(
            (0.90..=1.02).contains(&ratio),
            "noise level ratio {ratio} out of range"
        );
    }

    #[test]
    fn streaming_matches_oneshot() {
        let input: Vec<f64> = (0..4410)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 44100.0).sin())
            .collect();

        let mut whole = SincResampler::upsampler(44100, 48000);
        let oneshot = run(&mut whole, &input);

        let mut chunked = SincResampler::upsampler(44100, 48000);
        let mut streamed = Vec::new();
        for chunk in input.chunks(288) {
            chunked.process(chunk, &mut streamed);
        }

        assert_eq!(oneshot.len(), streamed.len());
        for (a, b) in oneshot.iter().zip(streamed.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
