//! The per-source DSP pipeline
//!
//! Stages, in order: widen to i32, DC removal, volume with soft clip,
//! resample, channel remix through the 8x8 matrix, graphic EQ, then merge
//! and dither down to the output bit depth. Stage state persists across
//! packets. When the configuration is identity-equivalent the chain reduces
//! to the exact widening step, so a passthrough path is bit-transparent.

use std::collections::HashMap;

use sr_core::{AudioFormat, CoreResult, EQ_BANDS, MAX_CHANNELS, SpeakerLayout};

use crate::convert::{i32_to_sample, widen_to_i32};
use crate::dc::DcBlocker;
use crate::dither::NoiseShaper;
use crate::eq::GraphicEq;
use crate::resampler::SincResampler;
use crate::volume::apply_volume;
use crate::{MonoProcessor, Sample};

/// Full processing pipeline from one input format to one output format.
pub struct DspChain {
    input_format: AudioFormat,
    output_format: AudioFormat,
    volume: f32,
    eq_gains: [f32; EQ_BANDS],
    layouts: HashMap<u8, SpeakerLayout>,

    dc: Vec<DcBlocker>,
    resamplers: Option<Vec<SincResampler>>,
    eq: Vec<GraphicEq>,
    shapers: Vec<NoiseShaper>,
    matrix: [[f32; MAX_CHANNELS]; MAX_CHANNELS],
    matrix_identity: bool,

    /// True when any stage beyond widening has work to do.
    processing_required: bool,
    /// DC removal runs only when a conversion stage is active, so a pure
    /// volume path stays sample-exact.
    dc_active: bool,

    wide: Vec<i32>,
    in_ch: Vec<Vec<Sample>>,
    rs_ch: Vec<Vec<Sample>>,
    out_ch: Vec<Vec<Sample>>,
}

impl DspChain {
    pub fn new(
        input_format: AudioFormat,
        output_format: AudioFormat,
        volume: f32,
        eq_gains: [f32; EQ_BANDS],
        layouts: HashMap<u8, SpeakerLayout>,
    ) -> CoreResult<Self> {
        input_format.validate()?;
        output_format.validate()?;

        let mut chain = Self {
            input_format,
            output_format,
            volume,
            eq_gains,
            layouts,
            dc: Vec::new(),
            resamplers: None,
            eq: Vec::new(),
            shapers: Vec::new(),
            matrix: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
            matrix_identity: false,
            processing_required: false,
            dc_active: false,
            wide: Vec::new(),
            in_ch: Vec::new(),
            rs_ch: Vec::new(),
            out_ch: Vec::new(),
        };
        chain.rebuild();
        Ok(chain)
    }

    pub fn input_format(&self) -> AudioFormat {
        self.input_format
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output_format
    }

    pub fn processing_required(&self) -> bool {
        self.processing_required
    }

    /// Swap the input format, rebuilding per-channel state. The target
    /// output format is kept. Returns an error and leaves the chain
    /// untouched when the new format is invalid.
    pub fn reconfigure_input(&mut self, input_format: AudioFormat) -> CoreResult<()> {
        input_format.validate()?;
        self.input_format = input_format;
        self.rebuild();
        log::debug!(
            "dsp chain rebuilt: {}ch/{}Hz -> {}ch/{}Hz, processing {}",
            self.input_format.channels,
            self.input_format.sample_rate,
            self.output_format.channels,
            self.output_format.sample_rate,
            if self.processing_required { "active" } else { "bypassed" }
        );
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.max(0.0);
        self.refresh_flags();
    }

    pub fn set_eq_gains(&mut self, gains: [f32; EQ_BANDS]) {
        self.eq_gains = gains;
        for eq in &mut self.eq {
            eq.set_gains(gains);
        }
        self.refresh_flags();
    }

    /// Replace the layout for one input-channel-count key. Only affects the
    /// active matrix when the key matches the current input channel count.
    pub fn set_layout_for_key(&mut self, key: u8, layout: SpeakerLayout) {
        self.layouts.insert(key, layout);
        self.rebuild_matrix();
        self.refresh_flags();
    }

    pub fn set_layouts_map(&mut self, layouts: HashMap<u8, SpeakerLayout>) {
        self.layouts = layouts;
        self.rebuild_matrix();
        self.refresh_flags();
    }

    fn rebuild(&mut self) {
        let in_ch = self.input_format.channels as usize;
        let out_ch = self.output_format.channels as usize;
        let out_rate = self.output_format.sample_rate as f64;

        self.dc = (0..in_ch)
            .map(|_| DcBlocker::new(self.input_format.sample_rate as f64))
            .collect();

        self.resamplers = if self.input_format.sample_rate != self.output_format.sample_rate {
            Some(
                (0..in_ch)
                    .map(|_| {
                        SincResampler::for_rates(
                            self.input_format.sample_rate,
                            self.output_format.sample_rate,
                        )
                    })
                    .collect(),
            )
        } else {
            None
        };

        self.eq = (0..out_ch).map(|_| GraphicEq::new(out_rate)).collect();
        for eq in &mut self.eq {
            eq.set_gains(self.eq_gains);
        }
        self.shapers = (0..out_ch)
            .map(|_| NoiseShaper::new(self.output_format.bit_depth))
            .collect();

        self.in_ch = vec![Vec::new(); in_ch];
        self.rs_ch = vec![Vec::new(); in_ch];
        self.out_ch = vec![Vec::new(); out_ch];

        self.rebuild_matrix();
        self.refresh_flags();
    }

    fn rebuild_matrix(&mut self) {
        let in_ch = self.input_format.channels as usize;
        let out_ch = self.output_format.channels as usize;
        let layout = self
            .layouts
            .get(&self.input_format.channels)
            .copied()
            .unwrap_or_else(SpeakerLayout::auto);
        self.matrix = layout.effective_matrix(in_ch, out_ch);

        self.matrix_identity = in_ch == out_ch && {
            let mut identity = true;
            for r in 0..out_ch {
                for c in 0..in_ch {
                    let want = if r == c { 1.0 } else { 0.0 };
                    if (self.matrix[r][c] - want).abs() > 1e-6 {
                        identity = false;
                    }
                }
            }
            identity
        };
    }

    fn refresh_flags(&mut self) {
        let format_conversion = self.input_format.sample_rate != self.output_format.sample_rate
            || self.input_format.bit_depth != self.output_format.bit_depth
            || self.input_format.channels != self.output_format.channels;
        let eq_active = self.eq_gains.iter().any(|&g| g != 1.0);
        let remix = !self.matrix_identity;

        self.dc_active = format_conversion || remix || eq_active;
        self.processing_required = self.dc_active || self.volume != 1.0;
    }

    /// Run one 1152-byte payload through the chain, appending interleaved
    /// i32 output samples. The output length varies while a resampler is
    /// converging on a rational rate ratio; the caller chunks it.
    pub fn process_packet(&mut self, payload: &[u8], out: &mut Vec<i32>) -> CoreResult<()> {
        widen_to_i32(payload, self.input_format.bit_depth, &mut self.wide)?;

        if !self.processing_required {
            out.extend_from_slice(&self.wide);
            return Ok(());
        }

        let in_ch = self.input_format.channels as usize;
        let out_ch = self.output_format.channels as usize;
        let frames = self.wide.len() / in_ch;

        // Split into normalized per-channel buffers.
        for (c, ch) in self.in_ch.iter_mut().enumerate() {
            ch.clear();
            ch.extend((0..frames).map(|n| i32_to_sample(self.wide[n * in_ch + c])));
        }

        if self.dc_active {
            for (blocker, ch) in self.dc.iter_mut().zip(self.in_ch.iter_mut()) {
                blocker.process_block(ch);
            }
        }

        if self.volume != 1.0 {
            for ch in self.in_ch.iter_mut() {
                apply_volume(ch, self.volume as f64);
            }
        }

        let src: &[Vec<Sample>] = if let Some(resamplers) = self.resamplers.as_mut() {
            for (rs, (input, resampled)) in resamplers
                .iter_mut()
                .zip(self.in_ch.iter().zip(self.rs_ch.iter_mut()))
            {
                resampled.clear();
                rs.process(input, resampled);
            }
            &self.rs_ch
        } else {
            &self.in_ch
        };
        let out_frames = src.first().map_or(0, Vec::len);

        // Remix into output channels.
        if self.matrix_identity {
            for (o, ch) in self.out_ch.iter_mut().enumerate() {
                ch.clear();
                ch.extend_from_slice(&src[o]);
            }
        } else {
            for (o, ch) in self.out_ch.iter_mut().enumerate() {
                ch.clear();
                ch.resize(out_frames, 0.0);
                for (i, input) in src.iter().enumerate().take(in_ch) {
                    let coeff = self.matrix[o][i] as f64;
                    if coeff == 0.0 {
                        continue;
                    }
                    for (acc, &s) in ch.iter_mut().zip(input.iter()) {
                        *acc += coeff * s;
                    }
                }
            }
        }

        if self.eq_gains.iter().any(|&g| g != 1.0) {
            for (eq, ch) in self.eq.iter_mut().zip(self.out_ch.iter_mut()) {
                eq.process_block(ch);
            }
        }

        // Merge and quantize onto the output grid.
        out.reserve(out_frames * out_ch);
        for n in 0..out_frames {
            for (shaper, ch) in self.shapers.iter_mut().zip(self.out_ch.iter()) {
                out.push(shaper.process(ch[n]));
            }
        }

        Ok(())
    }
}
