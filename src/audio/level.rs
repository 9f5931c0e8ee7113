//! Microphone level estimation for the live meter
//!
//! Mirrors a browser analyser node: the latest window of samples is
//! Blackman-windowed, transformed, mapped from [-100 dB, -30 dB] to [0, 1]
//! per bin and averaged.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Frequency-domain volume estimator
pub struct LevelMeter {
    fft_size: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
}

impl LevelMeter {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            window: blackman_window(fft_size),
            fft,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Normalized level (0.0 - 1.0) of the most recent `fft_size` samples
    ///
    /// Shorter frames are zero-padded at the front.
    pub fn measure(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }

        let frame = &frame[frame.len().saturating_sub(self.fft_size)..];
        let pad = self.fft_size - frame.len();

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { frame[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.buffer);

        let bins = self.fft_size / 2;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let total: f32 = self.buffer[..bins]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / self.fft_size as f32;
                let db = if magnitude > 1e-10 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DECIBELS
                };
                ((db - MIN_DECIBELS) / range).clamp(0.0, 1.0)
            })
            .sum();

        (total / bins as f32).clamp(0.0, 1.0)
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    let denom = (size - 1) as f32;
    (0..size)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / denom;
            0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
        })
        .collect()
}
