use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_FRAME_LEN: usize = 1024;
pub const DEFAULT_TOP_FREQUENCIES: usize = 5;

/// Linear magnitude spectrum of one analysis frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub magnitudes: Vec<f32>,
    /// Width of one bin in Hz; bin `i` is centred on `i * bin_hz`.
    pub bin_hz: f32,
}

impl Spectrum {
    pub fn frequency_of(&self, bin: usize) -> f32 {
        bin as f32 * self.bin_hz
    }

    pub fn magnitude_sum(&self) -> f32 {
        self.magnitudes.iter().sum()
    }

    pub fn is_silent(&self) -> bool {
        self.magnitude_sum() <= 0.0
    }

    /// Magnitude-weighted mean frequency in Hz, or 0 for a silent frame.
    pub fn centroid(&self) -> f32 {
        let mut magnitude_sum = 0.0;
        let mut weighted_sum = 0.0;
        for (i, magnitude) in self.magnitudes.iter().enumerate() {
            magnitude_sum += magnitude;
            weighted_sum += magnitude * self.frequency_of(i);
        }

        if magnitude_sum <= 0.0 {
            0.0
        } else {
            weighted_sum / magnitude_sum
        }
    }

    /// Up to `top_n` bin frequencies ordered by descending magnitude. Zero
    /// bins never qualify; equal magnitudes keep the lower frequency first.
    pub fn dominant_frequencies(&self, top_n: usize) -> Vec<f32> {
        let mut bins: Vec<(usize, f32)> = self
            .magnitudes
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, magnitude)| *magnitude > 0.0)
            .collect();
        bins.sort_by(|a, b| b.1.total_cmp(&a.1));

        bins.into_iter()
            .take(top_n)
            .map(|(bin, _)| self.frequency_of(bin))
            .collect()
    }
}

/// Spectrum plus the scalar features derived from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralProfile {
    pub spectrum: Spectrum,
    pub centroid_hz: f32,
    pub dominant_hz: Vec<f32>,
}

/// Windowed FFT front end with a fixed frame length.
///
/// Frames are normalised before analysis: shorter frames are zero-padded at
/// the end, longer frames keep only their first `frame_len` samples, and
/// non-finite samples are replaced by silence. The analyzer holds only
/// immutable state (window coefficients and the FFT plan), so it can be
/// shared between threads and every call is independent of the previous one.
#[derive(Clone)]
pub struct SpectralAnalyzer {
    sample_rate: u32,
    frame_len: usize,
    window: Arc<[f32]>,
    plan: Arc<dyn RealToComplex<f32>>,
}

impl SpectralAnalyzer {
    /// Creates an analyzer with the default 1024-sample frame.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_frame_len(sample_rate, DEFAULT_FRAME_LEN)
    }

    /// Creates an analyzer for `frame_len`-sample frames. Lengths below two
    /// samples are raised to two.
    pub fn with_frame_len(sample_rate: u32, frame_len: usize) -> Self {
        let frame_len = frame_len.max(2);
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(frame_len);
        let window: Vec<f32> = (0..frame_len).map(|i| hann_value(i, frame_len)).collect();

        Self {
            sample_rate: sample_rate.max(1),
            frame_len,
            window: window.into(),
            plan,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn bin_count(&self) -> usize {
        self.frame_len / 2 + 1
    }

    pub fn bin_hz(&self) -> f32 {
        self.sample_rate as f32 / self.frame_len as f32
    }

    /// Pads, truncates and sanitises `frame` to exactly `frame_len` samples.
    pub fn prepare_frame(&self, frame: &[f32]) -> Vec<f32> {
        let mut prepared: Vec<f32> = frame
            .iter()
            .take(self.frame_len)
            .map(|sample| if sample.is_finite() { *sample } else { 0.0 })
            .collect();
        prepared.resize(self.frame_len, 0.0);
        prepared
    }

    /// Hann-windowed magnitude spectrum of `frame`.
    pub fn analyze(&self, frame: &[f32]) -> Result<Spectrum> {
        let mut input = self.prepare_frame(frame);
        for (sample, weight) in input.iter_mut().zip(self.window.iter()) {
            *sample *= weight;
        }

        let mut output = self.plan.make_output_vec();
        let mut scratch = self.plan.make_scratch_vec();
        self.plan
            .process_with_scratch(&mut input, &mut output, &mut scratch)?;

        Ok(Spectrum {
            magnitudes: output.iter().map(|bin| bin.norm()).collect(),
            bin_hz: self.bin_hz(),
        })
    }

    pub fn spectral_centroid(&self, frame: &[f32]) -> Result<f32> {
        Ok(self.analyze(frame)?.centroid())
    }

    pub fn dominant_frequencies(&self, frame: &[f32], top_n: usize) -> Result<Vec<f32>> {
        Ok(self.analyze(frame)?.dominant_frequencies(top_n))
    }

    /// Runs one transform and derives every feature from it.
    pub fn profile(&self, frame: &[f32], top_n: usize) -> Result<SpectralProfile> {
        let spectrum = self.analyze(frame)?;
        Ok(SpectralProfile {
            centroid_hz: spectrum.centroid(),
            dominant_hz: spectrum.dominant_frequencies(top_n),
            spectrum,
        })
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("frame_len", &self.frame_len)
            .finish()
    }
}

/// Cosine similarity of two magnitude spectra over their common prefix.
/// Returns 0 when either side carries no energy.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a[..len].iter().zip(&b[..len]) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    } else {
        0.0
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 48_000;

    fn sine(frequency: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn silent_frame_has_zero_centroid() {
        let analyzer = SpectralAnalyzer::new(SAMPLE_RATE);
        let centroid = analyzer.spectral_centroid(&[0.0; 1024]).unwrap();
        assert_eq!(centroid, 0.0);
        assert!(analyzer.dominant_frequencies(&[0.0; 1024], 5).unwrap().is_empty());
    }

    #[test]
    fn finds_the_dominant_tone() {
        let analyzer = SpectralAnalyzer::new(SAMPLE_RATE);
        // Bin 20 at 46.875 Hz per bin.
        let tone = 20.0 * analyzer.bin_hz();
        let frame = sine(tone, 0.8, 1024);

        let dominant = analyzer.dominant_frequencies(&frame, 3).unwrap();
        assert_eq!(dominant.len(), 3);
        assert!((dominant[0] - tone).abs() < analyzer.bin_hz() * 0.5);

        let centroid = analyzer.spectral_centroid(&frame).unwrap();
        assert!((centroid - tone).abs() < analyzer.bin_hz() * 2.0);
    }

    #[test]
    fn brighter_frames_have_higher_centroids() {
        let analyzer = SpectralAnalyzer::new(SAMPLE_RATE);
        let low = analyzer.spectral_centroid(&sine(200.0, 0.5, 1024)).unwrap();
        let high = analyzer.spectral_centroid(&sine(6_000.0, 0.5, 1024)).unwrap();
        assert!(high > low);
    }

    #[test]
    fn pads_and_truncates_deterministically() {
        let analyzer = SpectralAnalyzer::with_frame_len(SAMPLE_RATE, 8);

        let short = analyzer.prepare_frame(&[1.0, f32::NAN, 0.5]);
        assert_eq!(short, vec![1.0, 0.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let long: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(analyzer.prepare_frame(&long), long[..8].to_vec());

        let spectrum = analyzer.analyze(&long).unwrap();
        assert_eq!(spectrum.magnitudes.len(), analyzer.bin_count());
        assert_eq!(spectrum, analyzer.analyze(&long[..8]).unwrap());
    }

    #[test]
    fn returns_fewer_frequencies_than_requested_when_spectrum_is_sparse() {
        let spectrum = Spectrum {
            magnitudes: vec![0.0, 3.0, 0.0, 1.0, 3.0],
            bin_hz: 10.0,
        };
        assert_eq!(spectrum.dominant_frequencies(10), vec![10.0, 40.0, 30.0]);
        assert_eq!(spectrum.dominant_frequencies(1), vec![10.0]);
    }

    #[test]
    fn cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0, 9.0], &[1.0, 1.0]) - 1.0).abs() < 1e-6);
    }
}
