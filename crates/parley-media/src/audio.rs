//! Audio frame decoding and sample conversions.
//!
//! Inbound frames are normalized to mono `f32` in [-1, 1], gained, clipped,
//! resampled to the recognizer rate, and finally quantized to 16-bit PCM
//! for buffering.

use parley_core::error::{AgentError, Result};

/// Sample encoding of a raw frame payload. All encodings are little-endian
/// and interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }
}

/// A raw audio frame as handed over by the media transport.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn from_i16(samples: &[i16], sample_rate: u32, channels: u16) -> Self {
        Self {
            data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            format: SampleFormat::S16,
            sample_rate,
            channels,
        }
    }

    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        Self {
            data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            format: SampleFormat::F32,
            sample_rate,
            channels,
        }
    }

    /// Samples per channel carried by this frame.
    pub fn samples_per_channel(&self) -> usize {
        let stride = self.format.bytes_per_sample() * self.channels.max(1) as usize;
        self.data.len() / stride
    }
}

/// Decode a frame into interleaved `f32` samples in [-1, 1].
pub fn decode(frame: &AudioFrame) -> Result<Vec<f32>> {
    if frame.channels == 0 {
        return Err(AgentError::AudioDecode("frame has zero channels".into()));
    }
    if frame.sample_rate == 0 {
        return Err(AgentError::AudioDecode("frame has zero sample rate".into()));
    }
    let stride = frame.format.bytes_per_sample() * frame.channels as usize;
    if frame.data.is_empty() || frame.data.len() % stride != 0 {
        return Err(AgentError::AudioDecode(format!(
            "payload of {} bytes is not a whole number of {:?} x{} samples",
            frame.data.len(),
            frame.format,
            frame.channels
        )));
    }

    let samples = match frame.format {
        SampleFormat::S16 => frame
            .data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleFormat::S32 => frame
            .data
            .chunks_exact(4)
            .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2_147_483_648.0) as f32)
            .collect(),
        SampleFormat::F32 => {
            let mut samples: Vec<f32> = frame
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if samples.iter().any(|s| !s.is_finite()) {
                return Err(AgentError::AudioDecode("non-finite float sample".into()));
            }
            // Float frames carrying integer-scaled values.
            if samples.iter().any(|s| s.abs() > 1.0) {
                for s in &mut samples {
                    *s /= 32768.0;
                }
            }
            samples
        }
    };

    Ok(samples)
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks_exact(n)
        .map(|c| c.iter().sum::<f32>() / n as f32)
        .collect()
}

/// Multiply by `gain` and hard-clip to [-1, 1].
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    for s in samples {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

/// Linear-interpolation resampler.
///
/// The output length is `floor(len * to / from)`; output sample `i` sits at
/// source position `i * (len - 1) / (out_len - 1)`, so both endpoints are
/// preserved.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    match out_len {
        0 => Vec::new(),
        1 => vec![samples[0]],
        _ => {
            let step = (samples.len() - 1) as f64 / (out_len - 1) as f64;
            (0..out_len)
                .map(|i| {
                    let pos = i as f64 * step;
                    let idx = pos.floor() as usize;
                    let frac = (pos - idx as f64) as f32;
                    match samples.get(idx + 1) {
                        Some(&next) => samples[idx] + (next - samples[idx]) * frac,
                        None => samples[samples.len() - 1],
                    }
                })
                .collect()
        }
    }
}

/// Resample 16-bit PCM via the float resampler.
pub fn resample_pcm(pcm: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to {
        return pcm.to_vec();
    }
    let floats: Vec<f32> = pcm.iter().map(|&s| s as f32).collect();
    resample_linear(&floats, from, to)
        .into_iter()
        .map(|s| s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Quantize [-1, 1] floats to 16-bit PCM.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// 16-bit PCM back to [-1, 1] floats.
pub fn to_f32(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| s as f32 / 32767.0).collect()
}

/// Root-mean-square energy of normalized samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Little-endian bytes to 16-bit samples. A trailing odd byte is ignored.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Encode 16-bit interleaved PCM as a canonical 44-byte-header WAV file.
pub fn encode_wav(pcm: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    const BITS: u16 = 16;
    let block_align = channels * BITS / 8;
    let data_len = (pcm.len() * 2) as u32;

    let mut out = Vec::with_capacity(44 + pcm.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend(pcm.iter().flat_map(|s| s.to_le_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_decode_s16_normalizes() {
        let frame = AudioFrame::from_i16(&[0, 16384, -32768, 32767], 48_000, 1);
        let samples = decode(&frame).unwrap();
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.5).abs() < 1e-6);
        assert_eq!(samples[2], -1.0);
        assert!(samples[3] < 1.0);
    }

    #[test]
    fn test_decode_integer_scaled_floats() {
        let frame = AudioFrame::from_f32(&[16384.0, -8192.0], 48_000, 1);
        let samples = decode(&frame).unwrap();
        assert!((samples[0] - 0.5).abs() < 1e-6);
        assert!((samples[1] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_ragged_payload() {
        let frame = AudioFrame {
            data: vec![0, 1, 2],
            format: SampleFormat::S16,
            sample_rate: 48_000,
            channels: 1,
        };
        assert!(matches!(decode(&frame), Err(AgentError::AudioDecode(_))));

        let stereo = AudioFrame::from_i16(&[1, 2, 3], 48_000, 2);
        assert!(decode(&stereo).is_err());

        let empty = AudioFrame::from_i16(&[], 48_000, 1);
        assert!(decode(&empty).is_err());
    }

    #[test]
    fn test_downmix_averages_channels() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn test_gain_clips() {
        let mut samples = vec![0.1, 0.5, -0.6];
        apply_gain(&mut samples, 3.0);
        assert!((samples[0] - 0.3).abs() < 1e-6);
        assert_eq!(samples[1], 1.0);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn test_resample_lengths() {
        assert_eq!(resample_linear(&vec![0.0; 960], 48_000, 16_000).len(), 320);
        assert_eq!(resample_linear(&vec![0.0; 320], 16_000, 48_000).len(), 960);
        assert_eq!(resample_linear(&vec![0.0; 441], 44_100, 16_000).len(), 160);
        assert_eq!(resample_linear(&[0.5; 10], 16_000, 16_000), vec![0.5; 10]);
    }

    #[test]
    fn test_resample_preserves_endpoints() {
        let ramp: Vec<f32> = (0..100).map(|i| i as f32 / 99.0).collect();
        let out = resample_linear(&ramp, 48_000, 16_000);
        assert_eq!(out[0], 0.0);
        assert!((out[out.len() - 1] - 1.0).abs() < 1e-6);
        // A ramp stays a ramp under linear interpolation.
        for pair in out.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_resample_round_trip_count_and_energy() {
        for (a, b) in [(48_000, 44_100), (16_000, 24_000), (24_000, 22_050)] {
            let original = sine(220.0, a, a as usize / 10, 0.5);
            let there = resample_linear(&original, a, b);
            let back = resample_linear(&there, b, a);

            let diff = back.len().abs_diff(original.len());
            assert!(diff <= 1, "{a}->{b}->{a}: {} vs {}", back.len(), original.len());

            let e0 = rms(&original);
            let e1 = rms(&back);
            assert!(
                (e0 - e1).abs() / e0 < 0.05,
                "{a}->{b}->{a}: energy {e0} vs {e1}"
            );
        }
    }

    #[test]
    fn test_resample_pcm() {
        let pcm = vec![1000i16; 480];
        let out = resample_pcm(&pcm, 24_000, 48_000);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_quantize_round_trip() {
        let pcm = quantize(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(pcm, vec![0, 32767, -32767, 32767]);
        let back = to_f32(&pcm);
        assert_eq!(back[1], 1.0);
    }

    #[test]
    fn test_rms_calculation() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 320]), 0.0);
        assert!((rms(&[0.2; 320]) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_wav_layout() {
        let wav = encode_wav(&[1, -2, 3], 16_000, 1);
        let u16_at = |i: usize| u16::from_le_bytes([wav[i], wav[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([wav[i], wav[i + 1], wav[i + 2], wav[i + 3]]);

        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32_at(4), 36 + 6);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u32_at(16), 16);
        assert_eq!(u16_at(20), 1);
        assert_eq!(u16_at(22), 1);
        assert_eq!(u32_at(24), 16_000);
        assert_eq!(u32_at(28), 32_000);
        assert_eq!(u16_at(32), 2);
        assert_eq!(u16_at(34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32_at(40), 6);
        assert_eq!(pcm_from_le_bytes(&wav[44..]), vec![1, -2, 3]);
    }

    #[test]
    fn test_pcm_from_le_bytes_ignores_odd_tail() {
        assert_eq!(pcm_from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x07]), vec![1, -1]);
    }
}
