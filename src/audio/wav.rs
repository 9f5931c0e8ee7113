//! In-memory WAV encoding and decoding using hound
//!
//! Captured audio travels as a mono 32-bit float WAV blob; received blobs
//! may be any PCM WAV and are mixed down to mono for playback.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;

/// Decoded audio ready for an output device
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Clip {
    pub fn duration_seconds(&self) -> f64 {
        duration_seconds(self.samples.len(), self.sample_rate)
    }
}

/// Encode mono samples as a 32-bit float WAV file
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, String> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 4));
    let mut writer = WavWriter::new(&mut cursor, spec)
        .map_err(|e| format!("Failed to create WAV writer: {}", e))?;

    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| format!("Failed to write sample: {}", e))?;
    }

    writer
        .finalize()
        .map_err(|e| format!("Failed to finalize WAV data: {}", e))?;

    Ok(cursor.into_inner())
}

/// Decode a WAV blob into mono f32 samples
pub fn decode(bytes: &[u8]) -> Result<Clip, String> {
    let reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| format!("Failed to read WAV header: {}", e))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read samples: {}", e))?,
        SampleFormat::Int => {
            let max_value = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("Failed to read samples: {}", e))?
        }
    };

    let samples = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(Clip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_calculation() {
        assert_eq!(duration_seconds(16000, 16000), 1.0);
        assert_eq!(duration_seconds(8000, 16000), 0.5);
        assert_eq!(duration_seconds(100, 0), 0.0);
    }

    #[test]
    fn test_encoded_blob_is_a_wav_file() {
        let bytes = encode(&[0.0, 0.5, -0.5, 0.25], 16000).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");

        let clip = decode(&bytes).unwrap();
        assert_eq!(clip.sample_rate, 16000);
        assert_eq!(clip.samples, vec![0.0, 0.5, -0.5, 0.25]);
    }

    #[test]
    fn test_decode_mixes_stereo_int_to_mono() {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..4 {
                writer.write_sample(i16::MAX).unwrap();
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let clip = decode(&cursor.into_inner()).unwrap();
        assert_eq!(clip.sample_rate, 8000);
        assert_eq!(clip.samples.len(), 4);
        assert!((clip.samples[0] - 0.5).abs() < 0.001);
        assert!((clip.duration_seconds() - 0.0005).abs() < 1e-9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"definitely not audio").is_err());
        assert!(decode(&[]).is_err());
    }
}
