//! WAV conversion for upload
//!
//! The scratch file holds native 32-bit float PCM. Providers want a small
//! canonical container: 16-bit little-endian mono PCM at the capture rate,
//! which is what [`encode_pcm16`] produces.

use crate::audio::{recorder::resample, SAMPLE_RATE};
use crate::error::SpeechError;
use std::io::Cursor;
use std::path::Path;

/// Encode f32 samples as a canonical RIFF/WAVE file: PCM format 1, mono,
/// 44.1 kHz, 16 bits per sample. Each sample is clamped to [-1, 1] and
/// scaled by 32767.
pub fn encode_pcm16(samples: &[f32]) -> Result<Vec<u8>, SpeechError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut buffer, spec)
        .map_err(|e| SpeechError::AudioConversion(format!("failed to create WAV writer: {e}")))?;

    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(scaled)
            .map_err(|e| SpeechError::AudioConversion(format!("failed to write sample: {e}")))?;
    }

    writer
        .finalize()
        .map_err(|e| SpeechError::AudioConversion(format!("failed to finalize WAV: {e}")))?;

    Ok(buffer.into_inner())
}

/// Read a WAV file back into f32 mono samples at the capture rate.
/// Handles integer and float sources, downmixes multi-channel audio, and
/// resamples when the file rate differs.
pub fn read_samples(path: &Path) -> Result<Vec<f32>, SpeechError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| SpeechError::Io(format!("failed to open {path:?}: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / max_val)
                .collect()
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(|s| s.ok())
            .collect(),
    };

    let mono: Vec<f32> = if spec.channels > 1 {
        samples
            .chunks(spec.channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        samples
    };

    if spec.sample_rate != SAMPLE_RATE {
        Ok(resample(&mono, spec.sample_rate, SAMPLE_RATE))
    } else {
        Ok(mono)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_second() -> Vec<f32> {
        (0..SAMPLE_RATE)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_encode_header_and_size() {
        let samples = sine_second();
        let wav = encode_pcm16(&samples).unwrap();

        // 44-byte canonical header followed by 2 bytes per sample
        assert_eq!(wav.len(), 44 + samples.len() * 2);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        // PCM format tag 1, mono, little-endian
        assert_eq!(&wav[20..22], &1u16.to_le_bytes());
        assert_eq!(&wav[22..24], &1u16.to_le_bytes());
        assert_eq!(&wav[24..28], &SAMPLE_RATE.to_le_bytes());
    }

    #[test]
    fn test_roundtrip_preserves_samples_modulo_quantization() {
        let samples = sine_second();
        let wav = encode_pcm16(&samples).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().bits_per_sample, 16);

        let decoded: Vec<f32> = reader
            .into_samples::<i16>()
            .map(|s| s.unwrap() as f32 / 32767.0)
            .collect();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let wav = encode_pcm16(&[2.0, -2.0]).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![32767, -32767]);
    }

    #[test]
    fn test_read_samples_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let samples = sine_second();
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in &samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let read = read_samples(&path).unwrap();
        assert_eq!(read.len(), samples.len());
        assert!((read[100] - samples[100]).abs() < 1e-6);
    }

    #[test]
    fn test_read_samples_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(1.0f32).unwrap();
            writer.write_sample(0.0f32).unwrap();
        }
        writer.finalize().unwrap();

        let read = read_samples(&path).unwrap();
        assert_eq!(read.len(), 100);
        assert!((read[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_read_samples_missing_file() {
        let err = read_samples(Path::new("/nonexistent/clip.wav")).unwrap_err();
        assert!(matches!(err, SpeechError::Io(_)));
    }
}
