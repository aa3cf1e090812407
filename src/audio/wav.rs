//! WAV encoding for diagnostics files and ASR uploads.

use std::io::Cursor;
use std::path::Path;

use hound::{WavSpec, WavWriter};

use super::device::{AudioError, SAMPLE_RATE};

fn spec() -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write mono samples to a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32]) -> Result<(), AudioError> {
    let mut writer = WavWriter::create(path, spec())
        .map_err(|e| AudioError::FileCreationFailed(e.to_string()))?;
    for &s in samples {
        writer
            .write_sample(sample_to_i16(s))
            .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| AudioError::WriteFailed(e.to_string()))
}

/// Encode mono samples as an in-memory WAV file.
pub fn encode_wav(samples: &[f32]) -> Result<Vec<u8>, AudioError> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec())
            .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
        for &s in samples {
            writer
                .write_sample(sample_to_i16(s))
                .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Clamp and scale an f32 sample to i16.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, &[0.0, 0.5, -0.5]).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 3);
    }

    #[test]
    fn encoded_bytes_have_riff_header() {
        let bytes = encode_wav(&[0.0; 160]).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(bytes.len(), 44 + 320);
    }
}
