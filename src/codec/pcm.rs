//! PCM sample conversion
//!
//! Everything inside the pipeline runs on interleaved `i16` samples.
//! Output is always 16-bit little-endian regardless of the input format.

use crate::protocol::AudioFormat;

/// Decode raw capture bytes into `out`, replacing its contents.
///
/// A trailing partial sample is ignored. Returns the number of samples
/// decoded.
pub fn decode_to_i16(bytes: &[u8], format: AudioFormat, out: &mut Vec<i16>) -> usize {
    out.clear();
    out.reserve(bytes.len() / format.bytes_per_sample());

    match format {
        AudioFormat::Pcm8 => {
            out.extend(bytes.iter().map(|&b| ((b as i32 - 128) * 256) as i16));
        }
        AudioFormat::Pcm16 => {
            out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]])),
            );
        }
        AudioFormat::PcmFloat32 => {
            out.extend(bytes.chunks_exact(4).map(|c| {
                let sample = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                float_to_i16(sample)
            }));
        }
    }

    out.len()
}

/// Scale a float sample by 32767 and clamp to the 16-bit range
#[inline]
pub fn float_to_i16(sample: f32) -> i16 {
    ((sample * 32767.0) as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Encode samples as 16-bit little-endian into `out`, replacing its contents
pub fn encode_i16_le(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Clamp a widened sample back to the 16-bit range
#[inline]
pub fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// RMS of a buffer normalized to 0.0-1.0
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let n = s as f64 / 32768.0;
            n * n
        })
        .sum();
    (sum / samples.len() as f64).sqrt()
}
