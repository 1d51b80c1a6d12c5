//! G.711 mu-law (PCMU) framing for the call audio track.
//!
//! Capture runs at the device rate (48 kHz by default); PCMU is fixed at
//! 8 kHz mono, so frames are decimated on the way out and sample-held on the
//! way in.

/// PCMU clock rate.
pub const SAMPLE_RATE: u32 = 8000;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encode one linear sample.
pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode one mu-law byte.
pub fn decode_sample(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| encode_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

pub fn decode(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| decode_sample(*b) as f32 / i16::MAX as f32)
        .collect()
}

/// Average every `factor` samples into one.
pub fn downsample(samples: &[f32], factor: usize) -> Vec<f32> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(factor)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Repeat every sample `factor` times.
pub fn upsample(samples: &[f32], factor: usize) -> Vec<f32> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .flat_map(|s| std::iter::repeat(*s).take(factor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_encodes_to_ff() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0);
    }

    #[test]
    fn test_sign_and_magnitude_survive() {
        for sample in [-30000i16, -1000, -10, 10, 1000, 30000] {
            let decoded = decode_sample(encode_sample(sample));
            assert_eq!(decoded.signum(), sample.signum(), "sample {sample}");
            let error = (decoded as i32 - sample as i32).abs();
            // mu-law step size is at most 1/16 of the magnitude
            assert!(error <= (sample as i32).abs() / 16 + 8, "sample {sample} -> {decoded}");
        }
    }

    #[test]
    fn test_clipping() {
        let top = decode_sample(encode_sample(i16::MAX));
        let bottom = decode_sample(encode_sample(i16::MIN + 1));
        assert!(top > 30000);
        assert!(bottom < -30000);
    }

    #[test]
    fn test_frame_resampling() {
        let frame = vec![0.5f32; 960];
        let narrow = downsample(&frame, 6);
        assert_eq!(narrow.len(), 160);
        assert!((narrow[0] - 0.5).abs() < f32::EPSILON);

        let wide = upsample(&decode(&encode(&narrow)), 6);
        assert_eq!(wide.len(), 960);
        assert!((wide[959] - 0.5).abs() < 0.02);
    }
}
