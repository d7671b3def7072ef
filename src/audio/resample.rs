//! Linear 8 kHz <-> 16 kHz resampling on 16-bit little-endian PCM.

/// Upsamples 8 kHz PCM to 16 kHz by linear interpolation.
///
/// Each input sample is kept at an even index with the midpoint of it and its
/// successor interleaved after it; the final sample is duplicated. Output is
/// always exactly twice the input sample count.
pub fn upsample_8k_to_16k(input: &[u8]) -> Vec<u8> {
    let samples: Vec<i16> = input
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    if samples.is_empty() {
        return Vec::new();
    }

    let mut upsampled = vec![0i16; samples.len() * 2];
    for i in 0..samples.len() - 1 {
        upsampled[i * 2] = samples[i];
        upsampled[i * 2 + 1] = ((samples[i] as i32 + samples[i + 1] as i32) / 2) as i16;
    }
    let last = samples[samples.len() - 1];
    upsampled[samples.len() * 2 - 2] = last;
    upsampled[samples.len() * 2 - 1] = last;

    let mut output = Vec::with_capacity(upsampled.len() * 2);
    for sample in upsampled {
        output.extend_from_slice(&sample.to_le_bytes());
    }
    output
}

/// Downsamples 16 kHz PCM to 8 kHz by decimation, keeping every other sample.
pub fn downsample_16k_to_8k(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() / 2);
    for pair in input.chunks_exact(4) {
        output.extend_from_slice(&pair[0..2]);
    }
    output
}
