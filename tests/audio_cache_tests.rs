// Integration tests for WAV preloading.
//
// Fixtures are written with hound the way real prompt files are produced,
// plus one hand-built file whose data chunk is not at the canonical offset.

use anyhow::Result;
use std::fs;
use std::path::Path;
use voicegate::audio::AudioCache;

fn write_wav(path: &Path, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[test]
fn preloads_wav_payloads_by_base_filename() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let samples: Vec<i16> = (0..400).map(|i| (i % 100) as i16).collect();
    write_wav(&dir.path().join("greeting.wav"), &samples)?;
    write_wav(&dir.path().join("bye.wav"), &samples[..100])?;

    let cache = AudioCache::load(dir.path())?;
    assert_eq!(cache.len(), 2);

    let pcm = cache.get("greeting.wav").expect("greeting cached");
    assert_eq!(pcm.len(), samples.len() * 2);
    assert_eq!(&pcm[0..2], &0i16.to_le_bytes());

    assert!(cache.get("missing.wav").is_none());
    Ok(())
}

#[test]
fn loads_background_subdirectory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("background"))?;
    write_wav(&dir.path().join("greeting.wav"), &[1, 2, 3])?;
    write_wav(&dir.path().join("background").join("office.wav"), &[4, 5, 6])?;

    let cache = AudioCache::load(dir.path())?;
    assert!(cache.contains("greeting.wav"));
    assert!(cache.contains("office.wav"));
    Ok(())
}

#[test]
fn finds_data_chunk_past_extra_header_chunks() -> Result<()> {
    // RIFF/WAVE with an extra LIST chunk before data, so the data chunk does
    // not start at byte 44.
    let pcm: Vec<u8> = vec![0x11, 0x22, 0x33, 0x44];
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&0u32.to_le_bytes()); // size, unchecked
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]);
    bytes.extend_from_slice(b"LIST");
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 10]);
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&pcm);

    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("offset.wav"), &bytes)?;

    let cache = AudioCache::load(dir.path())?;
    assert_eq!(cache.get("offset.wav"), Some(pcm.as_slice()));
    Ok(())
}

#[test]
fn skips_files_that_are_not_riff_wave() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_wav(&dir.path().join("good.wav"), &[1, 2, 3])?;
    fs::write(dir.path().join("bad.wav"), b"this is not a wav file at all")?;
    fs::write(dir.path().join("notes.txt"), b"ignored entirely")?;

    let cache = AudioCache::load(dir.path())?;
    assert_eq!(cache.len(), 1);
    assert!(cache.contains("good.wav"));
    Ok(())
}

#[test]
fn missing_directory_is_an_error() {
    assert!(AudioCache::load("/nonexistent/audio/dir").is_err());
}
