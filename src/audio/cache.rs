use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// In-memory store of prompt PCM, loaded once at startup.
///
/// Every file under `<dir>/*.wav` and `<dir>/background/*.wav` is parsed and
/// its raw sample data cached by base filename. Prompts are expected to be
/// 8 kHz, 16-bit signed little-endian, mono; the loader only validates the
/// container, not the sample format.
pub struct AudioCache {
    cache: HashMap<String, Vec<u8>>,
    dir: PathBuf,
}

impl AudioCache {
    /// Scans the audio directory and preloads every WAV file found.
    ///
    /// Files that fail to parse are logged and skipped so one bad prompt
    /// cannot take the whole set down.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut cache = HashMap::new();

        let mut files = wav_files_in(&dir)?;
        files.extend(wav_files_in(&dir.join("background")).unwrap_or_default());

        for path in files {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            match read_wav_pcm(&path) {
                Ok(pcm) => {
                    info!("Loaded audio file: {} ({} bytes)", name, pcm.len());
                    cache.insert(name, pcm);
                }
                Err(err) => {
                    warn!("Failed to load audio file {}: {:#}", name, err);
                }
            }
        }

        info!("Audio cache ready: {} prompts from {}", cache.len(), dir.display());
        Ok(Self { cache, dir })
    }

    /// Looks up the cached PCM for a prompt by filename.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.cache.get(name).map(|pcm| pcm.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn wav_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read audio directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if path.is_file() && is_wav {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads a WAV file and returns the bytes of its `data` chunk.
///
/// The data chunk is located by scanning forward from offset 12; a fixed
/// 44-byte header must not be assumed (files with LIST/fact chunks place the
/// data later).
fn read_wav_pcm(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        bail!("not a valid WAV file");
    }

    let mut offset = 12;
    while offset + 4 <= bytes.len() {
        if &bytes[offset..offset + 4] == b"data" {
            let start = offset + 8;
            if start > bytes.len() {
                bail!("data chunk header is truncated");
            }
            return Ok(bytes[start..].to_vec());
        }
        offset += 1;
    }

    bail!("no data chunk found")
}
