use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::flow::CampaignConfig;

/// Top-level application configuration, loaded from a YAML file.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    /// Prompt playback; omit to run the gateway transcription-only.
    pub audio: Option<AudioConfig>,
    /// Dialog flow; requires `audio` to be set.
    pub flow: Option<FlowSettings>,
    pub transcription: TranscriptionConfig,
    /// Campaign API reporting; omitted means outcomes are only logged.
    pub campaign: Option<CampaignConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    /// "vosk" or "assemblyai".
    pub name: String,
    pub vosk: Option<VoskSettings>,
    pub assemblyai: Option<AssemblyAiSettings>,
}

#[derive(Debug, Deserialize)]
pub struct VoskSettings {
    pub server_url: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

#[derive(Debug, Deserialize)]
pub struct AssemblyAiSettings {
    pub api_key: String,
    /// Sample rate of the inbound wire audio, not of the provider stream.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    /// Directory holding prompt WAVs (plus an optional background/ subdir).
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct FlowSettings {
    pub config_path: String,
    pub interrupts_path: String,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_timer_debounce_ms")]
    pub timer_debounce_ms: u64,
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,
    /// Directory for per-session JSONL event logs; omit to disable.
    pub session_log_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TranscriptionConfig {
    pub output_dir: String,
    #[serde(default)]
    pub save_transcripts: bool,
    #[serde(default)]
    pub save_audio: bool,
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_response_timeout_secs() -> u64 {
    15
}

fn default_timer_debounce_ms() -> u64 {
    500
}

fn default_stop_settle_ms() -> u64 {
    100
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("failed to read config file {}", path))?;

        let app: AppConfig = settings
            .try_deserialize()
            .context("failed to parse config file")?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> Result<()> {
        match self.provider.name.as_str() {
            "vosk" => {
                if self.provider.vosk.is_none() {
                    bail!("provider is vosk but the vosk section is missing");
                }
            }
            "assemblyai" => {
                if self.provider.assemblyai.is_none() {
                    bail!("provider is assemblyai but the assemblyai section is missing");
                }
            }
            other => bail!("unknown provider: {}", other),
        }

        if self.flow.is_some() && self.audio.is_none() {
            bail!("flow configuration requires an audio directory");
        }
        Ok(())
    }
}

impl FlowSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn timer_debounce(&self) -> Duration {
        Duration::from_millis(self.timer_debounce_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}
