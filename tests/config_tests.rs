// App configuration loading and validation.

use anyhow::Result;
use std::fs;
use voicegate::config::AppConfig;

const FULL_CONFIG: &str = r#"
server:
  host: 127.0.0.1
  port: 8090

provider:
  name: vosk
  vosk:
    server_url: ws://localhost:2700

audio:
  dir: ./audio

flow:
  config_path: ./config/flow.json
  interrupts_path: ./config/interrupts.yaml
  session_log_dir: ./transcripts

transcription:
  output_dir: ./transcripts
  save_transcripts: true
"#;

fn write_config(contents: &str) -> Result<(tempfile::TempDir, String)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.yaml");
    fs::write(&path, contents)?;
    Ok((dir, path.to_str().unwrap().to_string()))
}

#[test]
fn loads_a_full_config_with_defaults() -> Result<()> {
    let (_dir, path) = write_config(FULL_CONFIG)?;
    let config = AppConfig::load(&path)?;

    assert_eq!(config.server.port, 8090);
    assert_eq!(config.provider.name, "vosk");
    assert_eq!(config.provider.vosk.as_ref().unwrap().sample_rate, 8000);

    let flow = config.flow.as_ref().unwrap();
    assert_eq!(flow.response_timeout_secs, 15);
    assert_eq!(flow.timer_debounce_ms, 500);
    assert_eq!(flow.stop_settle_ms, 100);

    assert!(config.transcription.save_transcripts);
    assert!(!config.transcription.save_audio);
    Ok(())
}

#[test]
fn rejects_an_unknown_provider() -> Result<()> {
    let (_dir, path) = write_config(&FULL_CONFIG.replace("name: vosk", "name: whisper"))?;
    let err = AppConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("unknown provider"));
    Ok(())
}

#[test]
fn rejects_provider_without_its_settings_section() -> Result<()> {
    let without_vosk = r#"
server: { host: 127.0.0.1, port: 8090 }
provider: { name: vosk }
transcription: { output_dir: ./transcripts }
"#;
    let (_dir, path) = write_config(without_vosk)?;
    assert!(AppConfig::load(&path).is_err());
    Ok(())
}

#[test]
fn rejects_flow_without_an_audio_directory() -> Result<()> {
    let mut lines: Vec<&str> = FULL_CONFIG.lines().collect();
    lines.retain(|line| !line.starts_with("audio:") && !line.contains("dir: ./audio"));
    let (_dir, path) = write_config(&lines.join("\n"))?;

    let err = AppConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("audio directory"));
    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(AppConfig::load("/nonexistent/config.yaml").is_err());
}
