pub mod assemblyai;
pub mod vosk;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub use assemblyai::AssemblyAiTranscriber;
pub use vosk::VoskTranscriber;

/// Depth of the per-session results queue. A slow consumer back-pressures
/// the provider reads, which is fine: the flow engine drains far faster than
/// any realistic transcript burst.
pub const RESULT_QUEUE_DEPTH: usize = 100;

/// One transcript message from the speech-to-text provider.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptionResult {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            timestamp: Utc::now(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            timestamp: Utc::now(),
        }
    }
}

/// Capability surface every speech-to-text adapter provides to the session.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Delivers one inbound frame of 8 kHz 16-bit PCM.
    async fn process_audio(&self, pcm: &[u8]) -> Result<()>;

    /// Hands over the results stream. Single consumer; returns None once
    /// taken. The channel closes when the provider socket does.
    fn take_results(&self) -> Option<mpsc::Receiver<TranscriptionResult>>;

    /// All final transcripts so far, separated by single spaces.
    fn full_transcript(&self) -> String;

    /// Splices a literal marker (DTMF, silence) into the transcript.
    fn add_marker(&self, marker: &str);

    /// Flushes pending audio and releases the provider connection.
    async fn close(&self) -> Result<()>;
}

/// Accumulator for the full-call transcript, shared between the socket
/// reader task and the session.
pub struct TranscriptLog {
    text: Mutex<String>,
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self {
            text: Mutex::new(String::new()),
        }
    }

    pub fn append(&self, fragment: &str) {
        let mut text = self.text.lock().expect("transcript lock poisoned");
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(fragment);
    }

    pub fn snapshot(&self) -> String {
        self.text.lock().expect("transcript lock poisoned").clone()
    }
}
