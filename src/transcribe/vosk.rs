use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::{Transcriber, TranscriptLog, TranscriptionResult, RESULT_QUEUE_DEPTH};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reply shape of a Vosk-style streaming server. `partial` carries interim
/// hypotheses, `text` the finalized utterance, `result` optional word
/// timings.
#[derive(Debug, Deserialize)]
struct VoskReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial: String,
    #[serde(default)]
    result: Vec<VoskWord>,
}

#[derive(Debug, Deserialize)]
struct VoskWord {
    #[serde(default)]
    word: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    conf: f64,
}

/// Passthrough adapter: inbound PCM is written straight to the socket at the
/// wire sample rate; no buffering or resampling.
pub struct VoskTranscriber {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    results_rx: Mutex<Option<mpsc::Receiver<TranscriptionResult>>>,
    transcript: Arc<TranscriptLog>,
}

impl VoskTranscriber {
    /// Connects to `{base}/ws?sample_rate={rate}` and starts the reader.
    pub async fn connect(base_url: &str, sample_rate: u32) -> Result<Self> {
        let url = format!("{}/ws?sample_rate={}", base_url, sample_rate);
        let (ws, _) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect to transcription server {}", url))?;
        info!("Vosk transcriber connected: {}", url);

        let (sink, stream) = ws.split();
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
        let transcript = Arc::new(TranscriptLog::new());

        tokio::spawn(read_replies(stream, results_tx, Arc::clone(&transcript)));

        Ok(Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            results_rx: Mutex::new(Some(results_rx)),
            transcript,
        })
    }
}

async fn read_replies(
    mut stream: WsStream,
    results: mpsc::Sender<TranscriptionResult>,
    transcript: Arc<TranscriptLog>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!("Transcription socket error: {}", err);
                break;
            }
        };

        let reply: VoskReply = match serde_json::from_str(&text) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Failed to parse transcription reply: {}", err);
                continue;
            }
        };

        if !reply.partial.is_empty()
            && results
                .send(TranscriptionResult::partial(reply.partial))
                .await
                .is_err()
        {
            break;
        }

        if !reply.text.is_empty() {
            transcript.append(&reply.text);
            if !reply.result.is_empty() {
                let words: Vec<&str> = reply.result.iter().map(|w| w.word.as_str()).collect();
                tracing::debug!(
                    "Word timings for '{}': {:?} ({:.2}s-{:.2}s, conf {:.2})",
                    reply.text,
                    words,
                    reply.result.first().map(|w| w.start).unwrap_or_default(),
                    reply.result.last().map(|w| w.end).unwrap_or_default(),
                    reply.result.iter().map(|w| w.conf).sum::<f64>()
                        / reply.result.len() as f64,
                );
            }
            if results
                .send(TranscriptionResult::final_text(reply.text))
                .await
                .is_err()
            {
                break;
            }
        }
    }
    // Dropping `results` closes the channel and lets consumers observe EOF.
}

#[async_trait]
impl Transcriber for VoskTranscriber {
    async fn process_audio(&self, pcm: &[u8]) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(pcm.to_vec()))
            .await
            .context("failed to send audio to transcription server")
    }

    fn take_results(&self) -> Option<mpsc::Receiver<TranscriptionResult>> {
        self.results_rx
            .lock()
            .expect("results lock poisoned")
            .take()
    }

    fn full_transcript(&self) -> String {
        self.transcript.snapshot()
    }

    fn add_marker(&self, marker: &str) {
        self.transcript.append(marker);
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        // EOF asks the server to flush its final hypothesis.
        if let Err(err) = sink.send(Message::Text(r#"{"eof": 1}"#.to_string())).await {
            warn!("Failed to send transcription EOF: {}", err);
        }
        sink.close().await.ok();
        Ok(())
    }
}
