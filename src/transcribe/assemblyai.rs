use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transcriber, TranscriptLog, TranscriptionResult, RESULT_QUEUE_DEPTH};
use crate::audio::resample::upsample_8k_to_16k;

const STREAMING_URL: &str = "wss://streaming.assemblyai.com/v3/ws";

/// The provider accepts chunks of 50 ms to 1000 ms. At 16 kHz 16-bit mono
/// that is 1600 bytes minimum; the maximum stays at 950 ms to keep a margin
/// under the hard limit.
const MIN_CHUNK_BYTES: usize = 1600;
const MAX_CHUNK_BYTES: usize = 30400;

/// Cadence of the buffered sender.
const SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period for the provider to process the terminate message.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Deserialize)]
struct ProviderMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    turn_is_formatted: bool,
    #[serde(default)]
    audio_duration_seconds: f64,
    #[serde(default)]
    session_duration_seconds: f64,
}

/// Buffered adapter for a provider that requires 16 kHz input in bounded
/// chunk sizes.
///
/// Inbound 8 kHz PCM is upsampled and appended to a buffer; a sender task
/// wakes every 50 ms and flushes whatever has accumulated, split into valid
/// chunk sizes. Buffer assembly and send pacing deliberately live on
/// opposite sides of the buffer lock so `process_audio` never waits on the
/// socket.
pub struct AssemblyAiTranscriber {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    buffer: Arc<Mutex<Vec<u8>>>,
    results_rx: Mutex<Option<mpsc::Receiver<TranscriptionResult>>>,
    transcript: Arc<TranscriptLog>,
    sample_rate: u32,
    stop_sending: CancellationToken,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl AssemblyAiTranscriber {
    pub async fn connect(api_key: &str, sample_rate: u32) -> Result<Self> {
        if api_key.is_empty() {
            bail!("assemblyai api key is required");
        }

        let url = format!("{}?sample_rate=16000&format_turns=true", STREAMING_URL);
        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build provider request")?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(api_key).context("api key is not a valid header value")?,
        );

        let (ws, _) = connect_async(request)
            .await
            .context("failed to connect to assemblyai")?;
        info!("AssemblyAI transcriber connected");

        let (sink, stream) = ws.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let (results_tx, results_rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
        let transcript = Arc::new(TranscriptLog::new());
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::with_capacity(8000)));
        let stop_sending = CancellationToken::new();

        tokio::spawn(read_messages(stream, results_tx, Arc::clone(&transcript)));

        let sender_task = tokio::spawn(run_sender(
            Arc::clone(&sink),
            Arc::clone(&buffer),
            stop_sending.clone(),
        ));

        Ok(Self {
            sink,
            buffer,
            results_rx: Mutex::new(Some(results_rx)),
            transcript,
            sample_rate,
            stop_sending,
            sender_task: Mutex::new(Some(sender_task)),
        })
    }
}

/// Pops the next sendable chunk off the buffer, or None when less than the
/// minimum has accumulated.
fn next_chunk(buffer: &Mutex<Vec<u8>>) -> Option<Vec<u8>> {
    let mut buffer = buffer.lock().expect("audio buffer lock poisoned");
    if buffer.len() < MIN_CHUNK_BYTES {
        return None;
    }
    let take = buffer.len().min(MAX_CHUNK_BYTES);
    Some(buffer.drain(..take).collect())
}

async fn flush_buffer(sink: &tokio::sync::Mutex<WsSink>, buffer: &Mutex<Vec<u8>>) {
    while let Some(chunk) = next_chunk(buffer) {
        if let Err(err) = sink.lock().await.send(Message::Binary(chunk)).await {
            warn!("Failed to send audio to assemblyai: {}", err);
            buffer.lock().expect("audio buffer lock poisoned").clear();
            return;
        }
    }
}

async fn run_sender(
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    buffer: Arc<Mutex<Vec<u8>>>,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(SEND_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                flush_buffer(&sink, &buffer).await;
                return;
            }
            _ = interval.tick() => {
                flush_buffer(&sink, &buffer).await;
            }
        }
    }
}

async fn read_messages(
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
                warn!("AssemblyAI socket error: {}", err);
                break;
            }
        };

        let message: ProviderMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!("Failed to parse assemblyai message: {}", err);
                continue;
            }
        };

        match message.kind.as_str() {
            "Begin" => {
                info!("AssemblyAI session started: {}", message.id);
            }
            "Turn" if !message.transcript.is_empty() => {
                let result = if message.turn_is_formatted {
                    transcript.append(&message.transcript);
                    TranscriptionResult::final_text(message.transcript)
                } else {
                    TranscriptionResult::partial(message.transcript)
                };
                if results.send(result).await.is_err() {
                    break;
                }
            }
            "Termination" => {
                info!(
                    "AssemblyAI session terminated: audio {:.2}s, session {:.2}s",
                    message.audio_duration_seconds, message.session_duration_seconds
                );
            }
            _ => {
                debug!("Unhandled assemblyai message type: {}", message.kind);
            }
        }
    }
}

#[async_trait]
impl Transcriber for AssemblyAiTranscriber {
    async fn process_audio(&self, pcm: &[u8]) -> Result<()> {
        let upsampled;
        let data = if self.sample_rate == 8000 {
            upsampled = upsample_8k_to_16k(pcm);
            upsampled.as_slice()
        } else {
            pcm
        };
        self.buffer
            .lock()
            .expect("audio buffer lock poisoned")
            .extend_from_slice(data);
        Ok(())
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
        self.stop_sending.cancel();
        let task = self
            .sender_task
            .lock()
            .expect("sender task lock poisoned")
            .take();
        if let Some(task) = task {
            task.await.ok();
        }

        // Push out whatever remains even if it is under the minimum chunk
        // size; the stream is ending and a short tail beats a lost one.
        let remainder: Vec<u8> = {
            let mut buffer = self.buffer.lock().expect("audio buffer lock poisoned");
            buffer.drain(..).collect()
        };

        let mut sink = self.sink.lock().await;
        if !remainder.is_empty() {
            sink.send(Message::Binary(remainder)).await.ok();
        }
        if sink
            .send(Message::Text(r#"{"type":"Terminate"}"#.to_string()))
            .await
            .is_ok()
        {
            tokio::time::sleep(TERMINATE_GRACE).await;
        }
        sink.close().await.ok();
        Ok(())
    }
}
