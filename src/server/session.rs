use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::{AudioCache, Player};
use crate::config::AppConfig;
use crate::flow::engine::{EngineOptions, FlowEngine, FlowSession};
use crate::flow::{CampaignClient, FlowConfig, SessionLogger};
use crate::metrics::SessionMetrics;
use crate::patterns::PatternMatcher;
use crate::protocol::{read_frame, read_id, Frame, FrameKind};
use crate::transcribe::{
    AssemblyAiTranscriber, Transcriber, TranscriptionResult, VoskTranscriber, RESULT_QUEUE_DEPTH,
};

/// Depth of the outbound frame queue. The player paces itself, so this only
/// needs to absorb the hangup frame behind in-flight audio.
const FRAME_QUEUE_DEPTH: usize = 64;

/// How long finalization waits for the flow engine to wind down on its own.
const FLOW_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared process-wide collaborators handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<AppConfig>,
    pub cache: Option<Arc<AudioCache>>,
    pub matcher: Option<Arc<PatternMatcher>>,
    pub flow_config: Option<Arc<FlowConfig>>,
    pub campaign: Option<Arc<CampaignClient>>,
}

/// One connected call. Owns the read half of the connection; the write half
/// belongs to a dedicated writer task so player audio and the hangup frame
/// are serialized by construction.
struct CallSession {
    id: Uuid,
    frames: mpsc::Sender<Frame>,
    transcriber: Arc<dyn Transcriber>,
    player: Option<Player>,
    matcher: Option<Arc<PatternMatcher>>,
    /// Token for the playback in progress; replaced before each playback so
    /// a stop only ever cancels the current one.
    playback_stop: Mutex<CancellationToken>,
    results_rx: Mutex<Option<mpsc::Receiver<TranscriptionResult>>>,
}

#[async_trait]
impl FlowSession for CallSession {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn play_audio(&self, name: &str) -> Result<()> {
        let player = self
            .player
            .as_ref()
            .ok_or_else(|| anyhow!("no audio player configured"))?;
        let stop = {
            let mut current = self.playback_stop.lock().expect("playback lock poisoned");
            // One playback at a time: a new request preempts whatever is
            // still streaming before taking its place.
            current.cancel();
            *current = CancellationToken::new();
            current.clone()
        };
        player.play(&self.frames, name, &stop).await
    }

    fn stop_audio(&self) {
        self.playback_stop
            .lock()
            .expect("playback lock poisoned")
            .cancel();
    }

    async fn stop_transcription(&self) {
        info!("Session {}: Stopping transcription", self.id);
        if let Err(err) = self.transcriber.close().await {
            warn!("Session {}: transcriber close failed: {:#}", self.id, err);
        }
    }

    fn take_transcription_results(&self) -> Option<mpsc::Receiver<TranscriptionResult>> {
        self.results_rx.lock().expect("results lock poisoned").take()
    }

    async fn report_status(&self, status: &str, reason: &str) -> Result<()> {
        info!("Session {}: Status report - {}: {}", self.id, status, reason);
        Ok(())
    }

    fn check_for_interrupt(&self, text: &str) -> Option<String> {
        self.matcher.as_ref()?.detect(text).map(|rule| rule.id)
    }

    async fn end_call(&self) -> Result<()> {
        self.frames
            .send(Frame::hangup())
            .await
            .map_err(|_| anyhow!("connection writer closed before hangup"))?;
        info!("Session {}: Hangup command sent", self.id);
        Ok(())
    }
}

/// Handles one accepted connection from ID handshake to finalization.
pub async fn run_session(deps: SessionDeps, stream: TcpStream, peer: SocketAddr) {
    info!("New connection from {}", peer);
    let (mut reader, writer) = stream.into_split();

    let id = match read_id(&mut reader).await {
        Ok(id) => id,
        Err(err) => {
            error!("Failed to get session id from {}: {}", peer, err);
            return;
        }
    };
    let provider = deps.config.provider.name.clone();
    info!("Session {} started with {}", id, provider);

    let transcriber = match connect_transcriber(&deps.config).await {
        Ok(transcriber) => transcriber,
        Err(err) => {
            error!("Failed to create transcriber for session {}: {:#}", id, err);
            return;
        }
    };

    let start_time = Utc::now();
    let metrics = Arc::new(SessionMetrics::new(&provider, &id.to_string()));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let writer_task = spawn_writer(id, writer, frame_rx);

    let results_rx = spawn_result_forwarder(&*transcriber, Arc::clone(&metrics));

    let session = Arc::new(CallSession {
        id,
        frames: frame_tx,
        transcriber: Arc::clone(&transcriber),
        player: deps.cache.as_ref().map(|cache| Player::new(Arc::clone(cache))),
        matcher: deps.matcher.clone(),
        playback_stop: Mutex::new(CancellationToken::new()),
        results_rx,
    });

    let flow_task = spawn_flow(&deps, Arc::clone(&session), start_time);
    if flow_task.is_none() {
        spawn_fallback_transcript_logger(Arc::clone(&session), provider.clone());
    }

    // Message loop: the session task itself is the reader activity.
    let mut capture: Vec<u8> = Vec::new();
    let save_audio = deps.config.transcription.save_audio;
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                error!("Session {}: Failed to read message: {}", id, err);
                break;
            }
        };

        match frame.kind {
            FrameKind::Audio => {
                if frame.payload.is_empty() {
                    continue;
                }
                if let Err(err) = transcriber.process_audio(&frame.payload).await {
                    error!("Session {}: Failed to process audio: {:#}", id, err);
                    break;
                }
                metrics.add_audio_bytes(frame.payload.len());
                if save_audio {
                    capture.extend_from_slice(&frame.payload);
                }
            }
            FrameKind::Dtmf => {
                if let Some(&digit) = frame.payload.first() {
                    let digit = digit as char;
                    info!("Session {}: DTMF digit: {}", id, digit);
                    transcriber.add_marker(&format!("[DTMF: {}]", digit));
                }
            }
            FrameKind::Silence => {
                info!("Session {}: Silence detected", id);
                transcriber.add_marker("[SILENCE]");
            }
            FrameKind::Error => {
                error!(
                    "Session {}: Received error code: {}",
                    id,
                    frame.error_code().unwrap_or_default()
                );
                break;
            }
            FrameKind::Hangup => {
                info!("Session {}: Received hangup", id);
                break;
            }
            FrameKind::Id => {
                warn!("Session {}: Unexpected duplicate id frame", id);
            }
        }
    }

    finalize(
        &deps, &session, &transcriber, &metrics, start_time, &provider, capture, flow_task,
    )
    .await;

    drop(session);
    writer_task.abort();

    let duration = Utc::now() - start_time;
    info!(
        "Session {} ended (Duration: {:.1}s, Provider: {})",
        id,
        duration.num_milliseconds() as f64 / 1000.0,
        provider
    );
}

async fn connect_transcriber(config: &AppConfig) -> Result<Arc<dyn Transcriber>> {
    match config.provider.name.as_str() {
        "vosk" => {
            let settings = config
                .provider
                .vosk
                .as_ref()
                .context("vosk settings missing")?;
            let transcriber =
                VoskTranscriber::connect(&settings.server_url, settings.sample_rate).await?;
            Ok(Arc::new(transcriber))
        }
        "assemblyai" => {
            let settings = config
                .provider
                .assemblyai
                .as_ref()
                .context("assemblyai settings missing")?;
            let transcriber =
                AssemblyAiTranscriber::connect(&settings.api_key, settings.sample_rate).await?;
            Ok(Arc::new(transcriber))
        }
        other => Err(anyhow!("unknown provider: {}", other)),
    }
}

/// Single owner of the connection's write half; everything outbound goes
/// through its queue in order.
fn spawn_writer(
    id: Uuid,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(err) = writer.write_all(&frame.encode()).await {
                error!("Session {}: write failed: {}", id, err);
                break;
            }
        }
        // Closing the receiver here makes later sends fail, which is how
        // players and the flow engine observe a dead connection.
    })
}

/// Bridges transcriber results into the session, counting them on the way.
fn spawn_result_forwarder(
    transcriber: &dyn Transcriber,
    metrics: Arc<SessionMetrics>,
) -> Mutex<Option<mpsc::Receiver<TranscriptionResult>>> {
    let Some(mut raw) = transcriber.take_results() else {
        return Mutex::new(None);
    };
    let (tx, rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(result) = raw.recv().await {
            metrics.add_result(&result.text, result.is_final);
            if tx.send(result).await.is_err() {
                break;
            }
        }
    });
    Mutex::new(Some(rx))
}

fn spawn_flow(
    deps: &SessionDeps,
    session: Arc<CallSession>,
    start_time: DateTime<Utc>,
) -> Option<JoinHandle<()>> {
    let flow_config = deps.flow_config.clone()?;
    let settings = deps.config.flow.as_ref()?;

    let logger = settings.session_log_dir.as_ref().and_then(|dir| {
        match SessionLogger::create(dir, &session.id.to_string(), start_time) {
            Ok(logger) => Some(Arc::new(logger)),
            Err(err) => {
                warn!("Session {}: session log disabled: {:#}", session.id, err);
                None
            }
        }
    });

    let options = EngineOptions {
        response_timeout: settings.response_timeout(),
        timer_debounce: settings.timer_debounce(),
        stop_settle: settings.stop_settle(),
    };

    let id = session.id;
    let engine = FlowEngine::new(
        session,
        flow_config,
        deps.campaign.clone(),
        logger,
        options,
    );
    Some(tokio::spawn(async move {
        if let Err(err) = engine.run().await {
            error!("Session {}: flow engine failed: {:#}", id, err);
        }
    }))
}

/// Without a flow, transcripts are just logged as they arrive.
fn spawn_fallback_transcript_logger(session: Arc<CallSession>, provider: String) {
    let Some(mut results) = session.take_transcription_results() else {
        return;
    };
    let id = session.id;
    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            if result.text.is_empty() {
                continue;
            }
            let stamp = result.timestamp.format("%H:%M:%S");
            if result.is_final {
                info!("[{}] Session {} [{}] Final: {}", provider, id, stamp, result.text);
            } else {
                info!("[{}] Session {} [{}] Partial: {}", provider, id, stamp, result.text);
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    deps: &SessionDeps,
    session: &Arc<CallSession>,
    transcriber: &Arc<dyn Transcriber>,
    metrics: &SessionMetrics,
    start_time: DateTime<Utc>,
    provider: &str,
    capture: Vec<u8>,
    flow_task: Option<JoinHandle<()>>,
) {
    let id = session.id;

    session.stop_audio();
    if let Err(err) = transcriber.close().await {
        warn!("Session {}: transcriber close failed: {:#}", id, err);
    }

    // Give the flow a moment to reach its terminal node, then cut it loose;
    // the call is already over.
    if let Some(mut task) = flow_task {
        if tokio::time::timeout(FLOW_DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!("Session {}: flow engine still running at teardown", id);
            task.abort();
        }
    }

    metrics.finalize();
    info!("Session {} metrics:\n{}", id, metrics.summary());

    let transcription = &deps.config.transcription;
    let full_transcript = transcriber.full_transcript();

    if transcription.save_transcripts && !full_transcript.is_empty() {
        let sample_rate = deps
            .config
            .provider
            .vosk
            .as_ref()
            .map(|v| v.sample_rate)
            .unwrap_or(8000);
        let duration = Utc::now() - start_time;
        let content = format!(
            "Session ID: {}\nProvider: {}\nStart Time: {}\nDuration: {:.1}s\nSample Rate: {}Hz\n\n---TRANSCRIPT---\n\n{}",
            id,
            provider,
            start_time.format("%Y-%m-%d %H:%M:%S"),
            duration.num_milliseconds() as f64 / 1000.0,
            sample_rate,
            full_transcript,
        );
        let path = output_path(&transcription.output_dir, start_time, provider, id, "txt");
        match std::fs::write(&path, content) {
            Ok(()) => info!("Session {}: Transcript saved to {}", id, path.display()),
            Err(err) => error!("Failed to save transcript: {}", err),
        }
    }

    if transcription.save_audio && !capture.is_empty() {
        let path = output_path(&transcription.output_dir, start_time, provider, id, "raw");
        match std::fs::write(&path, &capture) {
            Ok(()) => info!(
                "Session {}: Audio saved to {} ({:.2} seconds)",
                id,
                path.display(),
                capture.len() as f64 / (8000.0 * 2.0)
            ),
            Err(err) => error!("Failed to save audio: {}", err),
        }
    }
}

fn output_path(
    dir: &str,
    start_time: DateTime<Utc>,
    provider: &str,
    id: Uuid,
    extension: &str,
) -> std::path::PathBuf {
    let short_id = id.to_string()[..8].to_string();
    Path::new(dir).join(format!(
        "{}_{}_{}.{}",
        start_time.format("%Y%m%d_%H%M%S"),
        provider,
        short_id,
        extension
    ))
}
