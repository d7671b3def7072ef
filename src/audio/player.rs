use crate::audio::cache::AudioCache;
use crate::protocol::{Frame, DEFAULT_FRAME_PCM_BYTES};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Milliseconds of audio per frame at the wire cadence.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Streams cached prompts onto a session's outbound frame queue.
///
/// The peer plays exactly one frame per 20 ms, so chunks are paced on a 20 ms
/// tick: sending faster overruns the peer, sending slower starves it. A short
/// final chunk is still transmitted; the peer tolerates the trailing silence.
pub struct Player {
    cache: Arc<AudioCache>,
    chunk_bytes: usize,
    tick: Duration,
}

impl Player {
    pub fn new(cache: Arc<AudioCache>) -> Self {
        Self {
            cache,
            chunk_bytes: DEFAULT_FRAME_PCM_BYTES,
            tick: FRAME_INTERVAL,
        }
    }

    /// Plays a cached prompt to completion, cancellation, or write failure.
    ///
    /// `stop` is checked before every chunk; a cancelled token ends playback
    /// between frames without tearing anything down. A closed frame queue
    /// means the connection writer is gone, which ends the call anyway, so it
    /// is reported as an error and never retried.
    pub async fn play(
        &self,
        frames: &mpsc::Sender<Frame>,
        name: &str,
        stop: &CancellationToken,
    ) -> Result<()> {
        let pcm = self
            .cache
            .get(name)
            .ok_or_else(|| anyhow!("audio file not found: {}", name))?;

        let mut interval = tokio::time::interval(self.tick);
        let mut sent = 0usize;

        for chunk in pcm.chunks(self.chunk_bytes) {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Playback of {} stopped after {} bytes", name, sent);
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            frames
                .send(Frame::audio(chunk))
                .await
                .map_err(|_| anyhow!("connection writer closed during playback of {}", name))?;
            sent += chunk.len();
        }

        info!("Played audio file: {} ({} bytes)", name, sent);
        Ok(())
    }
}
