pub mod session;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::audio::AudioCache;
use crate::config::AppConfig;
use crate::flow::{CampaignClient, FlowConfig};
use crate::patterns::PatternMatcher;
use session::{run_session, SessionDeps};

/// The AudioSocket TCP server: one accepted connection per call.
///
/// Shared, immutable-after-init collaborators (audio cache, pattern matcher,
/// flow graph, campaign client) are built once here and handed to every
/// session. A session failure never reaches the accept loop.
pub struct Server {
    deps: SessionDeps,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl Server {
    pub fn new(config: AppConfig) -> Result<Self> {
        let transcription = &config.transcription;
        if (transcription.save_transcripts || transcription.save_audio)
            && !transcription.output_dir.is_empty()
        {
            std::fs::create_dir_all(&transcription.output_dir)
                .context("failed to create output directory")?;
        }

        let cache = match &config.audio {
            Some(audio) => Some(Arc::new(
                AudioCache::load(&audio.dir).context("failed to preload audio files")?,
            )),
            None => None,
        };

        let (matcher, flow_config) = match &config.flow {
            Some(flow) => {
                let matcher = PatternMatcher::load(&flow.interrupts_path)
                    .context("failed to load interrupt config")?;
                let flow_config = FlowConfig::load(&flow.config_path)?;
                (Some(Arc::new(matcher)), Some(Arc::new(flow_config)))
            }
            None => (None, None),
        };

        let campaign = match config.campaign.clone() {
            Some(campaign_config) => Some(Arc::new(
                CampaignClient::new(campaign_config)
                    .context("failed to build campaign client")?,
            )),
            None => None,
        };

        Ok(Self {
            deps: SessionDeps {
                config: Arc::new(config),
                cache,
                matcher,
                flow_config,
                campaign,
            },
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        })
    }

    /// Token that stops the accept loop when cancelled. Sessions already in
    /// flight finish naturally.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let config = &self.deps.config;
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;

        info!("AudioSocket server listening on {}", addr);
        info!("Transcription provider: {}", config.provider.name);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let deps = self.deps.clone();
                            self.sessions.spawn(run_session(deps, stream, peer));
                        }
                        Err(err) => {
                            warn!("Accept error: {}", err);
                        }
                    }
                }
            }
        }

        info!("Accept loop stopped; draining active sessions");
        self.sessions.close();
        self.sessions.wait().await;
        Ok(())
    }
}
