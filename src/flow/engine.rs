use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::api::CampaignClient;
use super::classifier::ResponseClassifier;
use super::config::{ActionType, FlowConfig, FlowNode, NodeType, END_CALL_NODE};
use super::session_log::SessionLogger;
use super::timer::GlobalTimer;
use crate::transcribe::TranscriptionResult;

/// Reason code reported when a call ends without a more specific outcome.
const DEFAULT_HANGUP_REASON: &str = "DC";

/// Partials shorter than this never reset the response timer; they are
/// usually noise, and rewarding them would make timeouts unreachable.
const PARTIAL_RESET_MIN_CHARS: usize = 10;

/// What the session exposes to the flow engine. Kept narrow on purpose: the
/// engine drives the dialog and never touches the connection directly.
#[async_trait]
pub trait FlowSession: Send + Sync {
    fn id(&self) -> String;

    /// Plays a cached prompt to completion or interruption.
    async fn play_audio(&self, name: &str) -> Result<()>;

    /// Preempts the in-progress playback, if any.
    fn stop_audio(&self);

    /// Shuts down the speech-to-text stream (used before transfers).
    async fn stop_transcription(&self);

    /// Hands over the transcript stream; None if already taken or absent.
    fn take_transcription_results(&self) -> Option<mpsc::Receiver<TranscriptionResult>>;

    /// Records a call outcome on the session.
    async fn report_status(&self, status: &str, reason: &str) -> Result<()>;

    /// Runs the interrupt matcher; returns the matched rule id.
    fn check_for_interrupt(&self, text: &str) -> Option<String>;

    /// Sends the hangup frame that ends the call.
    async fn end_call(&self) -> Result<()>;
}

/// Tunables the engine inherits from the flow section of the app config.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How long a question waits for an answer.
    pub response_timeout: Duration,
    /// Minimum spacing between timer resets.
    pub timer_debounce: Duration,
    /// Pause after stopping audio so the last queued frames drain before the
    /// next prompt starts.
    pub stop_settle: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            timer_debounce: Duration::from_millis(500),
            stop_settle: Duration::from_millis(100),
        }
    }
}

enum Outcome {
    Goto(String),
    End(&'static str),
}

/// Interprets the dialog graph for one session.
///
/// Single-tasked per session: at any moment the call is in exactly one node,
/// and transitions are totally ordered.
pub struct FlowEngine {
    session: Arc<dyn FlowSession>,
    config: Arc<FlowConfig>,
    classifier: ResponseClassifier,
    timer: GlobalTimer,
    expiry_rx: Option<mpsc::Receiver<u64>>,
    campaign: Option<Arc<CampaignClient>>,
    logger: Option<Arc<SessionLogger>>,
    settle: Duration,
    /// Reason code set by interrupts or deferred actions, reported once at
    /// the terminal node.
    pending_reason: Option<String>,
    /// True once an explicit end_call action already reported the hangup.
    hangup_reported: bool,
}

impl FlowEngine {
    pub fn new(
        session: Arc<dyn FlowSession>,
        config: Arc<FlowConfig>,
        campaign: Option<Arc<CampaignClient>>,
        logger: Option<Arc<SessionLogger>>,
        options: EngineOptions,
    ) -> Self {
        let (timer, expiry_rx) = GlobalTimer::new(options.response_timeout, options.timer_debounce);
        Self {
            session,
            config,
            classifier: ResponseClassifier::new(),
            timer,
            expiry_rx: Some(expiry_rx),
            campaign,
            logger,
            settle: options.stop_settle,
            pending_reason: None,
            hangup_reported: false,
        }
    }

    /// Runs the flow from the `start` node until a terminal node.
    pub async fn run(mut self) -> Result<()> {
        let session_id = self.session.id();
        info!(
            "Flow '{}' v{} started for session {}",
            self.config.metadata.name, self.config.metadata.version, session_id
        );
        if let Some(log) = &self.logger {
            log.flow_start(
                &session_id,
                &self.config.metadata.name,
                &self.config.metadata.version,
            );
        }

        let mut expiry_rx = self.expiry_rx.take().expect("run called once");
        // A session without a transcript stream still runs the flow; its
        // questions all resolve by timeout.
        let (mut results, mut results_open) = match self.session.take_transcription_results() {
            Some(rx) => (rx, true),
            None => {
                let (tx, rx) = mpsc::channel(1);
                drop(tx);
                (rx, false)
            }
        };

        let mut current = self.config.start_node().id.clone();
        loop {
            let node = match self.config.node(&current) {
                Some(node) => node.clone(),
                None => bail!("flow node {} disappeared", current),
            };
            info!("Executing node: {} (type: {:?})", node.id, node.node_type);
            if let Some(log) = &self.logger {
                log.node_start(&session_id, &node);
            }

            let outcome = match node.node_type {
                NodeType::Audio => self.run_audio_node(&node)?,
                NodeType::Question => {
                    self.run_question_node(&node, &mut results, &mut results_open, &mut expiry_rx)
                        .await?
                }
                NodeType::Transfer => self.run_transfer_node(&node).await,
                NodeType::Hangup => self.run_hangup_node(&node).await,
                NodeType::Interrupt => self.run_interrupt_node(&node).await,
            };

            match outcome {
                Outcome::Goto(next) => current = next,
                Outcome::End(reason) => {
                    info!("Flow ended for session {} ({})", session_id, reason);
                    if let Some(log) = &self.logger {
                        log.flow_end(&session_id, reason);
                        log.close();
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Plays the prompt without blocking and transitions immediately.
    fn run_audio_node(&self, node: &FlowNode) -> Result<Outcome> {
        self.spawn_playback(node);
        match node.transitions.get("default") {
            Some(next) => Ok(Outcome::Goto(next.clone())),
            None => bail!("audio node {} has no default transition", node.id),
        }
    }

    /// Plays the prompt, arms the timer, and waits for an answer, an
    /// interrupt, or the timeout.
    async fn run_question_node(
        &mut self,
        node: &FlowNode,
        results: &mut mpsc::Receiver<TranscriptionResult>,
        results_open: &mut bool,
        expiry_rx: &mut mpsc::Receiver<u64>,
    ) -> Result<Outcome> {
        self.spawn_playback(node);
        self.timer.start();
        info!("Waiting for response to: {} (Node: {})", node.content, node.id);

        loop {
            tokio::select! {
                maybe = results.recv(), if *results_open => {
                    let result = match maybe {
                        Some(result) => result,
                        None => {
                            warn!("Transcription stream ended; question will resolve by timeout");
                            *results_open = false;
                            continue;
                        }
                    };

                    if !result.is_final {
                        // Substantial partials show real speech in progress
                        // and earn the caller more time; blips do not.
                        if self.timer.is_active() && result.text.len() > PARTIAL_RESET_MIN_CHARS {
                            self.timer.reset();
                        }
                        continue;
                    }

                    if let Some(outcome) = self.handle_final(node, &result.text).await {
                        return Ok(outcome);
                    }
                }
                Some(generation) = expiry_rx.recv() => {
                    if !self.timer.acknowledge(generation) {
                        continue;
                    }
                    return Ok(self.handle_timeout(node).await);
                }
            }
        }
    }

    /// Processes one final transcript; None keeps the question waiting.
    async fn handle_final(&mut self, node: &FlowNode, text: &str) -> Option<Outcome> {
        let session_id = self.session.id();

        if let Some(kind) = self.session.check_for_interrupt(text) {
            info!(
                "Q&A INTERRUPT - Question: {} | Answer: {} | Interrupt: {} | Node: {}",
                node.content, text, kind, node.id
            );
            if let Some(log) = &self.logger {
                log.interrupt(&session_id, node, text, &kind);
            }

            // Locate the interrupt node before tearing the question down; a
            // missing node leaves the flow where it is.
            if self.config.node(&kind).is_none() {
                warn!("Interrupt node {} not found in flow configuration", kind);
                return None;
            }

            self.pending_reason = Some(reason_for_interrupt(&kind).to_string());
            self.timer.stop();
            self.stop_playback_and_settle().await;
            return Some(Outcome::Goto(kind));
        }

        let label = self.classifier.classify(text).as_label();
        info!(
            "Q&A LOG - Question: {} | Answer: {} | Classification: {} | Node: {}",
            node.content, text, label, node.id
        );
        if let Some(log) = &self.logger {
            log.qna(&session_id, node, text, label);
        }

        let next = node
            .transitions
            .get(label)
            .or_else(|| node.transitions.get("default"))
            .cloned()?;

        self.stop_playback_and_settle().await;
        self.timer.stop();
        if let Some(log) = &self.logger {
            log.transition(&session_id, node, &next, label);
        }
        Some(Outcome::Goto(next))
    }

    async fn handle_timeout(&mut self, node: &FlowNode) -> Outcome {
        info!(
            "Q&A TIMEOUT - Question: {} | Node: {}",
            node.content, node.id
        );
        if let Some(log) = &self.logger {
            log.timeout(&self.session.id(), node);
        }

        self.stop_playback_and_settle().await;

        let next = node
            .transitions
            .get("timeout")
            .cloned()
            .unwrap_or_else(|| END_CALL_NODE.to_string());
        if self.config.node(&next).is_none() {
            warn!("Timeout target {} not found; ending flow", next);
            return Outcome::End("timeout");
        }
        Outcome::Goto(next)
    }

    /// Transfer hands the call to a live agent: the flow ends but the call
    /// continues.
    async fn run_transfer_node(&mut self, node: &FlowNode) -> Outcome {
        self.play_blocking(node).await;
        self.session.stop_transcription().await;
        self.execute_actions(node).await;
        self.report_transfer().await;

        if let Some(log) = &self.logger {
            let destination = self
                .campaign
                .as_ref()
                .map(|c| c.transfer_phone().to_string())
                .unwrap_or_default();
            log.transfer(&self.session.id(), &destination);
        }
        Outcome::End("transfer")
    }

    async fn run_hangup_node(&mut self, node: &FlowNode) -> Outcome {
        self.play_blocking(node).await;
        self.execute_actions(node).await;

        if !self.hangup_reported {
            let reason = self
                .pending_reason
                .clone()
                .unwrap_or_else(|| DEFAULT_HANGUP_REASON.to_string());
            self.report_hangup(&reason).await;
        }

        if let Some(log) = &self.logger {
            log.hangup(&self.session.id());
        }
        if let Err(err) = self.session.end_call().await {
            warn!("Failed to send hangup command: {:#}", err);
        }
        Outcome::End("hangup")
    }

    async fn run_interrupt_node(&mut self, node: &FlowNode) -> Outcome {
        self.play_blocking(node).await;
        self.execute_actions(node).await;

        match node.transitions.get("default") {
            Some(next) => Outcome::Goto(next.clone()),
            None => Outcome::End("interrupt"),
        }
    }

    async fn execute_actions(&mut self, node: &FlowNode) {
        for action in &node.actions {
            match action.action_type {
                ActionType::ApiCall => self.execute_api_call(action).await,
                ActionType::Log => info!("Log action: {}", action.message),
                ActionType::Transfer => info!(
                    "Transfer action: destination={}, timeout={}",
                    action.endpoint, action.timeout
                ),
            }
        }
    }

    async fn execute_api_call(&mut self, action: &super::config::Action) {
        let session_id = self.session.id();
        match action.endpoint.as_str() {
            // These outcomes are reported exactly once, at the terminal
            // node; the action only records the reason.
            "/add_to_dnc" => self.defer_reason("DNC", &action.endpoint),
            "/mark_not_interested" => self.defer_reason("NI", &action.endpoint),
            "/schedule_callback" => self.defer_reason("CALLBK", &action.endpoint),
            "/transfer_call" => self.report_transfer().await,
            "/end_call" => {
                let reason = self
                    .pending_reason
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HANGUP_REASON.to_string());
                self.report_hangup(&reason).await;
                self.hangup_reported = true;
            }
            endpoint => {
                let Some(campaign) = &self.campaign else {
                    warn!("No campaign client configured; skipping API call {}", endpoint);
                    return;
                };
                let mut params = action.params.clone();
                params.insert("session_id".to_string(), session_id.clone());
                let status = match campaign.generic_call(endpoint, &params).await {
                    Ok(()) => {
                        info!("API call successful: {} {}", action.method, endpoint);
                        "ok"
                    }
                    Err(err) => {
                        warn!("API call failed: {} - {:#}", endpoint, err);
                        "error"
                    }
                };
                if let Some(log) = &self.logger {
                    log.api_call(&session_id, endpoint, status);
                }
            }
        }
    }

    fn defer_reason(&mut self, reason: &str, endpoint: &str) {
        info!("Deferred outcome {} from action {}", reason, endpoint);
        self.pending_reason = Some(reason.to_string());
        if let Some(log) = &self.logger {
            log.api_call(&self.session.id(), endpoint, "deferred");
        }
    }

    async fn report_hangup(&self, reason: &str) {
        let session_id = self.session.id();
        if let Err(err) = self.session.report_status("HANGUP", reason).await {
            warn!("Failed to record hangup status: {:#}", err);
        }

        let Some(campaign) = &self.campaign else {
            return;
        };
        let status = match campaign
            .ra_call_control_by_session(&session_id, "HANGUP", reason, "")
            .await
        {
            Ok(()) => "ok",
            Err(err) => {
                warn!("Campaign hangup report failed: {:#}", err);
                "error"
            }
        };
        if let Some(log) = &self.logger {
            log.api_call(&session_id, "ra_call_control/HANGUP", status);
        }

        if let Err(err) = campaign
            .update_lead_status_by_session(&session_id, reason)
            .await
        {
            warn!("Lead status update failed: {:#}", err);
        }
        if let Err(err) = campaign
            .update_log_entry_by_session(&session_id, reason)
            .await
        {
            warn!("Log entry update failed: {:#}", err);
        }
    }

    async fn report_transfer(&self) {
        let session_id = self.session.id();
        let Some(campaign) = &self.campaign else {
            warn!("No campaign client configured; transfer not reported");
            return;
        };
        let status = campaign.transfer_status().to_string();
        let phone = campaign.transfer_phone().to_string();

        if let Err(err) = self.session.report_status("EXTENSIONTRANSFER", &status).await {
            warn!("Failed to record transfer status: {:#}", err);
        }

        let outcome = match campaign
            .ra_call_control_by_session(&session_id, "EXTENSIONTRANSFER", &status, &phone)
            .await
        {
            Ok(()) => "ok",
            Err(err) => {
                warn!("Campaign transfer report failed: {:#}", err);
                "error"
            }
        };
        if let Some(log) = &self.logger {
            log.api_call(&session_id, "ra_call_control/EXTENSIONTRANSFER", outcome);
        }

        if let Err(err) = campaign
            .update_lead_status_by_session(&session_id, &status)
            .await
        {
            warn!("Lead status update failed: {:#}", err);
        }
        if let Err(err) = campaign
            .update_log_entry_by_session(&session_id, &status)
            .await
        {
            warn!("Log entry update failed: {:#}", err);
        }
    }

    /// Kicks off playback in the background; audio and question nodes never
    /// wait for the prompt to finish.
    fn spawn_playback(&self, node: &FlowNode) {
        let Some(name) = node.audio_file.clone() else {
            return;
        };
        info!("Playing audio: {} - {}", name, node.content);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            if let Err(err) = session.play_audio(&name).await {
                warn!("Failed to play audio {}: {:#}", name, err);
            }
        });
    }

    /// Plays a terminal prompt to completion before the node's side effects.
    async fn play_blocking(&self, node: &FlowNode) {
        let Some(name) = &node.audio_file else {
            return;
        };
        info!("Playing audio: {} - {}", name, node.content);
        if let Err(err) = self.session.play_audio(name).await {
            warn!("Failed to play audio {}: {:#}", name, err);
        }
    }

    async fn stop_playback_and_settle(&self) {
        self.session.stop_audio();
        tokio::time::sleep(self.settle).await;
    }
}

/// Maps an interrupt rule id to the reason code reported to the campaign.
fn reason_for_interrupt(kind: &str) -> &'static str {
    match kind {
        "dnc" => "DNC",
        "not_interested" => "NI",
        "robot" => "DNQ",
        "amd" => "A",
        "callback" => "CALLBK",
        _ => "DNQ",
    }
}
