use anyhow::{bail, Context, Result};
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Budget for a campaign API round trip.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for resolving one session variable from Redis.
const SESSION_VAR_TIMEOUT: Duration = Duration::from_millis(800);

/// Campaign/CRM connection settings (Vicidial-shaped API).
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    pub server_url: String,
    pub admin_dir: String,
    pub api_user: String,
    pub api_pass: String,
    /// `source` parameter for agent-API (`ra_call_control`) calls.
    pub source_ra: String,
    /// `source` parameter for non-agent-API calls.
    pub source_admin: String,
    /// Lead status to report on transfer, e.g. "LVXFER".
    pub transfer_status: String,
    /// Extension the transfer stage hands the call to, e.g. "26000".
    pub transfer_phone: String,
    pub redis_url: String,
    /// Session-variable keys are `<prefix><session_uuid>`.
    #[serde(default)]
    pub redis_prefix: String,
}

/// Outbound client for campaign call-control and lead bookkeeping.
///
/// All calls are GETs with query parameters; a non-2xx status is an error.
/// Failures here are boundary errors: callers log them and the dialog
/// continues regardless.
pub struct CampaignClient {
    config: CampaignConfig,
    http: reqwest::Client,
    redis: redis::Client,
}

impl CampaignClient {
    pub fn new(mut config: CampaignConfig) -> Result<Self> {
        config.server_url = config.server_url.trim_end_matches('/').to_string();
        config.admin_dir = config.admin_dir.trim_matches('/').to_string();

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build campaign http client")?;
        let redis = redis::Client::open(config.redis_url.as_str())
            .context("failed to configure redis client")?;

        Ok(Self { config, http, redis })
    }

    pub fn transfer_status(&self) -> &str {
        &self.config.transfer_status
    }

    pub fn transfer_phone(&self) -> &str {
        &self.config.transfer_phone
    }

    /// Resolves one session variable (`lead_id`, `display`, `campaign_id`)
    /// from the Redis hash keyed by the session UUID.
    async fn session_var(&self, session_id: &str, field: &str) -> Result<String> {
        let key = format!("{}{}", self.config.redis_prefix, session_id);
        let lookup = async {
            let mut conn = self
                .redis
                .get_multiplexed_async_connection()
                .await
                .context("redis connect failed")?;
            let value: Option<String> = conn
                .hget(&key, field)
                .await
                .with_context(|| format!("redis HGET {} {} failed", key, field))?;
            match value {
                Some(value) if !value.is_empty() => Ok(value),
                _ => bail!("redis HGET {} {}: empty", key, field),
            }
        };
        tokio::time::timeout(SESSION_VAR_TIMEOUT, lookup)
            .await
            .with_context(|| format!("redis HGET {} {} timed out", key, field))?
    }

    /// `ra_call_control` with ids resolved from session variables. The agent
    /// user comes from the lead record; when unavailable the call is still
    /// made with an empty agent user.
    pub async fn ra_call_control_by_session(
        &self,
        session_id: &str,
        stage: &str,
        status: &str,
        phone_number: &str,
    ) -> Result<()> {
        let lead_id = self.session_var(session_id, "lead_id").await?;
        let agent_user = self.agent_user_by_lead(&lead_id).await.unwrap_or_default();
        let display = self.session_var(session_id, "display").await?;
        self.ra_call_control(&agent_user, stage, status, &display, phone_number)
            .await
    }

    pub async fn update_lead_status_by_session(
        &self,
        session_id: &str,
        status: &str,
    ) -> Result<()> {
        let lead_id = self.session_var(session_id, "lead_id").await?;
        self.update_lead_status(&lead_id, status).await
    }

    pub async fn update_log_entry_by_session(
        &self,
        session_id: &str,
        status: &str,
    ) -> Result<()> {
        let campaign_id = self.session_var(session_id, "campaign_id").await?;
        let call_id = self.session_var(session_id, "display").await?;
        self.update_log_entry(&campaign_id, &call_id, status).await
    }

    /// `{server}/agc/api.php?function=ra_call_control&...`
    pub async fn ra_call_control(
        &self,
        agent_user: &str,
        stage: &str,
        status: &str,
        display: &str,
        phone_number: &str,
    ) -> Result<()> {
        let url = format!("{}/agc/api.php", self.config.server_url);
        let mut params = vec![
            ("source", self.config.source_ra.as_str()),
            ("user", self.config.api_user.as_str()),
            ("pass", self.config.api_pass.as_str()),
            ("agent_user", agent_user),
            ("function", "ra_call_control"),
            ("stage", stage),
            ("status", status),
            ("value", display),
        ];
        if !phone_number.is_empty() {
            params.push(("phone_number", phone_number));
        }
        self.get(&url, &params).await
    }

    /// `{server}/{admin_dir}/non_agent_api.php?function=update_lead&...`
    pub async fn update_lead_status(&self, lead_id: &str, status: &str) -> Result<()> {
        let url = self.non_agent_url();
        let params = [
            ("source", self.config.source_admin.as_str()),
            ("user", self.config.api_user.as_str()),
            ("pass", self.config.api_pass.as_str()),
            ("function", "update_lead"),
            ("lead_id", lead_id),
            ("status", status),
        ];
        self.get(&url, &params).await
    }

    /// `{server}/{admin_dir}/non_agent_api.php?function=update_log_entry&...`
    pub async fn update_log_entry(
        &self,
        campaign_id: &str,
        call_id: &str,
        status: &str,
    ) -> Result<()> {
        let url = self.non_agent_url();
        let params = [
            ("source", self.config.source_ra.as_str()),
            ("user", self.config.api_user.as_str()),
            ("pass", self.config.api_pass.as_str()),
            ("function", "update_log_entry"),
            ("group", campaign_id),
            ("call_id", call_id),
            ("status", status),
        ];
        self.get(&url, &params).await
    }

    /// Queries the campaign API for the agent user handling a lead; the body
    /// of `lead_field_info` is the bare value.
    pub async fn agent_user_by_lead(&self, lead_id: &str) -> Result<String> {
        if lead_id.trim().is_empty() {
            bail!("lead id is empty");
        }
        let url = self.non_agent_url();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("source", self.config.source_admin.as_str()),
                ("user", self.config.api_user.as_str()),
                ("pass", self.config.api_pass.as_str()),
                ("function", "lead_field_info"),
                ("lead_id", lead_id),
                ("field_name", "user"),
                ("custom_fields", "N"),
                ("archived_lead", "N"),
            ])
            .send()
            .await
            .context("lead_field_info request failed")?;
        if !response.status().is_success() {
            bail!("lead_field_info returned status {}", response.status());
        }
        let body = response.text().await.context("lead_field_info body read failed")?;
        Ok(body.trim().to_string())
    }

    /// Fires a free-form endpoint configured in a flow action.
    pub async fn generic_call(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> Result<()> {
        let url = format!("{}{}", self.config.server_url, endpoint);
        let params: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.get(&url, &params).await
    }

    fn non_agent_url(&self) -> String {
        format!(
            "{}/{}/non_agent_api.php",
            self.config.server_url, self.config.admin_dir
        )
    }

    async fn get(&self, url: &str, params: &[(&str, &str)]) -> Result<()> {
        debug!("Campaign API call: {} {:?}", url, params);
        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        if !response.status().is_success() {
            bail!("unexpected status {} from {}", response.status(), url);
        }
        Ok(())
    }
}
