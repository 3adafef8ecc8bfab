use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{error_from_response, JobGateway, PollResult};
use crate::config::{GatewayConfig, SpeechConfig};
use crate::error::GatewayError;
use crate::state::JobKind;

/// Request payload stored in a speech WorkItem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechSpec {
    pub lines: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceSettings {
    #[serde(default = "default_stability")]
    pub stability: f64,

    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f64,

    #[serde(default = "default_style")]
    pub style: f64,
}

fn default_stability() -> f64 {
    0.5
}

fn default_similarity_boost() -> f64 {
    0.75
}

fn default_style() -> f64 {
    0.4
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            style: default_style(),
        }
    }
}

impl SpeechSpec {
    pub fn from_value(spec: &Value) -> Result<Self, GatewayError> {
        serde_json::from_value(spec.clone()).map_err(|e| GatewayError::Validation(format!("invalid speech spec: {}", e)))
    }

    /// Text sent for synthesis: lines joined by single spaces
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

/// Text-to-speech client returning audio together with character alignment.
///
/// The service answers synchronously, so `submit` performs the whole call and
/// spools the response to disk under a content-derived job id. Poll and fetch
/// read the spool, so a later process resumes without synthesising again.
pub struct SpeechGateway {
    client: Client,
    base_url: String,
    api_key: String,
    default_voice_id: Option<String>,
    default_model_id: String,
    spool_dir: PathBuf,
}

impl SpeechGateway {
    pub fn new(gateway: &GatewayConfig, speech: &SpeechConfig, spool_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let api_key = gateway
            .speech_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("speech API key missing; set REEL_FORGE_ELEVENLABS_API_KEY"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(gateway.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(gateway.connect_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: gateway.speech_base_url.trim_end_matches('/').to_string(),
            api_key,
            default_voice_id: speech.default_voice_id.clone(),
            default_model_id: speech.model_id.clone(),
            spool_dir: spool_dir.into(),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Build the request body and resolve the voice; fails without network access
    pub fn prepare_request(&self, spec: &SpeechSpec) -> Result<(String, Value), GatewayError> {
        if spec.lines.iter().all(|l| l.trim().is_empty()) {
            return Err(GatewayError::Validation("speech request has no text".into()));
        }

        let voice_id = spec
            .voice_id
            .clone()
            .or_else(|| self.default_voice_id.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Validation("no voice_id in request or configuration".into()))?;

        let settings = spec.voice_settings.clone().unwrap_or_default();
        let body = json!({
            "text": spec.text(),
            "model_id": spec.model_id.clone().unwrap_or_else(|| self.default_model_id.clone()),
            "voice_settings": settings,
        });

        Ok((voice_id, body))
    }

    fn job_id_for(voice_id: &str, body: &Value) -> String {
        let digest = md5::compute(format!("{}|{}", voice_id, body));
        format!("tts-{:x}", digest)
    }

    /// Spool file for a job id; ids that could escape the spool map to `None`
    fn spool_path(&self, job_id: &str) -> Option<PathBuf> {
        let safe = !job_id.is_empty() && job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.spool_dir.join(format!("{}.json", job_id)))
    }

    async fn retain(&self, job_id: &str, payload: &[u8]) -> Result<(), GatewayError> {
        let path = self
            .spool_path(job_id)
            .ok_or_else(|| GatewayError::Validation(format!("invalid speech job id: {}", job_id)))?;
        let spool_error = |e: std::io::Error| GatewayError::transport(format!("speech spool {}: {}", path.display(), e));

        tokio::fs::create_dir_all(&self.spool_dir).await.map_err(spool_error)?;
        let partial = path.with_extension("json.tmp");
        tokio::fs::write(&partial, payload).await.map_err(spool_error)?;
        tokio::fs::rename(&partial, &path).await.map_err(spool_error)?;
        debug!("Spooled speech result {} to {}", job_id, path.display());
        Ok(())
    }

    async fn is_retained(&self, job_id: &str) -> bool {
        match self.spool_path(job_id) {
            Some(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }
}

#[async_trait]
impl JobGateway for SpeechGateway {
    async fn submit(&self, _kind: JobKind, spec: &Value) -> Result<String, GatewayError> {
        let spec = SpeechSpec::from_value(spec)?;
        let (voice_id, body) = self.prepare_request(&spec)?;
        let job_id = Self::job_id_for(&voice_id, &body);

        if self.is_retained(&job_id).await {
            info!("♻️ Reusing spooled speech result {}", job_id);
            return Ok(job_id);
        }

        info!("🎙️ Synthesising {} lines with voice {}", spec.lines.len(), voice_id);
        let response = self
            .client
            .post(format!("{}/v1/text-to-speech/{}/with-timestamps", self.base_url, voice_id))
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let payload = response.bytes().await?;
        let parsed: Value =
            serde_json::from_slice(&payload).map_err(|e| GatewayError::Malformed(format!("speech response: {}", e)))?;
        if parsed.get("audio_base64").and_then(Value::as_str).is_none() {
            return Err(GatewayError::Malformed("speech response has no audio_base64".into()));
        }

        self.retain(&job_id, &payload).await?;
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollResult, GatewayError> {
        if self.is_retained(job_id).await {
            Ok(PollResult::done(job_id))
        } else {
            Ok(PollResult::failed(format!(
                "speech result {} missing from {}; reset the item to resubmit",
                job_id,
                self.spool_dir.display()
            )))
        }
    }

    async fn fetch(&self, output_ref: &str) -> Result<Bytes, GatewayError> {
        let path = self
            .spool_path(output_ref)
            .ok_or_else(|| GatewayError::Validation(format!("invalid speech job id: {}", output_ref)))?;
        match tokio::fs::read(&path).await {
            Ok(payload) => Ok(Bytes::from(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GatewayError::RemoteFailure(format!(
                "no spooled speech result for {}",
                output_ref
            ))),
            Err(e) => Err(GatewayError::transport(format!("speech spool {}: {}", path.display(), e))),
        }
    }

    async fn release(&self, output_ref: &str) -> Result<(), GatewayError> {
        let Some(path) = self.spool_path(output_ref) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Released spooled speech result {}", output_ref);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("⚠️ Could not remove spooled speech result {}: {}", path.display(), e);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}
