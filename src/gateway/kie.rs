use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{error_from_response, JobGateway, PollResult};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::state::JobKind;

/// Multi-shot requests accept at most this many shots
pub const MAX_SHOTS: usize = 6;

/// Multi-shot requests accept at most this many seconds in total
pub const MAX_TOTAL_SECONDS: u32 = 15;

const CREATE_TASK_PATH: &str = "/api/v1/jobs/createTask";
const RECORD_INFO_PATH: &str = "/api/v1/jobs/recordInfo";

/// One shot of a multi-shot video request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shot {
    pub prompt: String,
    #[serde(deserialize_with = "duration_from_number_or_string")]
    pub duration: u32,
}

fn duration_from_number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Split shots into ordered groups that each fit the multi-shot limits
pub fn chunk_multi_shot(shots: &[Shot]) -> Vec<Vec<Shot>> {
    let mut groups: Vec<Vec<Shot>> = Vec::new();
    let mut current: Vec<Shot> = Vec::new();
    let mut current_seconds = 0u32;

    for shot in shots {
        let overflows = current.len() + 1 > MAX_SHOTS || current_seconds + shot.duration > MAX_TOTAL_SECONDS;
        if overflows && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_seconds = 0;
        }
        current_seconds += shot.duration;
        current.push(shot.clone());
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Extract the shot list of a multi-shot spec, if it is one
pub fn multi_shot_prompts(spec: &Value) -> Result<Option<Vec<Shot>>, GatewayError> {
    match spec.pointer("/input/multi_prompt") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| GatewayError::Validation(format!("invalid multi_prompt: {}", e))),
    }
}

/// Local multi-shot limit checks, run before any network call
pub fn validate_spec(spec: &Value) -> Result<(), GatewayError> {
    if !spec.is_object() {
        return Err(GatewayError::Validation("request spec must be a JSON object".into()));
    }

    if let Some(shots) = multi_shot_prompts(spec)? {
        if shots.is_empty() {
            return Err(GatewayError::Validation("multi-shot request without shots".into()));
        }
        if shots.len() > MAX_SHOTS {
            return Err(GatewayError::Validation(format!(
                "multi-shot supports max {} shots, got {}",
                MAX_SHOTS,
                shots.len()
            )));
        }
        let total: u32 = shots.iter().map(|s| s.duration).sum();
        if total > MAX_TOTAL_SECONDS {
            return Err(GatewayError::Validation(format!(
                "multi-shot supports max {}s total, got {}s",
                MAX_TOTAL_SECONDS, total
            )));
        }
    }

    Ok(())
}

/// Reject envelopes whose `code` is not 200
fn check_response_code(body: &Value) -> Result<(), GatewayError> {
    let code = match body.get("code").and_then(Value::as_i64) {
        Some(code) if code != 200 => code,
        _ => return Ok(()),
    };

    let message = body
        .get("msg")
        .or_else(|| body.get("message"))
        .or_else(|| body.get("error"))
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .unwrap_or_else(|| body.to_string());
    let message = format!("API error (code={}): {}", code, message);

    if code == 429 || code >= 500 {
        Err(GatewayError::Transport {
            status: u16::try_from(code).ok(),
            message,
            retry_after: None,
        })
    } else {
        Err(GatewayError::Validation(message))
    }
}

fn task_payload(body: &Value) -> &Value {
    match body.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => body,
    }
}

fn string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

pub(crate) fn parse_task_id(body: &Value) -> Result<String, GatewayError> {
    check_response_code(body)?;

    let inner = task_payload(body);
    string_field(inner, &["taskId", "task_id"])
        .or_else(|| string_field(body, &["taskId", "task_id"]))
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Malformed(format!("could not extract task id from {}", body)))
}

fn output_url(task: &Value) -> Option<String> {
    let from_result_json = match task.get("resultJson") {
        Some(Value::String(raw)) if !raw.is_empty() => serde_json::from_str::<Value>(raw).ok(),
        Some(obj @ Value::Object(_)) => Some(obj.clone()),
        _ => None,
    }
    .and_then(|result| {
        result
            .get("resultUrls")
            .and_then(Value::as_array)
            .and_then(|urls| urls.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    from_result_json.or_else(|| match task.get("output") {
        Some(output @ Value::Object(_)) => string_field(output, &["video_url", "image_url"]).map(str::to_string),
        Some(Value::String(url)) if !url.is_empty() => Some(url.clone()),
        _ => None,
    })
}

fn error_text(task: &Value) -> Option<String> {
    match task.get("error") {
        Some(Value::Object(err)) => {
            if let Some(message) = err.get("message").and_then(Value::as_str) {
                return Some(message.to_string());
            }
        }
        Some(Value::String(err)) if !err.is_empty() => return Some(err.clone()),
        _ => {}
    }
    string_field(task, &["failMsg"]).map(str::to_string)
}

pub(crate) fn parse_poll_result(body: &Value) -> Result<PollResult, GatewayError> {
    check_response_code(body)?;

    let task = task_payload(body);
    let raw_state = string_field(task, &["state", "status"]).unwrap_or("unknown");

    match raw_state {
        "success" | "completed" => output_url(task)
            .map(PollResult::done)
            .ok_or_else(|| GatewayError::Malformed(format!("task finished without an output url: {}", task))),
        "fail" | "failed" => Ok(PollResult::failed(
            error_text(task).unwrap_or_else(|| "remote job failed without a message".to_string()),
        )),
        "waiting" | "queuing" | "pending" | "generating" | "processing" => Ok(PollResult::pending()),
        other => {
            warn!("Unknown remote task state '{}', treating as pending", other);
            Ok(PollResult::pending())
        }
    }
}

/// Bearer-authenticated client for the image/video generation service
pub struct KieGateway {
    client: Client,
    download_client: Client,
    base_url: String,
    api_key: String,
}

impl KieGateway {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let api_key = config
            .media_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("media API key missing; set REEL_FORGE_KIE_API_KEY"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;

        let download_client = Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            download_client,
            base_url: config.media_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, GatewayError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl JobGateway for KieGateway {
    async fn submit(&self, kind: JobKind, spec: &Value) -> Result<String, GatewayError> {
        validate_spec(spec)?;

        debug!("POST {}{} ({})", self.base_url, CREATE_TASK_PATH, kind);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, CREATE_TASK_PATH))
            .bearer_auth(&self.api_key)
            .json(spec)
            .send()
            .await?;

        let body = Self::read_json(response).await?;
        let task_id = parse_task_id(&body)?;
        info!("🚀 Created {} task: {}", kind, task_id);
        Ok(task_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollResult, GatewayError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, RECORD_INFO_PATH))
            .query(&[("taskId", job_id)])
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let body = Self::read_json(response).await?;
        parse_poll_result(&body)
    }

    async fn fetch(&self, output_ref: &str) -> Result<Bytes, GatewayError> {
        debug!("Downloading {}", output_ref);
        let response = self.download_client.get(output_ref).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.bytes().await?)
    }

    fn name(&self) -> &'static str {
        "kie"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shot(prompt: &str, duration: u32) -> Shot {
        Shot {
            prompt: prompt.to_string(),
            duration,
        }
    }

    #[test]
    fn test_task_id_nested_and_flat() {
        assert_eq!(
            parse_task_id(&json!({"code": 200, "data": {"taskId": "abc"}})).unwrap(),
            "abc"
        );
        assert_eq!(parse_task_id(&json!({"data": {"task_id": "def"}})).unwrap(), "def");
        assert_eq!(parse_task_id(&json!({"taskId": "ghi"})).unwrap(), "ghi");
        assert!(matches!(
            parse_task_id(&json!({"code": 200, "data": {}})),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn test_envelope_code_mapping() {
        let rejected = parse_task_id(&json!({"code": 422, "msg": "bad prompt"})).unwrap_err();
        assert!(matches!(rejected, GatewayError::Validation(ref m) if m.contains("bad prompt")));

        let busy = parse_task_id(&json!({"code": 503, "msg": "busy"})).unwrap_err();
        assert!(busy.is_retryable());
    }

    #[test]
    fn test_poll_state_mapping() {
        for state in ["waiting", "queuing", "generating"] {
            let result = parse_poll_result(&json!({"data": {"state": state}})).unwrap();
            assert_eq!(result.status, super::super::PollStatus::Pending);
        }

        let done = parse_poll_result(&json!({
            "code": 200,
            "data": {"state": "success", "resultJson": "{\"resultUrls\": [\"https://cdn/x.mp4\"]}"}
        }))
        .unwrap();
        assert_eq!(done, PollResult::done("https://cdn/x.mp4"));

        let failed = parse_poll_result(&json!({"data": {"state": "fail", "failMsg": "nsfw"}})).unwrap();
        assert_eq!(failed, PollResult::failed("nsfw"));
    }

    #[test]
    fn test_output_fallbacks() {
        let from_output = parse_poll_result(&json!({
            "status": "completed",
            "output": {"image_url": "https://cdn/a.png"}
        }))
        .unwrap();
        assert_eq!(from_output.output_ref.as_deref(), Some("https://cdn/a.png"));

        let from_string = parse_poll_result(&json!({"status": "completed", "output": "https://cdn/b.mp4"})).unwrap();
        assert_eq!(from_string.output_ref.as_deref(), Some("https://cdn/b.mp4"));

        let err = parse_poll_result(&json!({"status": "failed", "error": {"message": "quota"}})).unwrap();
        assert_eq!(err.error.as_deref(), Some("quota"));

        assert!(matches!(
            parse_poll_result(&json!({"status": "success"})),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn test_multi_shot_limits() {
        let ok = json!({"input": {"multi_prompt": [{"prompt": "a", "duration": 5}, {"prompt": "b", "duration": "10"}]}});
        assert!(validate_spec(&ok).is_ok());

        let too_long = json!({"input": {"multi_prompt": [{"prompt": "a", "duration": 10}, {"prompt": "b", "duration": 6}]}});
        assert!(matches!(validate_spec(&too_long), Err(GatewayError::Validation(_))));

        let shots: Vec<Value> = (0..7).map(|i| json!({"prompt": format!("s{i}"), "duration": 1})).collect();
        let too_many = json!({"input": {"multi_prompt": shots}});
        assert!(matches!(validate_spec(&too_many), Err(GatewayError::Validation(_))));

        assert!(validate_spec(&json!({"input": {"prompt": "single"}})).is_ok());
    }

    #[test]
    fn test_chunk_multi_shot_respects_limits_in_order() {
        let shots = vec![
            shot("a", 5),
            shot("b", 5),
            shot("c", 5),
            shot("d", 3),
            shot("e", 2),
            shot("f", 1),
            shot("g", 1),
            shot("h", 1),
            shot("i", 1),
        ];

        let groups = chunk_multi_shot(&shots);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].iter().map(|s| s.prompt.as_str()).collect::<String>(), "abc");
        assert_eq!(groups[1].iter().map(|s| s.prompt.as_str()).collect::<String>(), "defghi");

        for group in &groups {
            assert!(group.len() <= MAX_SHOTS);
            assert!(group.iter().map(|s| s.duration).sum::<u32>() <= MAX_TOTAL_SECONDS);
        }
    }
}
