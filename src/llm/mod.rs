pub mod normalize;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{repository, Database};

const SYSTEM_PROMPT: &str =
    "You are an activity report analyzer. Always respond with valid JSON only.";

/// A completed model response. `truncated` is set when the provider stopped
/// at the token limit, which usually means the JSON tail is missing.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub truncated: bool,
}

/// Narrow seam to the language model so the report engine can be exercised
/// against a fake in tests.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// OpenAI-compatible API base, e.g. `http://localhost:1234/v1`.
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1234/v1".to_string(),
            model: "local-model".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat-completions client with bounded retry. Connection failures, timeouts
/// and 5xx responses are retried with exponential backoff; 4xx responses fail
/// immediately.
pub struct ChatGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl ChatGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::GatewayUnavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        )
    }

    async fn send_once(&self, prompt: &str) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::GatewayUnavailable(format!(
                "model endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            // Client errors are terminal, handled by the caller without retry.
            let text = response.text().await.unwrap_or_default();
            return Err(Error::GatewayUnavailable(format!(
                "model endpoint rejected request: {status} {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::GatewayUnavailable(format!("malformed completion body: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::GatewayUnavailable("completion had no choices".into()))?;
        let truncated = choice.finish_reason.as_deref() == Some("length");
        if truncated {
            log::warn!("model response truncated at max_tokens");
        }
        Ok(Completion {
            text: choice.message.content,
            truncated,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::GatewayTimeout(e.to_string())
    } else {
        Error::GatewayUnavailable(e.to_string())
    }
}

/// Transport failures and 5xx are worth retrying; a 4xx rejection or a
/// malformed success body will not improve on a second attempt.
fn is_retryable(err: &Error) -> bool {
    match err {
        Error::GatewayTimeout(_) => true,
        Error::GatewayUnavailable(msg) => {
            !msg.starts_with("model endpoint rejected")
                && !msg.starts_with("malformed completion")
                && !msg.starts_with("completion had no choices")
        }
        _ => false,
    }
}

#[async_trait]
impl Gateway for ChatGateway {
    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_attempts {
            match self.send_once(prompt).await {
                Ok(completion) => return Ok(completion),
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(err);
                    }
                    log::warn!(
                        "gateway attempt {attempt}/{} failed: {err}",
                        self.config.max_attempts
                    );
                    last_err = Some(err);
                    if attempt < self.config.max_attempts {
                        let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::GatewayUnavailable("gateway attempts exhausted".into())))
    }
}

/// Build the production gateway from `app_config` settings, falling back to
/// the LM Studio defaults for anything unset.
pub async fn create_gateway(db: &Database) -> Result<ChatGateway> {
    let settings = db
        .reader()
        .call(|conn| {
            let endpoint = repository::get_config(conn, "llm_endpoint")?;
            let model = repository::get_config(conn, "llm_model")?;
            let temperature = repository::get_config(conn, "llm_temperature")?;
            let max_tokens = repository::get_config(conn, "llm_max_tokens")?;
            Ok::<_, rusqlite::Error>((endpoint, model, temperature, max_tokens))
        })
        .await?;

    let mut config = GatewayConfig::default();
    if let Some(endpoint) = settings.0 {
        config.endpoint = endpoint;
    }
    if let Some(model) = settings.1 {
        config.model = model;
    }
    if let Some(temperature) = settings.2 {
        config.temperature = temperature
            .parse()
            .map_err(|_| Error::Config(format!("invalid llm_temperature: {temperature}")))?;
    }
    if let Some(max_tokens) = settings.3 {
        config.max_tokens = max_tokens
            .parse()
            .map_err(|_| Error::Config(format!("invalid llm_max_tokens: {max_tokens}")))?;
    }
    ChatGateway::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn test_config(endpoint: String) -> GatewayConfig {
        GatewayConfig {
            endpoint,
            timeout: Duration::from_secs(5),
            base_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn completion_body(content: &str, finish_reason: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish_reason
            }]
        })
    }

    #[tokio::test]
    async fn test_sends_chat_request_and_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("{\"ok\":true}", "stop")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gateway = ChatGateway::new(test_config(format!("{}/v1", server.uri()))).unwrap();
        let completion = gateway.complete("summarize this").await.unwrap();
        assert_eq!(completion.text, "{\"ok\":true}");
        assert!(!completion.truncated);
    }

    struct FailThenSucceed {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _req: &Request) -> ResponseTemplate {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200).set_body_json(completion_body("{}", "stop"))
            }
        }
    }

    #[tokio::test]
    async fn test_retries_server_errors_until_success() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(FailThenSucceed {
                calls: calls.clone(),
                failures: 2,
            })
            .expect(3)
            .mount(&server)
            .await;

        let gateway = ChatGateway::new(test_config(format!("{}/v1", server.uri()))).unwrap();
        let completion = gateway.complete("prompt").await.unwrap();
        assert_eq!(completion.text, "{}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let gateway = ChatGateway::new(test_config(format!("{}/v1", server.uri()))).unwrap();
        let err = gateway.complete("prompt").await.unwrap_err();
        assert!(matches!(err, Error::GatewayUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = ChatGateway::new(test_config(format!("{}/v1", server.uri()))).unwrap();
        let err = gateway.complete("prompt").await.unwrap_err();
        assert!(matches!(err, Error::GatewayUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_truncated_completion_is_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("{\"partial\":", "length")),
            )
            .mount(&server)
            .await;

        let gateway = ChatGateway::new(test_config(format!("{}/v1", server.uri()))).unwrap();
        let completion = gateway.complete("prompt").await.unwrap();
        assert!(completion.truncated);
    }
}
