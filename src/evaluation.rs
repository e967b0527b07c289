use crate::config::ModelSettings;
use crate::error::{EvalError, Result};
use crate::models::{ChatMessage, ContentPart, ModelReply, ModelRequest, Role, TokenUsage};
use anyhow::Context;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    ImageUrlArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// The model service as seen by the evaluation core
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one request. Every transport or service failure is a `ServerError`.
    async fn generate(&self, request: ModelRequest) -> Result<ModelReply>;
}

/// Minimum spacing between request starts, shared by every worker holding it
#[derive(Debug, Default)]
pub struct RateLimiter {
    rate_limit_rps: f64,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(rate_limit_rps: f64) -> Self {
        Self {
            rate_limit_rps,
            last_request: Mutex::new(None),
        }
    }

    /// Wait for the next request slot
    pub async fn acquire(&self) {
        let mut last_request = self.last_request.lock().await;
        enforce_rate_limit(&mut last_request, self.rate_limit_rps).await;
    }
}

/// Enforce rate limiting for API requests
async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
    if rate_limit_rps <= 0.0 {
        return;
    }

    let min_interval = Duration::from_secs_f64(1.0 / rate_limit_rps);

    if let Some(last_time) = *last_request {
        let elapsed = last_time.elapsed();
        if elapsed < min_interval {
            let sleep_duration = min_interval - elapsed;
            sleep(sleep_duration).await;
        }
    }

    *last_request = Some(Instant::now());
}

/// Model client for OpenAI-compatible chat completion endpoints
pub struct Evaluator {
    client: Client<OpenAIConfig>,
    limiter: RateLimiter,
}

impl Evaluator {
    /// Create an evaluator reading the API key from the configured environment variable
    pub fn from_settings(settings: &ModelSettings) -> anyhow::Result<Self> {
        let api_key = std::env::var(&settings.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", settings.env_var_api_key))?;
        Ok(Self::new(settings, api_key))
    }

    pub fn new(settings: &ModelSettings, api_key: impl Into<String>) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&settings.api_endpoint);

        Self {
            client: Client::with_config(openai_config),
            limiter: RateLimiter::new(settings.rate_limit_rps),
        }
    }

    /// Build the chat completion request
    fn build_request(&self, request: &ModelRequest) -> Result<CreateChatCompletionRequest> {
        let messages = request
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>>>()?;

        CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(messages)
            .temperature(request.temperature as f32)
            .max_tokens(request.max_tokens)
            .build()
            .map_err(server_error)
    }

    /// Extract the reply text and usage from the API response
    fn extract_reply(response: CreateChatCompletionResponse) -> ModelReply {
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let usage = response
            .usage
            .map(|usage| TokenUsage {
                prompt_token_count: u64::from(usage.prompt_tokens),
                candidates_token_count: u64::from(usage.completion_tokens),
                thoughts_token_count: 0,
            })
            .unwrap_or_default();

        ModelReply { content, usage }
    }
}

#[async_trait]
impl ModelClient for Evaluator {
    async fn generate(&self, request: ModelRequest) -> Result<ModelReply> {
        self.limiter.acquire().await;

        let api_request = self.build_request(&request)?;
        let response = self
            .client
            .chat()
            .create(api_request)
            .await
            .map_err(server_error)?;

        Ok(Self::extract_reply(response))
    }
}

fn server_error(err: impl std::fmt::Display) -> EvalError {
    EvalError::ServerError(err.to_string())
}

fn convert_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let message = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.joined_text())
            .build()
            .map_err(server_error)?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.joined_text())
            .build()
            .map_err(server_error)?
            .into(),
        Role::User => {
            let parts = message
                .content
                .iter()
                .map(convert_part)
                .collect::<Result<Vec<_>>>()?;
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Array(parts))
                .build()
                .map_err(server_error)?
                .into()
        }
    };
    Ok(message)
}

fn convert_part(part: &ContentPart) -> Result<ChatCompletionRequestUserMessageContentPart> {
    let part = match part {
        ContentPart::Text { text } => ChatCompletionRequestMessageContentPartTextArgs::default()
            .text(text.as_str())
            .build()
            .map_err(server_error)?
            .into(),
        ContentPart::PngImage { data } => {
            let image_url = ImageUrlArgs::default()
                .url(format!("data:image/png;base64,{data}"))
                .build()
                .map_err(server_error)?;
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(image_url)
                .build()
                .map_err(server_error)?
                .into()
        }
    };
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mockito::Server;

    fn settings_for(url: &str) -> ModelSettings {
        ModelSettings {
            api_endpoint: url.to_string(),
            env_var_api_key: "WEBDEV_TEST_UNSET_KEY".to_string(),
            rate_limit_rps: 0.0,
            ..ModelSettings::default()
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "judge".to_string(),
            messages: vec![
                ChatMessage::system("You are a judge."),
                ChatMessage {
                    role: Role::User,
                    content: vec![
                        ContentPart::Text {
                            text: "Judge this page.".to_string(),
                        },
                        ContentPart::PngImage {
                            data: "iVBORw0KGgo=".to_string(),
                        },
                    ],
                },
            ],
            max_tokens: 128,
            temperature: 0.3,
        }
    }

    #[tokio::test]
    async fn test_enforce_rate_limit_no_limit() {
        let mut last_request = None;
        let start = Instant::now();

        enforce_rate_limit(&mut last_request, 0.0).await;

        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(last_request.is_none());
    }

    #[tokio::test]
    async fn test_enforce_rate_limit_first_request() {
        let mut last_request = None;
        let start = Instant::now();

        enforce_rate_limit(&mut last_request, 10.0).await;

        assert!(start.elapsed() < Duration::from_millis(10)); // Should not sleep on first request
        assert!(last_request.is_some());
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(100.0);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(8));
    }

    #[test]
    fn test_from_settings_missing_env_var() {
        let settings = settings_for("http://localhost");
        let result = Evaluator::from_settings(&settings);
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_generate_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"model": "judge", "max_tokens": 128}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1700000000,
                    "model": "judge",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "```json\n{}\n```"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 49}
                }"#,
            )
            .create_async()
            .await;

        let evaluator = Evaluator::new(&settings_for(&server.url()), "test-key");
        let reply = evaluator.generate(request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply.content, "```json\n{}\n```");
        assert_eq!(reply.usage.prompt_token_count, 42);
        assert_eq!(reply.usage.candidates_token_count, 7);
        assert_eq!(reply.usage.thoughts_token_count, 0);
    }

    #[tokio::test]
    async fn test_generate_bad_request_is_server_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"error": {"message": "bad request", "type": "invalid_request_error", "param": null, "code": null}}"#,
            )
            .create_async()
            .await;

        let evaluator = Evaluator::new(&settings_for(&server.url()), "test-key");
        let err = evaluator.generate(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
    }
}

/// Scripted model clients for orchestration tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays a fixed list of replies, then repeats the fallback
    pub(crate) struct ScriptedClient {
        replies: StdMutex<VecDeque<Result<String>>>,
        fallback: Result<String>,
        pub(crate) requests: StdMutex<Vec<ModelRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(replies: Vec<Result<String>>, fallback: Result<String>) -> Self {
            Self {
                replies: StdMutex::new(replies.into()),
                fallback,
                requests: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn always(reply: impl Into<String>) -> Self {
            Self::new(Vec::new(), Ok(reply.into()))
        }

        pub(crate) fn temperatures(&self) -> Vec<f64> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.temperature)
                .collect()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn generate(&self, request: ModelRequest) -> Result<ModelReply> {
            self.requests.lock().unwrap().push(request);
            let next = self.replies.lock().unwrap().pop_front();
            let content = next.unwrap_or_else(|| self.fallback.clone())?;
            Ok(ModelReply {
                content,
                usage: TokenUsage {
                    prompt_token_count: 10,
                    candidates_token_count: 2,
                    thoughts_token_count: 0,
                },
            })
        }
    }

    /// Answers by looking at the request, for tests where order is not fixed
    pub(crate) struct FnClient<F>(pub(crate) F);

    #[async_trait]
    impl<F> ModelClient for FnClient<F>
    where
        F: Fn(&ModelRequest) -> Result<String> + Send + Sync,
    {
        async fn generate(&self, request: ModelRequest) -> Result<ModelReply> {
            let content = (self.0)(&request)?;
            Ok(ModelReply {
                content,
                usage: TokenUsage {
                    prompt_token_count: 1,
                    candidates_token_count: 1,
                    thoughts_token_count: 0,
                },
            })
        }
    }
}
