//! Google Gemini `generateContent` adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{FinishReason, ProviderAdapter, Request, Response, ResponseFormat, Role, Usage};
use sqlagent_types::AgentError;

const PROVIDER: &str = "google";
const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.response_mime_type.is_none()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: UsageMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GeminiAdapter {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Reads `GOOGLE_API_KEY`, falling back to `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, AgentError> {
        std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map(Self::new)
            .map_err(|_| AgentError::AuthError {
                provider: PROVIDER.into(),
            })
    }

    fn build_body<'a>(&self, request: &'a Request) -> GenerateContentRequest<'a> {
        let system: Vec<TextPart<'a>> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| TextPart { text: &m.content })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| Content {
                role: Some("user"),
                parts: vec![TextPart { text: &m.content }],
            })
            .collect();

        let config = GenerationConfig {
            temperature: request.temperature,
            response_mime_type: (request.response_format == ResponseFormat::Json)
                .then_some("application/json"),
        };

        GenerateContentRequest {
            contents,
            system_instruction: (!system.is_empty()).then_some(Content {
                role: None,
                parts: system,
            }),
            generation_config: (!config.is_empty()).then_some(config),
        }
    }

    fn parse_body(&self, body: &str, model: &str) -> Result<Response, AgentError> {
        let parsed: GenerateContentResponse =
            serde_json::from_str(body).map_err(|e| provider_error(0, format!("Malformed response: {e}")))?;

        let candidate = parsed
            .candidates
            .ok_or_else(|| provider_error(0, "Missing candidates in response"))?
            .into_iter()
            .next()
            .ok_or_else(|| provider_error(0, "Empty candidates array"))?;

        let finish_reason = match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("SAFETY") => FinishReason::Safety,
            Some("STOP_SEQUENCE") => FinishReason::StopSequence,
            _ => FinishReason::EndTurn,
        };

        let text = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
            .unwrap_or_default();

        let usage = parsed.usage_metadata;
        Ok(Response {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            usage: Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                total_tokens: usage
                    .total_token_count
                    .unwrap_or(usage.prompt_token_count + usage.candidates_token_count),
            },
            model: model.to_string(),
            finish_reason,
        })
    }
}

fn provider_error(status: u16, message: impl Into<String>) -> AgentError {
    AgentError::ProviderError {
        provider: PROVIDER.into(),
        status,
        message: message.into(),
    }
}

fn map_status(status: reqwest::StatusCode, body: &str) -> AgentError {
    match status.as_u16() {
        429 => AgentError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: 1000,
        },
        401 | 403 => AgentError::AuthError {
            provider: PROVIDER.into(),
        },
        code => {
            let message = serde_json::from_str::<ErrorEnvelope>(body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.to_string());
            provider_error(code, message)
        }
    }
}

fn map_transport(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::RequestTimeout {
            provider: PROVIDER.into(),
        }
    } else {
        provider_error(0, e.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn complete(&self, request: &Request) -> Result<Response, AgentError> {
        let model = if request.model.is_empty() {
            DEFAULT_MODEL
        } else {
            request.model.as_str()
        };
        let url = format!("{BASE_URL}/models/{model}:generateContent");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(map_status(status, &body));
        }
        self.parse_body(&body, model)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn aliases(&self) -> &[&'static str] {
        &["gemini"]
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn supports_json_output(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
