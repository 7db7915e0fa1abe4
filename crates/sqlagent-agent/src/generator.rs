use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sqlagent_llm::{LlmClient, Request, ResponseFormat};
use sqlagent_types::{AgentError, ObservationDigest, RepairGuidance, Result};

use crate::prompt_builder::{base_rules, PromptBuilder, OUTPUT_EXAMPLE};

// ---------------------------------------------------------------------------
// GenerationInput / GeneratedQuery
// ---------------------------------------------------------------------------

/// Everything the generator sees for one attempt.
#[derive(Debug, Clone)]
pub struct GenerationInput<'a> {
    pub question: &'a str,
    pub schema: &'a str,
    /// Backend name, as reported by `SqlBackend::name`.
    pub dialect: &'a str,
    pub previous_query: Option<&'a str>,
    pub previous_observation: Option<ObservationDigest>,
    pub guidance: Option<&'a RepairGuidance>,
}

impl GenerationInput<'_> {
    pub fn is_repair_attempt(&self) -> bool {
        self.guidance.is_some()
    }
}

/// A candidate query with the model's rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql_query: String,
    pub reasoning: String,
    pub confidence: f64,
}

impl GeneratedQuery {
    pub fn new(sql_query: impl Into<String>, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            sql_query: sql_query.into(),
            reasoning: reasoning.into(),
            confidence,
        }
    }

    /// Parse a model reply object. Every key must be present.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            AgentError::ContractViolation("LLM output is not a JSON object".into())
        })?;

        for key in ["sql_query", "reasoning", "confidence"] {
            if !object.contains_key(key) {
                return Err(AgentError::ContractViolation(format!(
                    "LLM output missing key: {key}"
                )));
            }
        }

        let sql_query = match &object["sql_query"] {
            Value::String(s) => s.trim().to_string(),
            other => {
                return Err(AgentError::ContractViolation(format!(
                    "sql_query must be a string, got {other}"
                )))
            }
        };
        let reasoning = match &object["reasoning"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let confidence = match &object["confidence"] {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| AgentError::ContractViolation("confidence must be a number".into()))?;

        Ok(Self {
            sql_query,
            reasoning,
            confidence,
        })
    }

    /// Enforce the generation contract: confidence in [0, 1] and a single read-only statement.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(AgentError::ContractViolation(format!(
                "confidence must be between 0 and 1, got {}",
                self.confidence
            )));
        }
        ensure_read_only(&self.sql_query)
    }
}

const MUTATING_KEYWORDS: &str = r"(?i)\b(insert|update|delete|merge|truncate|drop|alter|create|grant|revoke|into)\b";

/// Literals, quoted identifiers and comments, matched in one left-to-right
/// pass so whichever opens first swallows the others.
const OPAQUE_SPANS: &str = r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*.*?\*/"#;

/// Replace every literal or quoted identifier with an empty one and every comment with a space.
fn strip_opaque_spans(sql: &str) -> std::result::Result<String, regex::Error> {
    let spans = Regex::new(OPAQUE_SPANS)?;
    Ok(spans
        .replace_all(sql, |caps: &regex::Captures<'_>| match caps[0].as_bytes()[0] {
            b'\'' => "''",
            b'"' => "\"\"",
            _ => " ",
        })
        .into_owned())
}

/// A single `SELECT` (or `WITH ... SELECT`) statement with no mutating keywords.
fn ensure_read_only(sql: &str) -> Result<()> {
    check_read_only(sql).map_err(|reason| {
        AgentError::ContractViolation(format!("{reason}: {}", sql.trim()))
    })
}

fn check_read_only(sql: &str) -> std::result::Result<(), String> {
    let mutating = Regex::new(MUTATING_KEYWORDS).map_err(|e| e.to_string())?;
    let stripped = strip_opaque_spans(sql).map_err(|e| e.to_string())?;
    let body = stripped.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if body.is_empty() {
        return Err("LLM returned an empty SQL query".into());
    }
    if body.contains(';') {
        return Err("LLM returned multiple SQL statements, blocked".into());
    }

    let first = body
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if first != "select" && first != "with" {
        return Err("LLM returned a non-SELECT SQL query, blocked".into());
    }
    if let Some(m) = mutating.find(body) {
        return Err(format!(
            "LLM returned a query containing `{}`, blocked",
            m.as_str().to_ascii_uppercase()
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// QueryGenerator
// ---------------------------------------------------------------------------

/// Produces a candidate query for one attempt.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate(&self, input: &GenerationInput<'_>) -> Result<GeneratedQuery>;
}

/// Generator backed by a language model through [`LlmClient`].
pub struct LlmQueryGenerator {
    client: LlmClient,
    model: String,
    provider: Option<String>,
    temperature: Option<f32>,
}

impl LlmQueryGenerator {
    pub fn new(client: LlmClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            provider: None,
            temperature: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build_prompt(input: &GenerationInput<'_>) -> Result<String> {
        Ok(PromptBuilder::new()
            .with_schema(input.schema)
            .with_question(input.question)
            .with_previous_query(input.previous_query)
            .with_observation(input.previous_observation.as_ref())?
            .with_guidance(input.guidance)?
            .with_output_example(OUTPUT_EXAMPLE)
            .build())
    }
}

#[async_trait]
impl QueryGenerator for LlmQueryGenerator {
    async fn generate(&self, input: &GenerationInput<'_>) -> Result<GeneratedQuery> {
        let prompt = Self::build_prompt(input)?;
        let mut request = Request::prompt(&self.model, prompt)
            .with_system(base_rules(input.dialect))
            .with_response_format(ResponseFormat::Json);
        if let Some(provider) = &self.provider {
            request = request.with_provider(provider);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.client.complete(&request).await?;
        let value: Value = serde_json::from_str(strip_code_fence(&response.text)).map_err(|e| {
            AgentError::ContractViolation(format!("LLM output is not valid JSON: {e}"))
        })?;

        let generated = GeneratedQuery::from_json(&value)?;
        tracing::debug!(
            model = %self.model,
            confidence = generated.confidence,
            repair = input.is_repair_attempt(),
            "Generated candidate query"
        );
        Ok(generated)
    }
}

/// Models sometimes wrap JSON in a ```json fence even when asked not to.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
