//! External verification through a reasoning service.
//!
//! The remote side enforces no schema: it returns free text that should
//! contain exactly one JSON object. Parsing is tolerant of surrounding
//! prose and code fences, and fails closed - a response with no usable
//! object is a tier failure, never a default verdict.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::error::{ParseError, VerifyError};
use crate::types::{VerdictSource, VerificationRequest, VerificationResult};

/// Transport seam for the reasoning service, swappable in tests.
#[async_trait]
pub trait ReasoningApi: Send + Sync {
    /// One prompt in, free text out.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: String,
}

const SYSTEM_PROMPT: &str = "You are an expert mathematics teacher. You check \
answers precisely, recognize mathematical equivalence, and always respond \
with a single valid JSON object and nothing else.";

/// Anthropic-style messages transport.
pub struct ClaudeApi {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ClaudeApi {
    pub fn new(config: &EngineConfig, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            base_url: config.reasoning_url.clone(),
            model: config.reasoning_model.clone(),
        }
    }
}

#[async_trait]
impl ReasoningApi for ClaudeApi {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            temperature: 0.3,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        info!("Sending verification request to reasoning service");

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Reasoning service error {}: {}", status, body);
            return Err(anyhow::anyhow!("reasoning service error: {}", status));
        }

        let parsed: MessagesResponse = response.json().await?;
        parsed
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow::anyhow!("reasoning service returned no content"))
    }
}

/// The structured verdict extracted from the service's free text.
#[derive(Debug, Clone)]
pub struct ParsedVerdict {
    pub is_correct: bool,
    pub confidence: u8,
    pub explanation: String,
    pub alternative_answer: Option<String>,
}

/// Extract the first well-formed verdict object from free text. Strips
/// code fences, scans from the first `{` to the last `}`, and requires a
/// boolean `isCorrect`; everything else has lenient defaults.
pub fn parse_verdict(raw: &str) -> Result<ParsedVerdict, ParseError> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    text = text.trim_end_matches("```").trim();

    let start = text.find('{').ok_or(ParseError::NoObject)?;
    let end = text.rfind('}').ok_or(ParseError::NoObject)?;
    if end <= start {
        return Err(ParseError::NoObject);
    }

    let value: Value = serde_json::from_str(&text[start..=end])?;

    let is_correct = value
        .get("isCorrect")
        .and_then(Value::as_bool)
        .ok_or(ParseError::InvalidField("isCorrect"))?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_i64)
        .unwrap_or(95)
        .clamp(0, 100) as u8;
    let explanation = value
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or(if is_correct { "Correct" } else { "Not correct" })
        .to_string();
    let alternative_answer = value
        .get("alternativeAnswer")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok(ParsedVerdict {
        is_correct,
        confidence,
        explanation,
        alternative_answer,
    })
}

/// Orchestrates one external verification round trip: prompt, deduplicated
/// call, tolerant parse, timeout.
pub struct ExternalVerifier {
    api: Arc<dyn ReasoningApi>,
    cache: Arc<ResponseCache>,
    timeout: Duration,
}

impl ExternalVerifier {
    pub fn new(api: Arc<dyn ReasoningApi>, cache: Arc<ResponseCache>, timeout: Duration) -> Self {
        Self {
            api,
            cache,
            timeout,
        }
    }

    /// An `Err` here means "this tier failed"; the orchestrator falls back.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, VerifyError> {
        let params = serde_json::json!({
            "question": request.question,
            "correct": request.correct_answer,
            "student": request.student_answer,
        });
        if let Some(cached) = self.cache.get("verification", &params) {
            if let Ok(result) = serde_json::from_value::<VerificationResult>(cached) {
                return Ok(result);
            }
        }

        let prompt = build_verification_prompt(request);
        let key = format!(
            "verify:{}|{}|{}",
            request.question, request.correct_answer, request.student_answer
        );
        let api = self.api.clone();
        let call = self
            .cache
            .dedupe(&key, async move {
                let raw = api.complete(&prompt).await?;
                Ok(Value::String(raw))
            });

        let outcome = timeout(self.timeout, call)
            .await
            .map_err(|_| {
                warn!("External verification timed out after {:?}", self.timeout);
                VerifyError::Timeout(self.timeout)
            })?
            .map_err(|e| VerifyError::Network(e.to_string()))?;

        let raw = match outcome {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let verdict = parse_verdict(&raw)?;
        info!(
            "External verdict: correct={} confidence={}",
            verdict.is_correct, verdict.confidence
        );

        let mut result = VerificationResult::new(
            verdict.is_correct,
            i64::from(verdict.confidence),
            verdict.explanation,
            VerdictSource::External,
        );
        if let Some(alt) = verdict.alternative_answer {
            result = result.with_note(alt);
        }

        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.set("verification", &params, value);
        }
        Ok(result)
    }
}

/// Strict-format prompt: accept trivially-equal answers without
/// re-derivation, otherwise solve independently, and answer as one JSON
/// object.
pub fn build_verification_prompt(request: &VerificationRequest) -> String {
    format!(
        "You are verifying a student's math answer.\n\n\
**Problem:** {question}\n\n\
**Student's Answer:** {student}\n\n\
**Expected Answer:** {correct}\n\n\
**Your Task:**\n\
1. If the two answers are identical strings or numerically equal, accept \
immediately - do not re-derive anything.\n\
2. Otherwise, solve the problem independently and compare your result with \
the student's answer.\n\
3. Treat equivalent forms as the same answer: 15/7 and 2.14, 1/2 and 0.5, \
x = 5 and 5, 2x and x*2.\n\
4. Ignore minor formatting differences.\n\n\
**Response Format (JSON only):**\n\
{{\n\
    \"isCorrect\": true/false,\n\
    \"confidence\": 0-100,\n\
    \"explanation\": \"brief explanation\",\n\
    \"alternativeAnswer\": \"an equivalent form, if helpful\"\n\
}}\n\n\
Respond ONLY with valid JSON, no other text.",
        question = request.question,
        student = request.student_answer,
        correct = request.correct_answer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_bare_object() {
        let verdict = parse_verdict(
            r#"{"isCorrect": true, "confidence": 88, "explanation": "equivalent fractions"}"#,
        )
        .unwrap();
        assert!(verdict.is_correct);
        assert_eq!(verdict.confidence, 88);
        assert_eq!(verdict.explanation, "equivalent fractions");
    }

    #[test]
    fn parses_object_wrapped_in_prose_and_fences() {
        let raw = "Sure! Here is my assessment:\n```json\n{\"isCorrect\": false, \"confidence\": 40, \"explanation\": \"sign error\", \"alternativeAnswer\": \"-3\"}\n```";
        let verdict = parse_verdict(raw).unwrap();
        assert!(!verdict.is_correct);
        assert_eq!(verdict.confidence, 40);
        assert_eq!(verdict.alternative_answer.as_deref(), Some("-3"));
    }

    #[test]
    fn confidence_is_clamped_to_valid_range() {
        let verdict =
            parse_verdict(r#"{"isCorrect": true, "confidence": 400}"#).unwrap();
        assert_eq!(verdict.confidence, 100);
    }

    #[test]
    fn fails_closed_without_an_object() {
        assert!(matches!(
            parse_verdict("the answer looks right to me"),
            Err(ParseError::NoObject)
        ));
    }

    #[test]
    fn fails_closed_on_missing_is_correct() {
        assert!(matches!(
            parse_verdict(r#"{"confidence": 90}"#),
            Err(ParseError::InvalidField("isCorrect"))
        ));
    }

    #[test]
    fn prompt_carries_all_request_fields() {
        let request = VerificationRequest::new("1/2", "0.5", "what is half of one?");
        let prompt = build_verification_prompt(&request);
        assert!(prompt.contains("what is half of one?"));
        assert!(prompt.contains("1/2"));
        assert!(prompt.contains("0.5"));
        assert!(prompt.contains("isCorrect"));
    }

    struct ScriptedApi {
        calls: AtomicUsize,
        response: String,
        delay: Duration,
    }

    #[async_trait]
    impl ReasoningApi for ScriptedApi {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.response.clone())
        }
    }

    fn verifier(api: Arc<ScriptedApi>, budget: Duration) -> ExternalVerifier {
        let cache = Arc::new(ResponseCache::new(&EngineConfig::default()));
        ExternalVerifier::new(api, cache, budget)
    }

    #[tokio::test(start_paused = true)]
    async fn verdict_round_trip() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            response: r#"{"isCorrect": true, "confidence": 97, "explanation": "same value"}"#
                .to_string(),
            delay: Duration::from_millis(10),
        });
        let verifier = verifier(api.clone(), Duration::from_secs(10));
        let request = VerificationRequest::new("15/7", "2.14", "divide 15 by 7");

        let result = verifier.verify(&request).await.unwrap();
        assert!(result.is_correct);
        assert_eq!(result.confidence, 97);
        assert_eq!(result.source, VerdictSource::External);

        // Second identical request is served from the verification cache.
        let again = verifier.verify(&request).await.unwrap();
        assert!(again.is_correct);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_hits_the_timeout() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            response: r#"{"isCorrect": true}"#.to_string(),
            delay: Duration::from_secs(60),
        });
        let verifier = verifier(api, Duration::from_millis(100));
        let request = VerificationRequest::new("1", "2", "q");

        let err = verifier.verify(&request).await.unwrap_err();
        assert!(matches!(err, VerifyError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn prose_only_response_is_a_tier_failure() {
        let api = Arc::new(ScriptedApi {
            calls: AtomicUsize::new(0),
            response: "I think the student is right.".to_string(),
            delay: Duration::ZERO,
        });
        let verifier = verifier(api, Duration::from_secs(10));
        let request = VerificationRequest::new("1", "1", "q");

        let err = verifier.verify(&request).await.unwrap_err();
        assert!(matches!(err, VerifyError::MalformedResponse(_)));
    }
}
