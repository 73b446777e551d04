//! Composition root of the verification pipeline.
//!
//! Owns the cache and every client; no global singletons. Verification is
//! an ordered chain of strategies - fast path, external, fallback - and
//! the first one that produces a verdict wins.

use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::error::VerifyError;
use crate::fallback::FallbackEvaluator;
use crate::normalize::FastPathMatcher;
use crate::solver::{AlgebraApi, NewtonApi, SymbolicMathClient};
use crate::steps::StepAnalyzer;
use crate::types::{
    Problem, SolutionStep, VerdictSource, VerificationRequest, VerificationResult,
};
use crate::verifier::{ClaudeApi, ExternalVerifier, ReasoningApi};

pub struct VerificationEngine {
    cache: Arc<ResponseCache>,
    fast_path: FastPathMatcher,
    external: Option<ExternalVerifier>,
    fallback: FallbackEvaluator,
    symbolic: SymbolicMathClient,
    steps: StepAnalyzer,
}

impl VerificationEngine {
    /// Wire up the default transports. External verification is enabled
    /// only when the config carries a reasoning API key.
    pub fn new(config: EngineConfig) -> Self {
        let reasoning: Option<Arc<dyn ReasoningApi>> = config
            .reasoning_api_key
            .clone()
            .map(|key| Arc::new(ClaudeApi::new(&config, key)) as Arc<dyn ReasoningApi>);
        let algebra: Arc<dyn AlgebraApi> = Arc::new(NewtonApi::new(&config));
        Self::with_apis(config, reasoning, algebra)
    }

    /// Wire up with explicit transports; this is also the test seam.
    pub fn with_apis(
        config: EngineConfig,
        reasoning: Option<Arc<dyn ReasoningApi>>,
        algebra: Arc<dyn AlgebraApi>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::new(&config));
        let external = reasoning.map(|api| {
            ExternalVerifier::new(api, cache.clone(), config.verify_timeout)
        });
        if external.is_none() {
            info!("No reasoning service configured - verification runs fast path + fallback only");
        }

        Self {
            fast_path: FastPathMatcher::new(config.fast_path_epsilon),
            external,
            fallback: FallbackEvaluator::new(&config),
            symbolic: SymbolicMathClient::new(algebra, cache.clone()),
            steps: StepAnalyzer::new(&config),
            cache,
        }
    }

    /// Verify one answer. Always returns a verdict; the only error is a
    /// malformed request.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, VerifyError> {
        request
            .validate()
            .map_err(VerifyError::InvalidRequest)?;

        let outcome = self
            .fast_path
            .try_match(&request.student_answer, &request.correct_answer);
        if outcome.is_match {
            info!("Fast path match for {:?}", request.student_answer);
            return Ok(VerificationResult::new(
                true,
                i64::from(outcome.confidence),
                "The answer is correct",
                VerdictSource::FastPath,
            ));
        }

        if let Some(external) = &self.external {
            match external.verify(request).await {
                Ok(result) => return Ok(result),
                Err(e) => warn!("External verification failed ({}); using fallback", e),
            }
        }

        let problem = problem_from_request(request);
        Ok(self
            .fallback
            .evaluate(&request.student_answer, &request.correct_answer, &problem))
    }

    /// Verify several answers concurrently. Order of results matches the
    /// order of requests.
    pub async fn verify_batch(
        &self,
        requests: &[VerificationRequest],
    ) -> Vec<Result<VerificationResult, VerifyError>> {
        futures::future::join_all(requests.iter().map(|r| self.verify(r))).await
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn symbolic(&self) -> &SymbolicMathClient {
        &self.symbolic
    }

    pub fn step_analyzer(&self) -> &StepAnalyzer {
        &self.steps
    }
}

/// Build the fallback evaluator's problem view from the request: question,
/// expected answer, and any steps/hints the caller put in `context`.
fn problem_from_request(request: &VerificationRequest) -> Problem {
    let mut problem = Problem::new(request.question.clone(), request.correct_answer.clone());

    if let Some(Value::Array(steps)) = request.context.get("steps") {
        for step in steps {
            match step {
                Value::String(s) => problem.steps.push(SolutionStep::new(s.clone())),
                Value::Object(map) => {
                    let content = map
                        .get("content")
                        .or_else(|| map.get("description"))
                        .and_then(Value::as_str);
                    if let Some(content) = content {
                        let mut step = SolutionStep::new(content);
                        if let Some(hint) = map.get("hint").and_then(Value::as_str) {
                            step = step.with_hint(hint);
                        }
                        problem.steps.push(step);
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(Value::Array(hints)) = request.context.get("hints") {
        problem.hints = hints
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect();
    }

    problem
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UnreachableAlgebra;

    #[async_trait]
    impl AlgebraApi for UnreachableAlgebra {
        async fn call(
            &self,
            _operation: crate::solver::MathOperation,
            _expression: &str,
        ) -> Result<String> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    struct CountingReasoning {
        calls: AtomicUsize,
        response: Result<String, String>,
    }

    #[async_trait]
    impl ReasoningApi for CountingReasoning {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response
                .clone()
                .map_err(|e| anyhow::anyhow!("{}", e))
        }
    }

    fn offline_engine() -> VerificationEngine {
        VerificationEngine::with_apis(EngineConfig::default(), None, Arc::new(UnreachableAlgebra))
    }

    #[tokio::test]
    async fn identical_answers_take_the_fast_path() {
        let reasoning = Arc::new(CountingReasoning {
            calls: AtomicUsize::new(0),
            response: Ok(r#"{"isCorrect": true}"#.to_string()),
        });
        let engine = VerificationEngine::with_apis(
            EngineConfig::default(),
            Some(reasoning.clone()),
            Arc::new(UnreachableAlgebra),
        );

        let request = VerificationRequest::new("42", "42", "what is 6*7?");
        let result = engine.verify(&request).await.unwrap();

        assert!(result.is_correct);
        assert_eq!(result.confidence, 100);
        assert_eq!(result.source, VerdictSource::FastPath);
        // No network call was made.
        assert_eq!(reasoning.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_service_degrades_to_fallback() {
        let reasoning = Arc::new(CountingReasoning {
            calls: AtomicUsize::new(0),
            response: Err("connection refused".to_string()),
        });
        let engine = VerificationEngine::with_apis(
            EngineConfig::default(),
            Some(reasoning),
            Arc::new(UnreachableAlgebra),
        );

        let request = VerificationRequest::new("17", "15", "how many?");
        let result = engine.verify(&request).await.unwrap();

        assert_eq!(result.source, VerdictSource::Fallback);
        assert!(!result.is_correct);
        assert!(result.confidence <= 80);
    }

    #[tokio::test]
    async fn external_verdict_is_used_when_available() {
        let reasoning = Arc::new(CountingReasoning {
            calls: AtomicUsize::new(0),
            response: Ok(
                r#"{"isCorrect": true, "confidence": 92, "explanation": "same value"}"#.to_string(),
            ),
        });
        let engine = VerificationEngine::with_apis(
            EngineConfig::default(),
            Some(reasoning),
            Arc::new(UnreachableAlgebra),
        );

        let request = VerificationRequest::new("2(x+1)", "2x+2", "expand 2(x+1)");
        let result = engine.verify(&request).await.unwrap();

        assert!(result.is_correct);
        assert_eq!(result.confidence, 92);
        assert_eq!(result.source, VerdictSource::External);
    }

    #[tokio::test]
    async fn missing_fields_fail_fast() {
        let engine = offline_engine();
        let request = VerificationRequest::new("", "42", "q");
        assert!(matches!(
            engine.verify(&request).await,
            Err(VerifyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn context_steps_feed_the_fallback() {
        let engine = offline_engine();
        let mut request = VerificationRequest::new("2x = 6", "3", "solve 2x + 4 = 10");
        request.context.insert(
            "steps".to_string(),
            json!(["2x = 6", {"content": "x = 6/2", "hint": "divide both sides"}]),
        );

        let result = engine.verify(&request).await.unwrap();
        assert_eq!(result.source, VerdictSource::Fallback);
        assert!(result.explanation.contains("step 1"));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let engine = offline_engine();
        let requests = vec![
            VerificationRequest::new("42", "42", "a"),
            VerificationRequest::new("17", "15", "b"),
        ];
        let results = engine.verify_batch(&requests).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap().is_correct);
        assert!(!results[1].as_ref().unwrap().is_correct);
    }
}
