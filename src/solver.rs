//! Client for the external symbolic algebra service.
//!
//! The service is a black box: it gets one `(operation, expression)` pair
//! per call and returns one result string. We validate results only
//! heuristically, and a result that fails validation is "unknown", never
//! "incorrect".

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::normalize::prepare_for_algebra;

/// Operations the algebra service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOperation {
    Simplify,
    Factor,
    Derive,
    Integrate,
    Zeroes,
}

impl MathOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MathOperation::Simplify => "simplify",
            MathOperation::Factor => "factor",
            MathOperation::Derive => "derive",
            MathOperation::Integrate => "integrate",
            MathOperation::Zeroes => "zeroes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "simplify" => Some(MathOperation::Simplify),
            "factor" => Some(MathOperation::Factor),
            "derive" => Some(MathOperation::Derive),
            "integrate" => Some(MathOperation::Integrate),
            "zeroes" => Some(MathOperation::Zeroes),
            _ => None,
        }
    }

    /// Derivatives and integrals of a non-constant input must still mention
    /// the variable; a bare constant means the engine choked on the input.
    fn result_must_keep_variable(&self) -> bool {
        matches!(self, MathOperation::Derive | MathOperation::Integrate)
    }
}

/// Transport seam for the algebra service, swappable in tests.
#[async_trait]
pub trait AlgebraApi: Send + Sync {
    async fn call(&self, operation: MathOperation, expression: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct NewtonResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Newton-style HTTP transport: `GET {base}/{operation}/{expression}`.
pub struct NewtonApi {
    client: Client,
    base_url: String,
}

impl NewtonApi {
    pub fn new(config: &EngineConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.algebra_base_url.clone(),
        }
    }
}

#[async_trait]
impl AlgebraApi for NewtonApi {
    async fn call(&self, operation: MathOperation, expression: &str) -> Result<String> {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            operation.as_str(),
            urlencoding::encode(expression)
        );
        info!("Algebra request: {} {}", operation.as_str(), expression);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "algebra service error: {}",
                response.status()
            ));
        }

        let body: NewtonResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(anyhow::anyhow!("algebra service error: {}", error));
        }
        body.result
            .ok_or_else(|| anyhow::anyhow!("algebra service returned no result"))
    }
}

/// Normalized, validated access to the algebra service, cache-backed and
/// dedup-protected.
pub struct SymbolicMathClient {
    api: Arc<dyn AlgebraApi>,
    cache: Arc<ResponseCache>,
}

/// Outcome of checking a student answer against the algebra engine.
#[derive(Debug, Clone)]
pub struct SymbolicCheck {
    pub verified: bool,
    pub engine_answer: Option<String>,
}

impl SymbolicMathClient {
    pub fn new(api: Arc<dyn AlgebraApi>, cache: Arc<ResponseCache>) -> Self {
        Self { api, cache }
    }

    /// Solve `expression` with the given operation. `None` means the
    /// service failed or produced a result we do not trust; callers must
    /// treat it as unknown.
    pub async fn solve(&self, operation: MathOperation, expression: &str) -> Option<String> {
        let prepared = prepare_for_algebra(expression);
        if prepared.is_empty() {
            return None;
        }

        let params = json!({"op": operation.as_str(), "expr": prepared});
        if let Some(Value::String(cached)) = self.cache.get("symbolic", &params) {
            return Some(cached);
        }

        let key = format!("symbolic:{}:{}", operation.as_str(), prepared);
        let api = self.api.clone();
        let call_expr = prepared.clone();
        let outcome = self
            .cache
            .dedupe(&key, async move {
                let result = api.call(operation, &call_expr).await?;
                Ok(Value::String(result))
            })
            .await;

        let result = match outcome {
            Ok(Value::String(s)) => s,
            Ok(other) => {
                warn!("Algebra call returned non-string value: {}", other);
                return None;
            }
            Err(e) => {
                warn!("Algebra call failed: {}", e);
                return None;
            }
        };

        if !validate_result(operation, &prepared, &result) {
            warn!(
                "Rejected algebra result {:?} for {} {}",
                result,
                operation.as_str(),
                prepared
            );
            return None;
        }

        self.cache
            .set("symbolic", &params, Value::String(result.clone()));
        Some(result)
    }

    pub async fn simplify(&self, expression: &str) -> Option<String> {
        self.solve(MathOperation::Simplify, expression).await
    }

    pub async fn factor(&self, expression: &str) -> Option<String> {
        self.solve(MathOperation::Factor, expression).await
    }

    pub async fn find_zeroes(&self, expression: &str) -> Option<String> {
        self.solve(MathOperation::Zeroes, expression).await
    }

    /// Check a student's antiderivative against the engine's.
    pub async fn verify_integral(&self, expression: &str, user_answer: &str) -> SymbolicCheck {
        self.verify_with(MathOperation::Integrate, expression, user_answer)
            .await
    }

    /// Check a student's derivative against the engine's.
    pub async fn verify_derivative(&self, expression: &str, user_answer: &str) -> SymbolicCheck {
        self.verify_with(MathOperation::Derive, expression, user_answer)
            .await
    }

    async fn verify_with(
        &self,
        operation: MathOperation,
        expression: &str,
        user_answer: &str,
    ) -> SymbolicCheck {
        match self.solve(operation, expression).await {
            Some(engine_answer) => {
                let verified = compare_expressions(
                    &prepare_for_algebra(&engine_answer),
                    &prepare_for_algebra(user_answer),
                );
                debug!(
                    "Symbolic check {} {}: engine={} user={} verified={}",
                    operation.as_str(),
                    expression,
                    engine_answer,
                    user_answer,
                    verified
                );
                SymbolicCheck {
                    verified,
                    engine_answer: Some(engine_answer),
                }
            }
            None => SymbolicCheck {
                verified: false,
                engine_answer: None,
            },
        }
    }

    /// Produce a topic-appropriate hint from the algebra engine, when it
    /// cooperates.
    pub async fn hint_for(&self, topic: &str, expression: &str) -> Option<String> {
        match topic {
            "calculus" if expression.contains('∫') => {
                let simplified = self.simplify(expression).await?;
                Some(format!("Hint: simplify {} first", simplified))
            }
            "algebra" => {
                let factored = self.factor(expression).await?;
                Some(format!("Hint: try factoring: {}", factored))
            }
            _ => None,
        }
    }
}

const ERROR_SENTINELS: &[&str] = &["error", "undefined", "null", "nan"];

/// Heuristic shape check on a raw engine result.
fn validate_result(operation: MathOperation, input: &str, result: &str) -> bool {
    let trimmed = result.trim();
    if trimmed.is_empty() {
        return false;
    }
    if ERROR_SENTINELS.contains(&trimmed.to_lowercase().as_str()) {
        return false;
    }
    if operation.result_must_keep_variable() {
        match variable_of(input) {
            Some(var) => return trimmed.to_lowercase().contains(var),
            None => return true,
        }
    }
    true
}

const FUNCTION_NAMES: &[&str] = &[
    "sqrt", "sin", "cos", "tan", "arcsin", "arccos", "arctan", "log", "ln", "abs",
];

/// First variable token of an expression, skipping known function names.
fn variable_of(expr: &str) -> Option<char> {
    let mut scrubbed = expr.to_lowercase();
    for name in FUNCTION_NAMES {
        scrubbed = scrubbed.replace(name, "");
    }
    scrubbed.chars().find(|c| c.is_ascii_alphabetic())
}

static REPEATED_MUL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*+").expect("static regex"));
static REPEATED_ADD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\++").expect("static regex"));
static HALVED_SQUARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\*?x\^2/2").expect("static regex"));

/// Heuristic string-level equivalence of two expressions.
///
/// This is intentionally not a computer-algebra comparison: it lowercases,
/// collapses repeated operators, drops a trailing `+c`, and canonicalizes
/// the fixed family of `n*x^2/2` coefficient identities. Known limitation,
/// preserved on purpose.
pub fn compare_expressions(a: &str, b: &str) -> bool {
    fn canonical(expr: &str) -> String {
        let mut s: String = expr
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        s = REPEATED_MUL.replace_all(&s, "*").into_owned();
        s = REPEATED_ADD.replace_all(&s, "+").into_owned();
        if let Some(stripped) = s.strip_suffix("+c") {
            s = stripped.to_string();
        }
        s = HALVED_SQUARE
            .replace_all(&s, |caps: &regex::Captures<'_>| {
                let coef: f64 = caps[1].parse().unwrap_or(0.0);
                let half = coef / 2.0;
                if (half - 1.0).abs() < f64::EPSILON {
                    "x^2".to_string()
                } else if half.fract() == 0.0 {
                    format!("{}x^2", half as i64)
                } else {
                    format!("{}x^2", half)
                }
            })
            .into_owned();
        s
    }

    let norm_a = canonical(a);
    let norm_b = canonical(b);
    debug!("Expression comparison: {} vs {}", norm_a, norm_b);
    norm_a == norm_b
}
