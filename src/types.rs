use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which tier of the pipeline produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSource {
    FastPath,
    External,
    Fallback,
}

/// Immutable input to the verification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub student_answer: String,
    pub correct_answer: String,
    pub question: String,
    #[serde(default)]
    pub topic: Option<String>,
    /// Free-form caller context. Recognized keys: `steps` (array of strings
    /// or `{content, hint}` objects) and `hints` (array of strings).
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl VerificationRequest {
    pub fn new(
        student_answer: impl Into<String>,
        correct_answer: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            student_answer: student_answer.into(),
            correct_answer: correct_answer.into(),
            question: question.into(),
            topic: None,
            context: Map::new(),
        }
    }

    /// Malformed requests fail fast; everything downstream assumes
    /// non-empty answers.
    pub fn validate(&self) -> Result<(), String> {
        if self.student_answer.trim().is_empty() {
            return Err("studentAnswer must not be empty".to_string());
        }
        if self.correct_answer.trim().is_empty() {
            return Err("correctAnswer must not be empty".to_string());
        }
        Ok(())
    }
}

/// Verdict for a single verification request. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_correct: bool,
    /// Always within [0, 100].
    pub confidence: u8,
    pub explanation: String,
    #[serde(default)]
    pub alternative_answer: Option<String>,
    pub source: VerdictSource,
}

impl VerificationResult {
    pub fn new(
        is_correct: bool,
        confidence: i64,
        explanation: impl Into<String>,
        source: VerdictSource,
    ) -> Self {
        Self {
            is_correct,
            confidence: clamp_confidence(confidence),
            explanation: explanation.into(),
            alternative_answer: None,
            source,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.alternative_answer = Some(note.into());
        self
    }
}

/// A single expected step of a worked solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionStep {
    pub content: String,
    #[serde(default)]
    pub hint: Option<String>,
}

impl SolutionStep {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Problem context consumed by the fallback evaluator and step analyzer.
/// The problem database itself is an external collaborator; this is just
/// the slice of it the engine needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub steps: Vec<SolutionStep>,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl Problem {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id: None,
            question: question.into(),
            answer: answer.into(),
            steps: Vec::new(),
            hints: Vec::new(),
        }
    }

    pub fn first_hint(&self) -> Option<&str> {
        self.hints
            .first()
            .map(String::as_str)
            .or_else(|| self.steps.first().map(|s| s.content.as_str()))
    }
}

pub(crate) fn clamp_confidence(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}
