//! MathMate verification engine.
//!
//! Decides whether a student's math answer is correct with bounded latency
//! and bounded cost: a zero-I/O fast path first, then an external reasoning
//! service (cached, deduplicated, and under a timeout), then a deterministic
//! fallback evaluator that works with no network at all. A symbolic-math
//! client and a per-step progress analyzer ride on the same cache.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod normalize;
pub mod solver;
pub mod steps;
pub mod types;
pub mod verifier;

pub use cache::ResponseCache;
pub use config::EngineConfig;
pub use engine::VerificationEngine;
pub use error::{CacheError, ParseError, VerifyError};
pub use fallback::FallbackEvaluator;
pub use normalize::{normalize, FastPathMatcher, FastPathOutcome};
pub use solver::{AlgebraApi, MathOperation, NewtonApi, SymbolicCheck, SymbolicMathClient};
pub use steps::{StepAnalyzer, StepAssessment, StepState};
pub use types::{
    Problem, SolutionStep, VerdictSource, VerificationRequest, VerificationResult,
};
pub use verifier::{ClaudeApi, ExternalVerifier, ReasoningApi};
