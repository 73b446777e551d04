//! End-to-end verification scenarios with mock transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use mathmate::{
    AlgebraApi, EngineConfig, MathOperation, ReasoningApi, SymbolicMathClient,
    VerdictSource, VerificationEngine, VerificationRequest,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct MockReasoning {
    calls: AtomicUsize,
    script: Result<String, String>,
    delay: Duration,
}

impl MockReasoning {
    fn replying(json: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Ok(json.to_string()),
            delay: Duration::ZERO,
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Err("connection refused".to_string()),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl ReasoningApi for MockReasoning {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.script.clone().map_err(|e| anyhow::anyhow!("{}", e))
    }
}

struct MockAlgebra {
    calls: AtomicUsize,
    result: String,
}

#[async_trait]
impl AlgebraApi for MockAlgebra {
    async fn call(&self, _operation: MathOperation, _expression: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(self.result.clone())
    }
}

#[tokio::test]
async fn identical_answers_never_touch_the_network() {
    init_logging();
    let reasoning = MockReasoning::replying(r#"{"isCorrect": false}"#);
    let engine = VerificationEngine::with_apis(
        EngineConfig::default(),
        Some(reasoning.clone()),
        Arc::new(MockAlgebra {
            calls: AtomicUsize::new(0),
            result: String::new(),
        }),
    );

    let request = VerificationRequest::new("42", "42", "what is 6*7?");
    let result = engine.verify(&request).await.unwrap();

    assert!(result.is_correct);
    assert_eq!(result.confidence, 100);
    assert_eq!(result.source, VerdictSource::FastPath);
    assert_eq!(reasoning.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dead_reasoning_service_falls_back_deterministically() {
    init_logging();
    let engine = VerificationEngine::with_apis(
        EngineConfig::default(),
        Some(MockReasoning::unreachable()),
        Arc::new(MockAlgebra {
            calls: AtomicUsize::new(0),
            result: String::new(),
        }),
    );

    let request = VerificationRequest::new("17", "15", "how many apples?");
    let result = engine.verify(&request).await.unwrap();

    assert_eq!(result.source, VerdictSource::Fallback);
    assert!(!result.is_correct);
    assert!(result.confidence <= 80);
}

#[tokio::test]
async fn external_verdict_flows_through_when_fast_path_misses() {
    init_logging();
    let reasoning = MockReasoning::replying(
        r#"Here you go:
{"isCorrect": true, "confidence": 93, "explanation": "both expand to 2x+2", "alternativeAnswer": "2x+2"}"#,
    );
    let engine = VerificationEngine::with_apis(
        EngineConfig::default(),
        Some(reasoning.clone()),
        Arc::new(MockAlgebra {
            calls: AtomicUsize::new(0),
            result: String::new(),
        }),
    );

    let request = VerificationRequest::new("2(x+1)", "2x+2", "expand 2(x+1)");
    let result = engine.verify(&request).await.unwrap();

    assert!(result.is_correct);
    assert_eq!(result.confidence, 93);
    assert_eq!(result.source, VerdictSource::External);
    assert_eq!(result.alternative_answer.as_deref(), Some("2x+2"));
    assert_eq!(reasoning.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_symbolic_solves_share_one_call() {
    init_logging();
    let algebra = Arc::new(MockAlgebra {
        calls: AtomicUsize::new(0),
        result: "x^3/3".to_string(),
    });
    let config = EngineConfig::default();
    let cache = Arc::new(mathmate::ResponseCache::new(&config));
    let client = Arc::new(SymbolicMathClient::new(algebra.clone(), cache));

    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.solve(MathOperation::Integrate, "x^2").await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.solve(MathOperation::Integrate, "x^2").await })
    };

    let ra = a.await.unwrap();
    let rb = b.await.unwrap();

    assert_eq!(ra.as_deref(), Some("x^3/3"));
    assert_eq!(ra, rb);
    assert_eq!(algebra.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_verification_still_yields_a_fallback_verdict() {
    init_logging();
    let slow = Arc::new(MockReasoning {
        calls: AtomicUsize::new(0),
        script: Ok(r#"{"isCorrect": true}"#.to_string()),
        delay: Duration::from_secs(120),
    });
    let mut config = EngineConfig::default();
    config.verify_timeout = Duration::from_millis(200);
    let engine = VerificationEngine::with_apis(
        config,
        Some(slow),
        Arc::new(MockAlgebra {
            calls: AtomicUsize::new(0),
            result: String::new(),
        }),
    );

    let request = VerificationRequest::new("150.5", "150", "measure the segment");
    let result = engine.verify(&request).await.unwrap();

    assert_eq!(result.source, VerdictSource::Fallback);
    assert!(result.is_correct);
    assert_eq!(result.confidence, 90);
}
