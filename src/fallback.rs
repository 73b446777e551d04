//! Deterministic fallback evaluator.
//!
//! This is the circuit-breaker path: it must produce a verdict with zero
//! external dependencies, synchronously, and it must never panic. Tiers are
//! tried in order and the first one that produces a verdict wins.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::EngineConfig;
use crate::normalize::{normalize, FastPathMatcher};
use crate::types::{Problem, VerdictSource, VerificationResult};

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+\.?\d*").expect("static regex"));
static POINT_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(?\s*(-?\d+\.?\d*)\s*[,;]\s*(-?\d+\.?\d*)\s*\)?").expect("static regex")
});
static POINT_XY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)x\s*=\s*(-?\d+\.?\d*).*?y\s*=\s*(-?\d+\.?\d*)").expect("static regex")
});
static EQUATION_ROOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"x=(-?\d+\.?\d*)").expect("static regex"));
static FRACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(-?\d+)/(-?\d+)").expect("static regex"));
static MATH_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9+\-*/=^√]+").expect("static regex"));

pub struct FallbackEvaluator {
    matcher: FastPathMatcher,
    exact_rel_tol: f64,
    close_rel_tol: f64,
    similarity_accept: f64,
    similarity_note: f64,
}

impl FallbackEvaluator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            matcher: FastPathMatcher::new(config.fast_path_epsilon),
            exact_rel_tol: config.exact_rel_tol,
            close_rel_tol: config.close_rel_tol,
            similarity_accept: config.similarity_accept,
            similarity_note: config.similarity_note,
        }
    }

    /// Total and synchronous: always yields a verdict, tagged `Fallback`.
    pub fn evaluate(&self, student: &str, correct: &str, problem: &Problem) -> VerificationResult {
        debug!("Fallback evaluation: {:?} vs {:?}", student, correct);

        self.exact_match(student, correct)
            .or_else(|| self.numeric_match(student, correct, correct_value_note(correct)))
            .or_else(|| point_match(student, correct))
            .or_else(|| equation_match(student, correct))
            .or_else(|| fraction_match(student, correct))
            .or_else(|| term_reorder_match(student, correct))
            .or_else(|| containment_match(student, correct))
            .or_else(|| self.similarity_match(student, correct))
            .or_else(|| step_match(student, problem))
            .or_else(|| keyword_match(student, problem))
            .unwrap_or_else(|| self.generic_incorrect(student, correct, problem))
    }

    fn exact_match(&self, student: &str, correct: &str) -> Option<VerificationResult> {
        let outcome = self.matcher.try_match(student, correct);
        if outcome.is_match {
            Some(VerificationResult::new(
                true,
                i64::from(outcome.confidence),
                "The answer is correct",
                VerdictSource::Fallback,
            ))
        } else {
            None
        }
    }

    fn numeric_match(
        &self,
        student: &str,
        correct: &str,
        note: Option<String>,
    ) -> Option<VerificationResult> {
        let a = extract_number(student)?;
        let b = extract_number(correct)?;
        if b == 0.0 {
            return None;
        }

        let relative = ((a - b) / b).abs();
        if relative < self.exact_rel_tol {
            return Some(VerificationResult::new(
                true,
                90,
                "Numerically equivalent",
                VerdictSource::Fallback,
            ));
        }
        if relative < self.close_rel_tol {
            let mut result = VerificationResult::new(
                false,
                70,
                "Close, but not exact - recheck your arithmetic",
                VerdictSource::Fallback,
            );
            if let Some(note) = note {
                result = result.with_note(note);
            }
            return Some(result);
        }
        None
    }

    fn similarity_match(&self, student: &str, correct: &str) -> Option<VerificationResult> {
        let similarity = similarity(&normalize(student), &normalize(correct));
        if similarity > self.similarity_accept {
            return Some(
                VerificationResult::new(
                    true,
                    (similarity * 100.0).round() as i64,
                    "Correct, with a minor difference in wording",
                    VerdictSource::Fallback,
                )
                .with_note(format!("Exact form: {}", correct)),
            );
        }
        None
    }

    fn generic_incorrect(
        &self,
        student: &str,
        correct: &str,
        problem: &Problem,
    ) -> VerificationResult {
        let similarity = similarity(&normalize(student), &normalize(correct));
        let confidence = ((similarity * 100.0).round() as i64).min(20);
        let mut result = VerificationResult::new(
            false,
            confidence,
            "The answer is not correct",
            VerdictSource::Fallback,
        );
        if similarity > self.similarity_note {
            result = result.with_note("Close, but not exact".to_string());
        } else if let Some(hint) = problem.first_hint() {
            result = result.with_note(format!("Hint: {}", hint));
        }
        result
    }
}

fn correct_value_note(correct: &str) -> Option<String> {
    extract_number(correct).map(|n| format!("The correct answer is {}", n))
}

/// First numeric token of a string, if any.
pub(crate) fn extract_number(text: &str) -> Option<f64> {
    let m = NUMBER.find(text)?;
    m.as_str().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn extract_point(text: &str) -> Option<(f64, f64)> {
    for pattern in [&*POINT_PAIR, &*POINT_XY] {
        if let Some(caps) = pattern.captures(text) {
            let x = caps.get(1)?.as_str().parse::<f64>().ok()?;
            let y = caps.get(2)?.as_str().parse::<f64>().ok()?;
            return Some((x, y));
        }
    }
    None
}

fn point_match(student: &str, correct: &str) -> Option<VerificationResult> {
    let (sx, sy) = extract_point(student)?;
    let (cx, cy) = extract_point(correct)?;
    if sx == cx && sy == cy {
        return Some(VerificationResult::new(
            true,
            100,
            "The coordinates are correct",
            VerdictSource::Fallback,
        ));
    }
    None
}

fn equation_match(student: &str, correct: &str) -> Option<VerificationResult> {
    // Scan the raw strings (whitespace removed): `normalize` strips a
    // leading "x=", which is exactly the token this tier keys on.
    fn squash(text: &str) -> String {
        text.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect()
    }
    let sv = EQUATION_ROOT
        .captures(&squash(student))
        .and_then(|caps| caps.get(1)?.as_str().parse::<f64>().ok())?;
    let cv = EQUATION_ROOT
        .captures(&squash(correct))
        .and_then(|caps| caps.get(1)?.as_str().parse::<f64>().ok())?;
    if (sv - cv).abs() < 1e-3 {
        return Some(VerificationResult::new(
            true,
            100,
            "The root is correct",
            VerdictSource::Fallback,
        ));
    }
    None
}

fn fraction_match(student: &str, correct: &str) -> Option<VerificationResult> {
    let s = FRACTION.captures(student)?;
    let c = FRACTION.captures(correct)?;
    let (sn, sd) = (
        s.get(1)?.as_str().parse::<f64>().ok()?,
        s.get(2)?.as_str().parse::<f64>().ok()?,
    );
    let (cn, cd) = (
        c.get(1)?.as_str().parse::<f64>().ok()?,
        c.get(2)?.as_str().parse::<f64>().ok()?,
    );
    if sd == 0.0 || cd == 0.0 {
        return None;
    }
    if (sn / sd - cn / cd).abs() < 1e-3 {
        let mut result = VerificationResult::new(
            true,
            100,
            "The fraction is correct",
            VerdictSource::Fallback,
        );
        if sn != cn {
            result = result.with_note(format!("Can also be simplified to {}/{}", cn, cd));
        }
        return Some(result);
    }
    None
}

/// `2x+3` and `3+2x` are the same sum.
fn term_reorder_match(student: &str, correct: &str) -> Option<VerificationResult> {
    let s_terms = signed_terms(&normalize(student));
    let c_terms = signed_terms(&normalize(correct));
    if s_terms.is_empty() || s_terms.len() != c_terms.len() {
        return None;
    }

    let mut s_sorted = s_terms;
    let mut c_sorted = c_terms;
    s_sorted.sort();
    c_sorted.sort();
    if s_sorted == c_sorted && s_sorted.len() > 1 {
        return Some(
            VerificationResult::new(
                true,
                95,
                "The answer is correct",
                VerdictSource::Fallback,
            )
            .with_note(format!("Can also be written as {}", correct)),
        );
    }
    None
}

/// Split an expression into sign-carrying additive terms.
fn signed_terms(expr: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut sign = '+';
    for c in expr.chars() {
        if c == '+' || c == '-' {
            if !current.is_empty() {
                terms.push(format!("{}{}", sign, current));
                current.clear();
            }
            sign = c;
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        terms.push(format!("{}{}", sign, current));
    }
    terms
}

fn containment_match(student: &str, correct: &str) -> Option<VerificationResult> {
    let s = normalize(student);
    let c = normalize(correct);
    if s.is_empty() || c.is_empty() || s.len() < 2 {
        return None;
    }
    if c.contains(&s) {
        return Some(
            VerificationResult::new(true, 95, "The answer is correct", VerdictSource::Fallback)
                .with_note("Your answer is right; it can also be written in more detail"),
        );
    }
    if s.contains(&c) {
        return Some(
            VerificationResult::new(true, 90, "The answer is correct", VerdictSource::Fallback)
                .with_note(format!("A shorter form: {}", correct)),
        );
    }
    None
}

fn step_match(student: &str, problem: &Problem) -> Option<VerificationResult> {
    let input = normalize(student);
    if input.is_empty() {
        return None;
    }
    for (index, step) in problem.steps.iter().enumerate() {
        let step_text = normalize(&step.content);
        if step_text.is_empty() {
            continue;
        }
        if input.contains(&step_text) || step_text.contains(&input) {
            let hint = step
                .hint
                .clone()
                .or_else(|| problem.hints.get(index).cloned());
            let next = problem
                .steps
                .get(index + 1)
                .map(|s| s.content.clone())
                .unwrap_or_else(|| "Finish the solution".to_string());
            let explanation = match hint {
                Some(h) => format!("Matches step {} - keep going. {}", index + 1, h),
                None => format!("Matches step {} - keep going", index + 1),
            };
            return Some(
                VerificationResult::new(false, 75, explanation, VerdictSource::Fallback)
                    .with_note(format!("Next: {}", next)),
            );
        }
    }
    None
}

fn keyword_match(student: &str, problem: &Problem) -> Option<VerificationResult> {
    let input = normalize(student);
    if input.is_empty() || problem.steps.is_empty() {
        return None;
    }

    let mut keywords: Vec<String> = Vec::new();
    for step in &problem.steps {
        for token in MATH_TOKEN.find_iter(&step.content.to_lowercase()) {
            let token = token.as_str();
            if token.len() >= 2 && !keywords.iter().any(|k| k == token) {
                keywords.push(token.to_string());
            }
        }
    }

    if keywords.iter().any(|kw| input.contains(kw.as_str())) {
        let mut result = VerificationResult::new(
            false,
            50,
            "On the right track - keep going",
            VerdictSource::Fallback,
        );
        if let Some(hint) = problem.first_hint() {
            result = result.with_note(format!("Hint: {}", hint));
        }
        return Some(result);
    }
    None
}

/// Levenshtein similarity in [0, 1].
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return if b.is_empty() { 1.0 } else { 0.0 };
    }
    if b.is_empty() {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=a.len()).collect();
    let mut curr = vec![0usize; a.len() + 1];
    for (i, bc) in b.iter().enumerate() {
        curr[0] = i + 1;
        for (j, ac) in a.iter().enumerate() {
            let cost = if ac == bc { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(curr[j] + 1).min(prev[j + 1] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[a.len()] as f64;
    1.0 - distance / a.len().max(b.len()) as f64
}
