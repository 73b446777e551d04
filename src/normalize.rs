//! Canonicalization of math expression strings and the zero-I/O fast path.
//!
//! Everything in this module is pure and synchronous; it runs on every
//! submission before any network tier is considered.

/// Canonicalize an expression for comparison.
///
/// Applied in order: trim, drop whitespace, unify `×`/`÷` glyphs, lowercase,
/// strip leading `x =` / `y =` prefixes. Total and idempotent; input that is
/// not a math expression at all just comes back lowercased and trimmed.
pub fn normalize(expr: &str) -> String {
    let mut out: String = expr
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '×' => '*',
            '÷' => '/',
            '−' => '-',
            other => other,
        })
        .collect::<String>()
        .to_lowercase();

    // Strip repeatedly so the function stays idempotent even for degenerate
    // inputs like "x=x=5".
    loop {
        if let Some(rest) = out.strip_prefix("x=").or_else(|| out.strip_prefix("y=")) {
            out = rest.to_string();
        } else {
            break;
        }
    }

    out
}

/// Prepare an expression for the external algebra service: ASCII operators
/// only, no superscript glyphs, no integral dressing.
pub fn prepare_for_algebra(expr: &str) -> String {
    let mut out: String = expr
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace('×', "*")
        .replace('÷', "/")
        .replace('²', "^2")
        .replace('³', "^3")
        .replace('√', "sqrt")
        .replace('∫', "");

    strip_suffix_ci(&mut out, "dx");
    strip_suffix_ci(&mut out, "+c");

    out
}

fn strip_suffix_ci(s: &mut String, suffix: &str) {
    if s.len() < suffix.len() {
        return;
    }
    let cut = s.len() - suffix.len();
    if s.is_char_boundary(cut) && s[cut..].eq_ignore_ascii_case(suffix) {
        s.truncate(cut);
    }
}

/// Parse a plain float or a simple `a/b` fraction.
pub fn parse_numeric(expr: &str) -> Option<f64> {
    let trimmed = expr.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return Some(n);
        }
        return None;
    }

    let (num, den) = trimmed.split_once('/')?;
    let num = num.trim().parse::<f64>().ok()?;
    let den = den.trim().parse::<f64>().ok()?;
    if den == 0.0 || !num.is_finite() || !den.is_finite() {
        return None;
    }
    Some(num / den)
}

/// Outcome of the fast path. A non-match is an explicit value, not an
/// absence: the caller still escalates to the next tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastPathOutcome {
    pub is_match: bool,
    pub confidence: u8,
}

impl FastPathOutcome {
    const NO_MATCH: Self = Self {
        is_match: false,
        confidence: 0,
    };
}

/// Detects exact or numerically-equal answers without any I/O.
#[derive(Debug, Clone, Copy)]
pub struct FastPathMatcher {
    /// Absolute tolerance for numeric equality across formattings.
    pub epsilon: f64,
}

impl Default for FastPathMatcher {
    fn default() -> Self {
        Self { epsilon: 0.01 }
    }
}

impl FastPathMatcher {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn try_match(&self, student: &str, correct: &str) -> FastPathOutcome {
        // Raw equality first: strings that normalize to nothing (a bare
        // "x=", pure whitespace) must still match themselves.
        if student.trim() == correct.trim() {
            return FastPathOutcome {
                is_match: true,
                confidence: 100,
            };
        }

        let norm_student = normalize(student);
        let norm_correct = normalize(correct);

        if !norm_student.is_empty() && norm_student == norm_correct {
            return FastPathOutcome {
                is_match: true,
                confidence: 100,
            };
        }

        if let (Some(a), Some(b)) = (parse_numeric(&norm_student), parse_numeric(&norm_correct)) {
            if (a - b).abs() < self.epsilon {
                return FastPathOutcome {
                    is_match: true,
                    confidence: 100,
                };
            }
        }

        FastPathOutcome::NO_MATCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for s in [
            "  x = 5  ",
            "2 × 3 ÷ 4",
            "X = Y = weird",
            "x=x=5",
            "Hello World",
            "",
            "3x² + 2",
        ] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn normalize_strips_prefix_and_glyphs() {
        assert_eq!(normalize("x = 5"), "5");
        assert_eq!(normalize("Y = 2 × 3"), "2*3");
        assert_eq!(normalize("6 ÷ 2"), "6/2");
    }

    #[test]
    fn prepare_for_algebra_cleans_glyphs() {
        assert_eq!(prepare_for_algebra("3x² + 2x"), "3x^2+2x");
        assert_eq!(prepare_for_algebra("∫ x^2 dx"), "x^2");
        assert_eq!(prepare_for_algebra("x^3/3 + C"), "x^3/3");
        assert_eq!(prepare_for_algebra("√16"), "sqrt16");
    }

    #[test]
    fn parse_numeric_handles_fractions() {
        assert_eq!(parse_numeric("15"), Some(15.0));
        assert_eq!(parse_numeric("15.0"), Some(15.0));
        assert_eq!(parse_numeric("3/4"), Some(0.75));
        assert_eq!(parse_numeric("1/0"), None);
        assert_eq!(parse_numeric("x+1"), None);
    }

    #[test]
    fn self_match_has_full_confidence() {
        let matcher = FastPathMatcher::default();
        for s in ["42", "x^2 + 1", "  x = 7 "] {
            let outcome = matcher.try_match(s, s);
            assert!(outcome.is_match);
            assert_eq!(outcome.confidence, 100);
        }
    }

    #[test]
    fn degenerate_strings_still_match_themselves() {
        let matcher = FastPathMatcher::default();
        for s in ["x=", "y =", "   ", "∫"] {
            let outcome = matcher.try_match(s, s);
            assert!(outcome.is_match, "self-match failed for {:?}", s);
            assert_eq!(outcome.confidence, 100);
        }
        // Distinct strings that both normalize to nothing must not match.
        assert!(!matcher.try_match("x=", "y=").is_match);
    }

    #[test]
    fn numeric_equivalence_across_formatting() {
        let matcher = FastPathMatcher::default();
        assert!(matcher.try_match("15", "15.0").is_match);
        assert!(matcher.try_match("1/2", "0.5").is_match);
        assert!(matcher.try_match("x = 5", "5").is_match);
    }

    #[test]
    fn unequal_numbers_do_not_match() {
        let matcher = FastPathMatcher::default();
        let outcome = matcher.try_match("16", "15");
        assert!(!outcome.is_match);
    }
}
