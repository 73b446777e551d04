//! Per-keystroke analysis of an in-progress solution.
//!
//! Independent of final-answer verification: the caller feeds each
//! submitted step plus its own streak counter, and gets partial-credit
//! feedback and the next hint. No network, no cross-step mutable state
//! beyond a bounded assessment memo.

use std::collections::{HashMap, VecDeque};

use log::debug;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::config::EngineConfig;
use crate::fallback::extract_number;
use crate::normalize::normalize;
use crate::types::{clamp_confidence, Problem};

const MEMO_CAPACITY: usize = 50;

/// Where a submission lands in the solving attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    InProgress,
    StepMatched(usize),
    Solved,
}

/// Fresh assessment produced for every step submission.
#[derive(Debug, Clone)]
pub struct StepAssessment {
    pub state: StepState,
    /// 1-based index of the matched step; 0 when nothing matched.
    pub step_number: usize,
    pub is_correct: bool,
    pub is_progressing: bool,
    pub confidence: u8,
    pub feedback: String,
    pub hint: Option<String>,
    pub next_step_suggestion: Option<String>,
}

/// One entry of a submitted multi-step solution, as the caller tracked it.
#[derive(Debug, Clone)]
pub struct SubmittedStep {
    pub value: String,
    pub correct: bool,
}

/// Whole-solution summary for the review screen.
#[derive(Debug, Clone)]
pub struct SolutionAssessment {
    pub is_correct: bool,
    pub score: u8,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub feedback: String,
}

pub struct StepAnalyzer {
    close_rel_tol: f64,
    exact_rel_tol: f64,
    memo: Mutex<Memo>,
}

struct Memo {
    entries: HashMap<String, StepAssessment>,
    order: VecDeque<String>,
}

impl StepAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            close_rel_tol: config.close_rel_tol,
            exact_rel_tol: config.exact_rel_tol,
            memo: Mutex::new(Memo {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Assess a single in-progress step. `previous_steps` is owned by the
    /// caller and only informs progress context.
    pub fn analyze_step(
        &self,
        student_input: &str,
        problem: &Problem,
        previous_steps: &[String],
    ) -> StepAssessment {
        if student_input.trim().is_empty() {
            return StepAssessment {
                state: StepState::NotStarted,
                step_number: 0,
                is_correct: false,
                is_progressing: false,
                confidence: 0,
                feedback: "Please enter an answer".to_string(),
                hint: None,
                next_step_suggestion: problem.steps.first().map(|s| s.content.clone()),
            };
        }

        let memo_key = format!(
            "{}:{}",
            problem.id.as_deref().unwrap_or(&problem.question),
            student_input
        );
        if let Some(cached) = self.memo.lock().entries.get(&memo_key) {
            debug!("Step memo hit: {}", memo_key);
            return cached.clone();
        }

        let assessment = self.assess(student_input, problem, previous_steps);
        self.remember(memo_key, assessment.clone());
        assessment
    }

    fn assess(
        &self,
        student_input: &str,
        problem: &Problem,
        _previous_steps: &[String],
    ) -> StepAssessment {
        let input = normalize(student_input);
        let answer = normalize(&problem.answer);

        // A full final answer short-circuits regardless of step history.
        if !answer.is_empty() && (input == answer || input.contains(answer.as_str())) {
            return StepAssessment {
                state: StepState::Solved,
                step_number: problem.steps.len(),
                is_correct: true,
                is_progressing: true,
                confidence: 95,
                feedback: "Correct! You reached the final answer".to_string(),
                hint: None,
                next_step_suggestion: None,
            };
        }

        if let (Some(a), Some(b)) = (
            extract_number(student_input),
            extract_number(&problem.answer),
        ) {
            if b != 0.0 {
                let relative = ((a - b) / b).abs();
                if relative < self.exact_rel_tol {
                    return StepAssessment {
                        state: StepState::Solved,
                        step_number: problem.steps.len(),
                        is_correct: true,
                        is_progressing: true,
                        confidence: 90,
                        feedback: "Almost exact - the answer is correct".to_string(),
                        hint: None,
                        next_step_suggestion: None,
                    };
                }
                if relative < self.close_rel_tol {
                    return StepAssessment {
                        state: StepState::InProgress,
                        step_number: 0,
                        is_correct: false,
                        is_progressing: true,
                        confidence: 70,
                        feedback: "Close! There is a small mistake".to_string(),
                        hint: problem
                            .hints
                            .first()
                            .cloned()
                            .or_else(|| Some("Check your calculations step by step".to_string())),
                        next_step_suggestion: problem.steps.first().map(|s| s.content.clone()),
                    };
                }
            }
        }

        for (index, step) in problem.steps.iter().enumerate() {
            let step_text = normalize(&step.content);
            if step_text.is_empty() {
                continue;
            }
            if input.contains(step_text.as_str()) || step_text.contains(input.as_str()) {
                let next = problem
                    .steps
                    .get(index + 1)
                    .map(|s| s.content.clone())
                    .unwrap_or_else(|| "Finish the solution".to_string());
                return StepAssessment {
                    state: StepState::StepMatched(index),
                    step_number: index + 1,
                    is_correct: true,
                    is_progressing: true,
                    confidence: 75,
                    feedback: format!("Step {} correct!", index + 1),
                    hint: step
                        .hint
                        .clone()
                        .or_else(|| problem.hints.get(index).cloned()),
                    next_step_suggestion: Some(next),
                };
            }
        }

        if token_overlap(&input, problem) {
            return StepAssessment {
                state: StepState::InProgress,
                step_number: 0,
                is_correct: false,
                is_progressing: true,
                confidence: 50,
                feedback: "On the right track".to_string(),
                hint: problem
                    .hints
                    .first()
                    .cloned()
                    .or_else(|| Some("Continue solving step by step".to_string())),
                next_step_suggestion: problem.steps.first().map(|s| s.content.clone()),
            };
        }

        StepAssessment {
            state: StepState::InProgress,
            step_number: 0,
            is_correct: false,
            is_progressing: false,
            confidence: 20,
            feedback: "Not correct - try again".to_string(),
            hint: problem.first_hint().map(|h| h.to_string()),
            next_step_suggestion: problem.steps.first().map(|s| s.content.clone()),
        }
    }

    fn remember(&self, key: String, assessment: StepAssessment) {
        let mut memo = self.memo.lock();
        if !memo.entries.contains_key(&key) {
            memo.order.push_back(key.clone());
        }
        memo.entries.insert(key, assessment);
        while memo.order.len() > MEMO_CAPACITY {
            if let Some(oldest) = memo.order.pop_front() {
                memo.entries.remove(&oldest);
            }
        }
    }

    /// Encouragement line for the current streak and progress fraction.
    /// The streak counter is owned by the caller.
    pub fn encouragement(
        &self,
        step_number: usize,
        total_steps: usize,
        is_correct: bool,
        streak: u32,
    ) -> String {
        let progress = if total_steps > 0 {
            step_number as f64 / total_steps as f64
        } else {
            0.0
        };

        if is_correct {
            if streak >= 3 {
                const LINES: &[&str] = &[
                    "Three in a row - you're on fire!",
                    "Champion! Keep it up!",
                    "Amazing! You're an expert!",
                ];
                return LINES
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .unwrap_or(LINES[0])
                    .to_string();
            }
            if progress < 0.3 {
                "Great start!".to_string()
            } else if progress < 0.7 {
                "Excellent direction - you're halfway there!".to_string()
            } else {
                "Almost done, just a bit more!".to_string()
            }
        } else if progress < 0.3 {
            "It's okay, everyone starts here. Let's try together!".to_string()
        } else if progress < 0.7 {
            "You've come far - don't give up now!".to_string()
        } else {
            "You're so close! Just one more step!".to_string()
        }
    }

    /// Hint appropriate to the student's current position in the solution.
    pub fn contextual_hint(&self, step_number: usize, problem: &Problem) -> String {
        if problem.steps.is_empty() || step_number == 0 {
            return problem
                .hints
                .first()
                .cloned()
                .unwrap_or_else(|| "Start by breaking down the problem".to_string());
        }

        if let Some(current) = problem.steps.get(step_number - 1) {
            if let Some(hint) = &current.hint {
                return hint.clone();
            }
        }
        if let Some(next) = problem.steps.get(step_number) {
            return format!("Hint: {}", next.content);
        }
        "Almost done - check your calculations".to_string()
    }

    /// Score a complete submitted solution by the fraction of correct steps.
    pub fn assess_solution(&self, steps: &[SubmittedStep], problem: &Problem) -> SolutionAssessment {
        let submitted: Vec<&SubmittedStep> =
            steps.iter().filter(|s| !s.value.trim().is_empty()).collect();
        let total_expected = problem.steps.len().max(1);
        let correct = submitted.iter().filter(|s| s.correct).count();
        let score = clamp_confidence(
            ((correct as f64 / submitted.len().max(1) as f64) * 100.0).round() as i64,
        );

        let mut strengths = Vec::new();
        if correct > 0 {
            strengths.push("Solved several steps correctly".to_string());
        }
        if submitted.len() >= total_expected {
            strengths.push("Showed all the steps".to_string());
        }

        let mut improvements = Vec::new();
        if score < 80 {
            improvements.push("Check the calculations again".to_string());
        }
        if submitted.len() < total_expected {
            improvements.push("Add the missing steps".to_string());
        }

        let is_correct = score >= 80;
        SolutionAssessment {
            is_correct,
            score,
            strengths,
            improvements,
            feedback: if is_correct {
                "Excellent work!".to_string()
            } else {
                "Good work, but there is room for improvement".to_string()
            },
        }
    }
}

fn token_overlap(input: &str, problem: &Problem) -> bool {
    problem.steps.iter().any(|step| {
        normalize(&step.content)
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '^')
            .filter(|token| token.len() >= 2)
            .any(|token| input.contains(token))
    })
}
