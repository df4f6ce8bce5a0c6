//! Golden token regression harness.
//!
//! A [`GoldenCase`] pins the greedy continuation of a prompt. The harness
//! replays every case against anything implementing [`GoldenTestable`] and
//! reports the first divergent position per case.
//!
//! ```rust,ignore
//! let mut harness = GoldenTestHarness::new();
//! harness.add_case(GoldenCase::greedy("toy", vec![1, 2, 3], expected));
//! let summary = session.run_golden_tests(&harness);
//! assert!(summary.all_passed(), "{}", summary);
//! ```
//!
//! Cases run greedily, so results only depend on the weights and the
//! floating-point path; compare on the same device and dtype they were
//! recorded with.

use super::{GenerateConfig, GenerationSession};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// A prompt and its expected greedy continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenCase {
    /// Case name, unique within a harness.
    pub name: String,
    /// Prompt ids.
    pub prompt: Vec<u32>,
    /// Expected emitted ids.
    pub expected: Vec<u32>,
    /// Generation budget; defaults to `expected.len()`.
    pub max_tokens: usize,
    /// Free-form labels for filtering.
    pub tags: Vec<String>,
}

impl GoldenCase {
    /// Greedy case whose budget equals the expected length.
    pub fn greedy(name: impl Into<String>, prompt: Vec<u32>, expected: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            max_tokens: expected.len(),
            prompt,
            expected,
            tags: Vec::new(),
        }
    }

    /// Parse whitespace-separated decimal ids, skipping anything else.
    pub fn parse(name: impl Into<String>, prompt: &str, expected: &str) -> Self {
        let ids = |s: &str| s.split_whitespace().filter_map(|t| t.parse().ok()).collect();
        Self::greedy(name, ids(prompt), ids(expected))
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Override the generation budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Outcome of one case.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenResult {
    /// Case name.
    pub name: String,
    /// Expected ids.
    pub expected: Vec<u32>,
    /// Produced ids; empty when the run errored.
    pub actual: Vec<u32>,
    /// First index where the sequences differ, including length mismatches.
    pub first_divergence: Option<usize>,
    /// Generation error, if any.
    pub error: Option<String>,
    /// Wall time of the run.
    pub time_ms: f64,
}

impl GoldenResult {
    /// Compare `actual` against `expected`.
    pub fn compare(name: String, expected: Vec<u32>, actual: Vec<u32>, time_ms: f64) -> Self {
        let first_divergence = (0..expected.len().max(actual.len()))
            .find(|&i| expected.get(i) != actual.get(i));
        Self {
            name,
            expected,
            actual,
            first_divergence,
            error: None,
            time_ms,
        }
    }

    /// A case whose generation failed.
    pub fn errored(name: String, expected: Vec<u32>, error: String) -> Self {
        Self {
            name,
            expected,
            actual: Vec::new(),
            first_divergence: None,
            error: Some(error),
            time_ms: 0.0,
        }
    }

    /// Exact match and no error.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.first_divergence.is_none()
    }

    /// Share of matching positions over the longer sequence, in percent.
    pub fn match_percentage(&self) -> f32 {
        let len = self.expected.len().max(self.actual.len());
        if len == 0 {
            return if self.passed() { 100.0 } else { 0.0 };
        }
        let matches = self
            .expected
            .iter()
            .zip(&self.actual)
            .filter(|(e, a)| e == a)
            .count();
        matches as f32 / len as f32 * 100.0
    }
}

impl fmt::Display for GoldenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "PASS" } else { "FAIL" };
        write!(f, "[{}] {} ({:.1}ms)", status, self.name, self.time_ms)?;
        if let Some(err) = &self.error {
            write!(f, "\n  error: {}", err)?;
        }
        if let Some(idx) = self.first_divergence {
            let show = |t: Option<&u32>| t.map(|t| t.to_string()).unwrap_or_else(|| "EOF".to_string());
            write!(
                f,
                "\n  diverged at {}: expected {}, got {} ({:.1}% match)",
                idx,
                show(self.expected.get(idx)),
                show(self.actual.get(idx)),
                self.match_percentage()
            )?;
        }
        Ok(())
    }
}

/// Results of a harness run, ordered by case name.
#[derive(Debug, Clone, Default)]
pub struct GoldenSummary {
    /// Per-case results.
    pub results: BTreeMap<String, GoldenResult>,
    /// Sum of case times.
    pub total_time_ms: f64,
}

impl GoldenSummary {
    /// Collect results.
    pub fn from_results(results: Vec<GoldenResult>) -> Self {
        let total_time_ms = results.iter().map(|r| r.time_ms).sum();
        Self {
            results: results.into_iter().map(|r| (r.name.clone(), r)).collect(),
            total_time_ms,
        }
    }

    /// Number of cases.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of passing cases.
    pub fn passed(&self) -> usize {
        self.results.values().filter(|r| r.passed()).count()
    }

    /// True when every case passed.
    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }
}

impl fmt::Display for GoldenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "golden: {}/{} passed in {:.1}ms",
            self.passed(),
            self.total(),
            self.total_time_ms
        )?;
        for result in self.results.values().filter(|r| !r.passed()) {
            writeln!(f, "  {}", result)?;
        }
        Ok(())
    }
}

/// A set of golden cases.
#[derive(Debug, Clone, Default)]
pub struct GoldenTestHarness {
    cases: Vec<GoldenCase>,
}

impl GoldenTestHarness {
    /// Empty harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a case.
    pub fn add_case(&mut self, case: GoldenCase) {
        self.cases.push(case);
    }

    /// All cases.
    pub fn cases(&self) -> &[GoldenCase] {
        &self.cases
    }

    /// Cases carrying `tag`.
    pub fn filter_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a GoldenCase> {
        self.cases.iter().filter(move |c| c.tags.iter().any(|t| t == tag))
    }

    /// Run every case through `generate(prompt, max_tokens)`.
    pub fn run_with<F>(&self, mut generate: F) -> GoldenSummary
    where
        F: FnMut(&[u32], usize) -> crate::Result<Vec<u32>>,
    {
        let results = self
            .cases
            .iter()
            .map(|case| {
                let start = Instant::now();
                match generate(&case.prompt, case.max_tokens) {
                    Ok(actual) => GoldenResult::compare(
                        case.name.clone(),
                        case.expected.clone(),
                        actual,
                        start.elapsed().as_secs_f64() * 1000.0,
                    ),
                    Err(err) => GoldenResult::errored(case.name.clone(), case.expected.clone(), err.to_string()),
                }
            })
            .collect();
        GoldenSummary::from_results(results)
    }
}

/// Something that can produce a greedy continuation.
pub trait GoldenTestable {
    /// Greedy continuation of `prompt`, at most `max_tokens` long.
    fn generate_greedy(&mut self, prompt: &[u32], max_tokens: usize) -> crate::Result<Vec<u32>>;

    /// Replay every case of `harness`.
    fn run_golden_tests(&mut self, harness: &GoldenTestHarness) -> GoldenSummary {
        harness.run_with(|prompt, max_tokens| self.generate_greedy(prompt, max_tokens))
    }
}

impl GoldenTestable for GenerationSession {
    /// Resets the session, so every case starts from an empty cache.
    fn generate_greedy(&mut self, prompt: &[u32], max_tokens: usize) -> crate::Result<Vec<u32>> {
        self.reset();
        let output = self.generate(prompt, &GenerateConfig::greedy(max_tokens), |_| true)?;
        Ok(output.tokens)
    }
}
