use std::collections::{BTreeMap, HashMap};

use super::QualityScorer;
use crate::Reference;

/// Exact match and token F1 against the best-matching reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct QaScorer;

impl QualityScorer for QaScorer {
    fn score(&self, generated: &str, reference: &Reference) -> BTreeMap<String, f64> {
        let prediction = normalize_answer(generated);
        let best = best_over(reference, |answer| {
            let truth = normalize_answer(answer);
            let exact = if prediction == truth { 1.0 } else { 0.0 };
            (exact, token_f1(&prediction, &truth))
        });

        let Some((exact, f1)) = best else {
            return BTreeMap::new();
        };
        BTreeMap::from([("exact_match".to_string(), exact), ("f1".to_string(), f1)])
    }
}

/// ROUGE-1 and ROUGE-L F-measures.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizationScorer;

impl QualityScorer for SummarizationScorer {
    fn score(&self, generated: &str, reference: &Reference) -> BTreeMap<String, f64> {
        let candidate = tokens(generated);
        let best = best_over(reference, |answer| {
            let truth = tokens(answer);
            (rouge_1(&candidate, &truth), rouge_l(&candidate, &truth))
        });

        let Some((r1, rl)) = best else {
            return BTreeMap::new();
        };
        BTreeMap::from([("rouge1".to_string(), r1), ("rougeL".to_string(), rl)])
    }
}

/// Whitespace- and case-insensitive query match.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlScorer;

impl QualityScorer for SqlScorer {
    fn score(&self, generated: &str, reference: &Reference) -> BTreeMap<String, f64> {
        let prediction = normalize_sql(extract_sql(generated));
        let best = best_over(reference, |answer| {
            let truth = normalize_sql(answer);
            let exact = if prediction == truth { 1.0 } else { 0.0 };
            (exact, token_f1(&prediction, &truth))
        });

        let Some((exact, f1)) = best else {
            return BTreeMap::new();
        };
        BTreeMap::from([
            ("sql_exact_match".to_string(), exact),
            ("sql_token_f1".to_string(), f1),
        ])
    }
}

/// Picks the reference with the highest first metric, then second.
fn best_over<F>(reference: &Reference, mut f: F) -> Option<(f64, f64)>
where
    F: FnMut(&str) -> (f64, f64),
{
    reference
        .answers()
        .into_iter()
        .map(|answer| f(answer))
        .fold(None, |best, cur| match best {
            None => Some(cur),
            Some(b) if (cur.0, cur.1) > (b.0, b.1) => Some(cur),
            Some(b) => Some(b),
        })
}

fn normalize_answer(s: &str) -> String {
    let lowered: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    lowered
        .split_whitespace()
        .filter(|w| !matches!(*w, "a" | "an" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokens(s: &str) -> Vec<String> {
    normalize_answer(s)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn token_f1(prediction: &str, truth: &str) -> f64 {
    let pred: Vec<&str> = prediction.split_whitespace().collect();
    let gold: Vec<&str> = truth.split_whitespace().collect();
    if pred.is_empty() || gold.is_empty() {
        return if pred.is_empty() && gold.is_empty() { 1.0 } else { 0.0 };
    }

    let mut counts: HashMap<&str, i64> = HashMap::new();
    for t in gold.iter().copied() {
        *counts.entry(t).or_default() += 1;
    }
    let mut overlap = 0usize;
    for t in &pred {
        if let Some(c) = counts.get_mut(t) {
            if *c > 0 {
                *c -= 1;
                overlap += 1;
            }
        }
    }

    f_measure(overlap, pred.len(), gold.len())
}

fn rouge_1(candidate: &[String], truth: &[String]) -> f64 {
    token_f1(&candidate.join(" "), &truth.join(" "))
}

fn rouge_l(candidate: &[String], truth: &[String]) -> f64 {
    if candidate.is_empty() || truth.is_empty() {
        return 0.0;
    }
    // Single-row LCS table
    let mut row = vec![0usize; truth.len() + 1];
    for c in candidate {
        let mut diag = 0;
        for (j, t) in truth.iter().enumerate() {
            let up = row[j + 1];
            row[j + 1] = if c == t { diag + 1 } else { up.max(row[j]) };
            diag = up;
        }
    }
    f_measure(row[truth.len()], candidate.len(), truth.len())
}

fn f_measure(overlap: usize, predicted: usize, gold: usize) -> f64 {
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / predicted as f64;
    let recall = overlap as f64 / gold as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Pulls the query out of a fenced code block when the model wrapped it in one.
fn extract_sql(generated: &str) -> &str {
    let Some(start) = generated.find("```") else {
        return generated;
    };
    let body = &generated[start + 3..];
    let body = body.strip_prefix("sql").unwrap_or(body);
    match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    }
}

fn normalize_sql(s: &str) -> String {
    s.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
