use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use bench360_core::{HistogramSummary, ServerMetricsSummary};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument};

static LE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"le="([^"]+)""#).expect("invalid le label regex"));

const PROMPT_TOKENS: &str = "vllm:prompt_tokens_total";
const GENERATION_TOKENS: &str = "vllm:generation_tokens_total";
const HTTP_COUNT: &str = "http_request_duration_highr_seconds_count";
const HTTP_SUM: &str = "http_request_duration_highr_seconds_sum";

const TTFT: [&str; 2] = [
    "vllm:time_to_first_token_seconds",
    "sglang:time_to_first_token_seconds",
];
const TPOT: [&str; 1] = ["vllm:time_per_output_token_seconds"];
const E2E: [&str; 2] = [
    "vllm:e2e_request_latency_seconds",
    "sglang:e2e_request_latency_seconds",
];
const PREFILL: [&str; 1] = ["vllm:request_prefill_time_seconds"];
const DECODE: [&str; 1] = ["vllm:request_decode_time_seconds"];

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Metrics request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Metrics endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Cumulative histogram components summed over all label sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    pub sum: f64,
    pub count: f64,
    /// `(le, cumulative count)` sorted by bound; `+Inf` is dropped
    pub buckets: Vec<(f64, f64)>,
}

impl Histogram {
    fn parse(lines: &[&str], prefix: &str) -> Self {
        let bucket = format!("{}_bucket", prefix);
        let count = format!("{}_count", prefix);
        let sum = format!("{}_sum", prefix);

        let mut hist = Histogram::default();
        for line in lines {
            if line.starts_with(&bucket) {
                let Some(value) = sample_value(line) else {
                    continue;
                };
                let Some(le) = LE_LABEL
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .filter(|le| le.is_finite())
                else {
                    continue;
                };
                hist.add_bucket(le, value);
            } else if line.starts_with(&count) {
                hist.count += sample_value(line).unwrap_or(0.0);
            } else if line.starts_with(&sum) {
                hist.sum += sample_value(line).unwrap_or(0.0);
            }
        }
        hist
    }

    fn add_bucket(&mut self, le: f64, value: f64) {
        match self.buckets.binary_search_by(|(b, _)| b.total_cmp(&le)) {
            Ok(i) => self.buckets[i].1 += value,
            Err(i) => self.buckets.insert(i, (le, value)),
        }
    }

    fn bucket(&self, le: f64) -> f64 {
        self.buckets
            .binary_search_by(|(b, _)| b.total_cmp(&le))
            .map(|i| self.buckets[i].1)
            .unwrap_or(0.0)
    }

    /// Growth since `base`, every component clamped at zero.
    pub fn delta(&self, base: Option<&Histogram>) -> Histogram {
        let Some(base) = base else {
            return self.clone();
        };
        let mut out = Histogram {
            sum: (self.sum - base.sum).max(0.0),
            count: (self.count - base.count).max(0.0),
            buckets: Vec::new(),
        };
        for le in self.buckets.iter().chain(&base.buckets).map(|(le, _)| *le) {
            if out.buckets.iter().all(|(b, _)| *b != le) {
                out.add_bucket(le, (self.bucket(le) - base.bucket(le)).max(0.0));
            }
        }
        out
    }

    /// Average plus the bucket bounds holding the first, median and last observations.
    pub fn summarize(&self) -> Option<HistogramSummary> {
        if self.count <= 0.0 {
            return None;
        }
        let mut min = None;
        let mut median = None;
        let mut max = None;
        for &(le, cumulative) in &self.buckets {
            if min.is_none() && cumulative > 0.0 {
                min = Some(le);
            }
            if median.is_none() && cumulative >= self.count * 0.5 {
                median = Some(le);
            }
            if cumulative >= self.count {
                max = Some(le);
                break;
            }
        }
        Some(HistogramSummary {
            avg: self.sum / self.count,
            min,
            median,
            max,
            count: self.count,
        })
    }
}

/// Parsed state of a backend `/metrics` page at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub prompt_tokens: f64,
    pub generation_tokens: f64,
    pub http_count: f64,
    pub http_sum: f64,
    pub histograms: BTreeMap<&'static str, Histogram>,
}

impl MetricsSnapshot {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let histograms = TTFT
            .iter()
            .chain(&TPOT)
            .chain(&E2E)
            .chain(&PREFILL)
            .chain(&DECODE)
            .map(|prefix| (*prefix, Histogram::parse(&lines, prefix)))
            .collect();

        Self {
            prompt_tokens: counter_total(&lines, PROMPT_TOKENS),
            generation_tokens: counter_total(&lines, GENERATION_TOKENS),
            http_count: counter_total(&lines, HTTP_COUNT),
            http_sum: counter_total(&lines, HTTP_SUM),
            histograms,
        }
    }

    /// Server-side view of the work done between `base` and this snapshot.
    pub fn since(&self, base: Option<&MetricsSnapshot>) -> ServerMetricsSummary {
        let counter = |now: f64, then: fn(&MetricsSnapshot) -> f64| match base {
            Some(b) => (now - then(b)).max(0.0),
            None => now,
        };
        let prompt = counter(self.prompt_tokens, |b| b.prompt_tokens);
        let generation = counter(self.generation_tokens, |b| b.generation_tokens);
        let http_count = counter(self.http_count, |b| b.http_count);
        let http_sum = counter(self.http_sum, |b| b.http_sum);

        let delta = |prefix: &str| -> Histogram {
            let now = self.histograms.get(prefix).cloned().unwrap_or_default();
            now.delta(base.and_then(|b| b.histograms.get(prefix)))
        };
        let first_summary = |prefixes: &[&str]| prefixes.iter().find_map(|p| delta(p).summarize());

        let decode_sum = delta(DECODE[0]).sum;
        let e2e_sum = delta(E2E[0]).sum;

        ServerMetricsSummary {
            prompt_tokens: prompt,
            generation_tokens: generation,
            ttft_secs: first_summary(&TTFT[..]),
            tpot_secs: first_summary(&TPOT[..]),
            e2e_secs: first_summary(&E2E[..]),
            prefill_secs: first_summary(&PREFILL[..]),
            decode_secs: first_summary(&DECODE[..]),
            http_avg_secs: (http_count > 0.0).then(|| http_sum / http_count),
            decode_tokens_per_sec: (decode_sum > 0.0).then(|| generation / decode_sum),
            overall_tokens_per_sec: (e2e_sum > 0.0).then(|| (generation + prompt) / e2e_sum),
        }
    }
}

/// Fetches a backend's Prometheus exposition page.
#[derive(Debug, Clone)]
pub struct PrometheusScraper {
    url: String,
    client: reqwest::Client,
}

impl PrometheusScraper {
    pub fn new(url: impl Into<String>) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn scrape(&self) -> Result<MetricsSnapshot, ScrapeError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(ScrapeError::Status(resp.status()));
        }
        let text = resp.text().await?;
        debug!(bytes = text.len(), "Scraped metrics");
        Ok(MetricsSnapshot::parse(&text))
    }
}

fn counter_total(lines: &[&str], prefix: &str) -> f64 {
    lines
        .iter()
        .filter(|l| l.starts_with(prefix))
        .filter_map(|l| sample_value(l))
        .sum()
}

fn sample_value(line: &str) -> Option<f64> {
    line.split_whitespace().last()?.parse().ok()
}
