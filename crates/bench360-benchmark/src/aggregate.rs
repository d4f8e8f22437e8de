use std::collections::{BTreeMap, HashMap};

use bench360_core::{
    CostConfig, EnergyBasis, EnergyReport, LatencyStats, MetricSample, Outcome, RequestCounts,
    RunConfig, RunReport, SampleRecord, SampleScores, ServerMetricsSummary, TelemetryReading,
    TelemetrySummary, Throughput,
};

use crate::scenario::ScenarioOutcome;

/// Minimum share of the run window that valid power readings must span for a measured figure.
const MEASURED_COVERAGE: f64 = 0.9;
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Everything the aggregator reads. Nothing here is mutated.
#[derive(Debug, Clone, Copy)]
pub struct AggregateInput<'a> {
    pub config: &'a RunConfig,
    pub outcome: &'a ScenarioOutcome,
    pub telemetry: &'a [TelemetryReading],
    pub quality: &'a [SampleScores],
    pub cost: &'a CostConfig,
    pub server_metrics: Option<&'a ServerMetricsSummary>,
}

/// Build the run report. Pure: the same input always yields the same report.
pub fn aggregate(input: &AggregateInput<'_>) -> RunReport {
    let outcome = input.outcome;
    let samples = &outcome.samples;
    let window_ms = (outcome.ended_ms - outcome.started_ms).max(0.0);
    let duration_secs = window_ms / 1000.0;

    let requests = count_requests(samples);
    let success_rate = if requests.total > 0 {
        requests.success as f64 / requests.total as f64
    } else {
        0.0
    };

    let successes: Vec<&MetricSample> = samples.iter().filter(|s| s.is_success()).collect();
    let ttft = latency_stats(successes.iter().filter_map(|s| s.ttft_ms()).collect());
    let latency = latency_stats(successes.iter().map(|s| s.latency_ms()).collect());
    let inter_token_ms = mean(&successes.iter().filter_map(|s| s.inter_token_ms()).collect::<Vec<_>>());

    let prompt_tokens: u64 = successes.iter().map(|s| s.prompt_tokens as u64).sum();
    let generated_tokens: u64 = successes.iter().map(|s| s.generated_tokens as u64).sum();
    let throughput = Throughput {
        tokens_per_sec: per_sec(generated_tokens as f64, duration_secs),
        requests_per_sec: per_sec(requests.success as f64, duration_secs),
        prompt_tokens,
        generated_tokens,
    };

    let window = readings_in_window(input.telemetry, outcome.started_ms, outcome.ended_ms);
    let power = integrate_power(&window, window_ms);
    let telemetry = summarize_telemetry(&window, power.coverage);
    let energy = energy_report(&window, &power, window_ms, requests.success, input.cost);

    let (quality, quality_samples) = mean_quality(input.quality);

    RunReport {
        config: input.config.clone(),
        config_hash: input.config.config_hash(),
        final_state: outcome.state,
        abort_reason: outcome.abort_reason.clone(),
        started_ms: outcome.started_ms,
        ended_ms: outcome.ended_ms,
        duration_secs,
        requests,
        success_rate,
        ttft,
        latency,
        inter_token_ms,
        throughput,
        telemetry,
        energy,
        quality,
        quality_samples,
        server_metrics: input.server_metrics.cloned(),
    }
}

/// Per-request detail rows, with each sample's quality scores attached.
pub fn sample_details(samples: &[MetricSample], quality: &[SampleScores]) -> Vec<SampleRecord> {
    let by_id: HashMap<u64, &BTreeMap<String, f64>> =
        quality.iter().map(|q| (q.request_id, &q.scores)).collect();
    samples
        .iter()
        .map(|s| SampleRecord {
            sample: s.clone(),
            latency_ms: s.latency_ms(),
            ttft_ms: s.ttft_ms(),
            quality: by_id.get(&s.request_id).map(|q| (*q).clone()).unwrap_or_default(),
        })
        .collect()
}

fn count_requests(samples: &[MetricSample]) -> RequestCounts {
    let mut counts = RequestCounts {
        total: samples.len() as u32,
        ..Default::default()
    };
    for s in samples {
        match s.outcome {
            Outcome::Success => counts.success += 1,
            Outcome::Timeout => counts.timeout += 1,
            Outcome::Error(kind) => {
                counts.error += 1;
                *counts
                    .errors_by_kind
                    .entry(kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
    }
    counts
}

fn latency_stats(mut values: Vec<f64>) -> Option<LatencyStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(LatencyStats {
        mean_ms: values.iter().sum::<f64>() / values.len() as f64,
        p50_ms: percentile(&values, 50.0),
        p90_ms: percentile(&values, 90.0),
        p99_ms: percentile(&values, 99.0),
        min_ms: values[0],
        max_ms: values[values.len() - 1],
        count: values.len() as u32,
    })
}

/// Linear interpolation between closest ranks over sorted input.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn per_sec(value: f64, secs: f64) -> f64 {
    if secs > 0.0 {
        value / secs
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn peak(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn readings_in_window(readings: &[TelemetryReading], start: f64, end: f64) -> Vec<&TelemetryReading> {
    let mut window: Vec<&TelemetryReading> = readings
        .iter()
        .filter(|r| r.timestamp_ms >= start && r.timestamp_ms <= end)
        .collect();
    window.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));
    window
}

struct PowerIntegral {
    /// Watt-milliseconds over spans bounded by two valid power readings
    covered_wms: f64,
    covered_ms: f64,
    coverage: f64,
    mean_watts: Option<f64>,
    peak_watts: Option<f64>,
}

fn integrate_power(window: &[&TelemetryReading], window_ms: f64) -> PowerIntegral {
    let mut covered_wms = 0.0;
    let mut covered_ms = 0.0;
    for pair in window.windows(2) {
        if let (Some(p0), Some(p1)) = (pair[0].values.power_watts, pair[1].values.power_watts) {
            let dt = pair[1].timestamp_ms - pair[0].timestamp_ms;
            covered_wms += (p0 + p1) / 2.0 * dt;
            covered_ms += dt;
        }
    }
    let watts: Vec<f64> = window.iter().filter_map(|r| r.values.power_watts).collect();
    let coverage = if window_ms > 0.0 {
        (covered_ms / window_ms).min(1.0)
    } else {
        0.0
    };
    PowerIntegral {
        covered_wms,
        covered_ms,
        coverage,
        mean_watts: mean(&watts),
        peak_watts: peak(&watts),
    }
}

fn summarize_telemetry(window: &[&TelemetryReading], coverage: f64) -> TelemetrySummary {
    let field = |f: fn(&TelemetryReading) -> Option<f64>| -> Vec<f64> {
        window.iter().filter_map(|r| f(r)).collect()
    };
    let gpu_util = field(|r| r.values.gpu_util_pct);
    let gpu_mem = field(|r| r.values.gpu_mem_mb);
    let cpu_util = field(|r| r.values.cpu_util_pct);
    let power = field(|r| r.values.power_watts);

    TelemetrySummary {
        readings: window.len() as u32,
        unavailable_readings: window.iter().filter(|r| r.is_unavailable()).count() as u32,
        coverage,
        gpu_util_mean_pct: mean(&gpu_util),
        gpu_util_peak_pct: peak(&gpu_util),
        gpu_mem_mean_mb: mean(&gpu_mem),
        gpu_mem_peak_mb: peak(&gpu_mem),
        cpu_util_mean_pct: mean(&cpu_util),
        cpu_util_peak_pct: peak(&cpu_util),
        power_mean_watts: mean(&power),
        power_peak_watts: peak(&power),
    }
}

fn energy_report(
    window: &[&TelemetryReading],
    power: &PowerIntegral,
    window_ms: f64,
    successes: u32,
    cost: &CostConfig,
) -> EnergyReport {
    let complete = window.len() >= 2 && window.iter().all(|r| r.values.power_watts.is_some());
    let measured = complete && power.coverage >= MEASURED_COVERAGE;

    let (basis, energy_wh, low, high) = if measured {
        let wh = power.covered_wms / MS_PER_HOUR;
        (EnergyBasis::Measured, Some(wh), Some(wh), Some(wh))
    } else {
        let low = (power.covered_ms > 0.0).then(|| power.covered_wms / MS_PER_HOUR);
        let point = power.mean_watts.map(|w| w * window_ms / MS_PER_HOUR);
        let high = power.peak_watts.map(|w| w * window_ms / MS_PER_HOUR);
        let low = low.or(point.map(|_| 0.0));
        (EnergyBasis::Estimated, point, low, high)
    };

    let per_request = |v: f64| (successes > 0).then(|| v / successes as f64);
    let energy_cost = energy_wh.map(|wh| wh / 1000.0 * cost.kwh_rate);

    EnergyReport {
        basis,
        energy_wh,
        energy_wh_low: low,
        energy_wh_high: high,
        energy_per_request_wh: energy_wh.and_then(per_request),
        cost: energy_cost,
        cost_per_request: energy_cost.and_then(per_request),
    }
}

fn mean_quality(scores: &[SampleScores]) -> (BTreeMap<String, f64>, u32) {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for s in scores {
        for (metric, value) in &s.scores {
            let entry = sums.entry(metric.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    let means = sums
        .into_iter()
        .map(|(metric, (sum, n))| (metric, sum / n as f64))
        .collect();
    (means, scores.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench360_core::{ErrorKind, Lane, Scenario, ScenarioState, TelemetryValues};

    fn config() -> RunConfig {
        serde_json::from_value(serde_json::json!({
            "backend": "vllm",
            "model": "llama-3-8b",
            "task": "qa",
            "scenario": {"kind": "single", "samples": 10}
        }))
        .unwrap()
    }

    fn success(id: u64, submitted: f64, latency: f64) -> MetricSample {
        MetricSample {
            request_id: id,
            prompt_index: 0,
            lane: Lane::Sequential,
            submitted_ms: submitted,
            first_token_ms: Some(submitted + 50.0),
            completed_ms: submitted + latency,
            prompt_tokens: 8,
            generated_tokens: 20,
            outcome: Outcome::Success,
            text: Some("answer".to_string()),
        }
    }

    fn outcome(samples: Vec<MetricSample>, ended_ms: f64) -> ScenarioOutcome {
        ScenarioOutcome {
            state: ScenarioState::Done,
            samples,
            started_ms: 0.0,
            ended_ms,
            abort_reason: None,
            batches: 0,
        }
    }

    fn power_reading(t: f64, watts: f64) -> TelemetryReading {
        TelemetryReading::new(
            t,
            TelemetryValues {
                gpu_util_pct: Some(90.0),
                power_watts: Some(watts),
                ..Default::default()
            },
        )
    }

    fn input<'a>(
        config: &'a RunConfig,
        outcome: &'a ScenarioOutcome,
        telemetry: &'a [TelemetryReading],
        quality: &'a [SampleScores],
        cost: &'a CostConfig,
    ) -> AggregateInput<'a> {
        AggregateInput {
            config,
            outcome,
            telemetry,
            quality,
            cost,
            server_metrics: None,
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&v, 50.0), 25.0);
        assert_eq!(percentile(&v, 0.0), 10.0);
        assert_eq!(percentile(&v, 100.0), 40.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_sequential_run_statistics() {
        let config = config();
        let samples = (0..10).map(|i| success(i + 1, i as f64 * 200.0, 200.0)).collect();
        let outcome = outcome(samples, 2000.0);
        let cost = CostConfig::default();
        let report = aggregate(&input(&config, &outcome, &[], &[], &cost));

        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.requests.total, 10);
        let latency = report.latency.unwrap();
        assert_eq!(latency.p50_ms, 200.0);
        assert_eq!(latency.p99_ms, 200.0);
        assert_eq!(report.ttft.unwrap().p50_ms, 50.0);
        assert_eq!(report.duration_secs, 2.0);
        assert_eq!(report.throughput.tokens_per_sec, 100.0);
        assert_eq!(report.throughput.requests_per_sec, 5.0);
        assert_eq!(report.inter_token_ms, Some(150.0 / 19.0));
        assert_eq!(report.config_hash, config.config_hash());
    }

    #[test]
    fn test_failures_count_toward_success_rate_only() {
        let config = config();
        let samples = vec![
            success(1, 0.0, 100.0),
            MetricSample::timed_out(2, 0, Lane::Sequential, 100.0, 5000.0),
            MetricSample::failed(3, 0, Lane::Sequential, 0.0, 10.0, ErrorKind::ConnectionRefused),
            success(4, 0.0, 300.0),
        ];
        let outcome = outcome(samples, 5000.0);
        let quality = vec![
            SampleScores {
                request_id: 1,
                scores: BTreeMap::from([("f1".to_string(), 1.0)]),
            },
            SampleScores {
                request_id: 4,
                scores: BTreeMap::from([("f1".to_string(), 0.5)]),
            },
        ];
        let cost = CostConfig::default();
        let report = aggregate(&input(&config, &outcome, &[], &quality, &cost));

        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.requests.timeout, 1);
        assert_eq!(report.requests.errors_by_kind["connection_refused"], 1);
        // latency only over successful requests
        assert_eq!(report.latency.unwrap().max_ms, 300.0);
        assert_eq!(report.quality["f1"], 0.75);
        assert_eq!(report.quality_samples, 2);
    }

    #[test]
    fn test_missing_telemetry_still_reports_estimated_energy() {
        let config = config();
        let outcome = outcome(vec![success(1, 0.0, 100.0)], 1000.0);
        let telemetry = vec![
            TelemetryReading::unavailable(0.0, "nvidia-smi not found"),
            TelemetryReading::unavailable(500.0, "nvidia-smi not found"),
        ];
        let cost = CostConfig::default();
        let report = aggregate(&input(&config, &outcome, &telemetry, &[], &cost));

        assert_eq!(report.energy.basis, EnergyBasis::Estimated);
        assert!(report.energy.energy_wh.is_none());
        assert_eq!(report.telemetry.coverage, 0.0);
        assert_eq!(report.telemetry.unavailable_readings, 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["energy"]["basis"], "estimated");
    }

    #[test]
    fn test_constant_power_is_measured() {
        let config = config();
        let outcome = outcome(vec![success(1, 0.0, 100.0), success(2, 0.0, 100.0)], 10_000.0);
        let telemetry: Vec<_> = (0..=20).map(|i| power_reading(i as f64 * 500.0, 100.0)).collect();
        let cost = CostConfig { kwh_rate: 0.2 };
        let report = aggregate(&input(&config, &outcome, &telemetry, &[], &cost));

        let energy = report.energy;
        assert_eq!(energy.basis, EnergyBasis::Measured);
        let wh = energy.energy_wh.unwrap();
        assert!((wh - 1000.0 / 3600.0).abs() < 1e-9);
        assert!((energy.energy_per_request_wh.unwrap() - wh / 2.0).abs() < 1e-12);
        assert!((energy.cost.unwrap() - wh / 1000.0 * 0.2).abs() < 1e-12);
        assert_eq!(report.telemetry.coverage, 1.0);
        assert_eq!(report.telemetry.power_peak_watts, Some(100.0));
    }

    #[test]
    fn test_gappy_power_gives_interval_estimate() {
        let config = config();
        let outcome = outcome(vec![success(1, 0.0, 100.0)], 10_000.0);
        let telemetry = vec![
            power_reading(0.0, 100.0),
            power_reading(1000.0, 200.0),
            TelemetryReading::unavailable(2000.0, "timeout"),
            power_reading(9000.0, 150.0),
            // outside the window
            power_reading(12_000.0, 900.0),
        ];
        let cost = CostConfig::default();
        let report = aggregate(&input(&config, &outcome, &telemetry, &[], &cost));

        let energy = report.energy;
        assert_eq!(energy.basis, EnergyBasis::Estimated);
        let low = energy.energy_wh_low.unwrap();
        let point = energy.energy_wh.unwrap();
        let high = energy.energy_wh_high.unwrap();
        assert!((low - 150.0 * 1000.0 / MS_PER_HOUR).abs() < 1e-12);
        assert!((point - 150.0 * 10_000.0 / MS_PER_HOUR).abs() < 1e-12);
        assert!((high - 200.0 * 10_000.0 / MS_PER_HOUR).abs() < 1e-12);
        assert!(low <= point && point <= high);
        assert_eq!(report.telemetry.readings, 4);
        assert!((report.telemetry.coverage - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_ignores_sample_order() {
        let config = config();
        let forward: Vec<_> = (0..6).map(|i| success(i + 1, i as f64 * 100.0, 100.0 + i as f64 * 25.0)).collect();
        let mut backward = forward.clone();
        backward.reverse();
        let telemetry: Vec<_> = (0..=6).map(|i| power_reading(i as f64 * 100.0, 50.0)).collect();
        let cost = CostConfig::default();

        let a = outcome(forward, 600.0);
        let b = outcome(backward, 600.0);
        let first = aggregate(&input(&config, &a, &telemetry, &[], &cost));
        assert_eq!(first, aggregate(&input(&config, &a, &telemetry, &[], &cost)));
        let reordered = aggregate(&input(&config, &b, &telemetry, &[], &cost));
        assert_eq!(first.latency, reordered.latency);
        assert_eq!(first.throughput, reordered.throughput);
    }

    #[test]
    fn test_sample_details_attach_quality() {
        let samples = vec![
            success(1, 0.0, 100.0),
            MetricSample::timed_out(2, 0, Lane::Sequential, 0.0, 900.0),
        ];
        let quality = vec![SampleScores {
            request_id: 1,
            scores: BTreeMap::from([("exact_match".to_string(), 1.0)]),
        }];
        let rows = sample_details(&samples, &quality);
        assert_eq!(rows[0].quality["exact_match"], 1.0);
        assert!(rows[1].quality.is_empty());
        assert_eq!(rows[1].latency_ms, 900.0);
    }

    #[test]
    fn test_scenario_label_survives_in_report() {
        let config = config();
        let outcome = outcome(vec![], 0.0);
        let cost = CostConfig::default();
        let report = aggregate(&input(&config, &outcome, &[], &[], &cost));
        assert_eq!(report.config.scenario, Scenario::Single { samples: 10 });
        assert_eq!(report.success_rate, 0.0);
        assert!(report.latency.is_none());
        assert_eq!(report.throughput.tokens_per_sec, 0.0);
    }
}
