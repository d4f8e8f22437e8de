use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bench360_core::{
    Bench360Error, GenerationParams, Lane, LimitsConfig, MetricSample, PromptUnit, Result,
    Scenario, ScenarioState,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::arrival::PoissonArrivals;
use crate::client::{InferenceClient, RequestSpec};
use crate::clock::RunClock;
use crate::failure_window::FailureWindow;

#[derive(Debug, Clone, Copy)]
pub struct DriverLimits {
    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    pub abort_grace: Duration,
}

impl From<&LimitsConfig> for DriverLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            request_timeout: limits.request_timeout(),
            drain_timeout: limits.drain_timeout(),
            abort_grace: limits.abort_grace(),
        }
    }
}

/// Per-run state handed to the driver. Nothing here is shared between runs.
#[derive(Debug)]
pub struct RunContext {
    pub clock: RunClock,
    pub cancel: CancellationToken,
    pub failures: FailureWindow,
    pub rng: StdRng,
    pub limits: DriverLimits,
}

impl RunContext {
    pub fn new(clock: RunClock, cancel: CancellationToken, limits: &LimitsConfig, seed: u64) -> Self {
        Self {
            clock,
            cancel,
            failures: FailureWindow::new(limits.failure_window, limits.max_failure_fraction),
            rng: StdRng::seed_from_u64(seed),
            limits: DriverLimits::from(limits),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    StateChanged { from: ScenarioState, to: ScenarioState },
    BatchStarted { index: u32, size: u32 },
    Sample { sample: MetricSample },
    Aborted { reason: String },
}

#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub state: ScenarioState,
    /// Completion order, one entry per submitted request
    pub samples: Vec<MetricSample>,
    pub started_ms: f64,
    pub ended_ms: f64,
    pub abort_reason: Option<String>,
    pub batches: u32,
}

impl ScenarioOutcome {
    pub fn is_aborted(&self) -> bool {
        self.state == ScenarioState::Aborted
    }
}

#[derive(Debug, Clone)]
struct Pending {
    request_id: u64,
    prompt_index: usize,
    lane: Lane,
    dispatched_ms: f64,
}

impl Pending {
    fn into_timeout(self, completed_ms: f64) -> MetricSample {
        MetricSample::timed_out(
            self.request_id,
            self.prompt_index,
            self.lane,
            self.dispatched_ms,
            completed_ms,
        )
    }
}

/// Cheap handle that allocates request ids and issues requests from any task.
#[derive(Clone)]
struct Requester {
    client: Arc<dyn InferenceClient>,
    prompts: Arc<[PromptUnit]>,
    params: Arc<GenerationParams>,
    ids: Arc<AtomicU64>,
    timeout: Duration,
    clock: RunClock,
}

impl Requester {
    fn next(&self, lane: Lane) -> Pending {
        let request_id = self.ids.fetch_add(1, Ordering::Relaxed);
        Pending {
            request_id,
            prompt_index: ((request_id - 1) % self.prompts.len() as u64) as usize,
            lane,
            dispatched_ms: self.clock.now_ms(),
        }
    }

    async fn send(&self, req: Pending) -> MetricSample {
        let spec = RequestSpec {
            request_id: req.request_id,
            prompt_index: req.prompt_index,
            lane: req.lane,
            prompt: &self.prompts[req.prompt_index],
            params: &self.params,
            timeout: self.timeout,
            clock: self.clock,
        };
        self.client.send(spec).await
    }
}

enum UserEvent {
    Submitted(Pending),
    Completed(MetricSample),
}

/// Drives one scenario over an inference client.
pub struct ScenarioDriver {
    client: Arc<dyn InferenceClient>,
    prompts: Arc<[PromptUnit]>,
    params: Arc<GenerationParams>,
    events: Option<mpsc::Sender<DriverEvent>>,
    state: ScenarioState,
    samples: Vec<MetricSample>,
    abort_reason: Option<String>,
    batches: u32,
}

impl ScenarioDriver {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        prompts: Arc<[PromptUnit]>,
        params: GenerationParams,
    ) -> Result<Self> {
        if prompts.is_empty() {
            return Err(Bench360Error::Config("prompt set is empty".to_string()));
        }
        Ok(Self {
            client,
            prompts,
            params: Arc::new(params),
            events: None,
            state: ScenarioState::Idle,
            samples: Vec::new(),
            abort_reason: None,
            batches: 0,
        })
    }

    pub fn with_events(mut self, tx: mpsc::Sender<DriverEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    #[instrument(skip_all, fields(scenario = scenario.label()))]
    pub async fn run(mut self, scenario: Scenario, mut ctx: RunContext) -> ScenarioOutcome {
        let stop = ctx.cancel.child_token();
        let requester = Requester {
            client: Arc::clone(&self.client),
            prompts: Arc::clone(&self.prompts),
            params: Arc::clone(&self.params),
            ids: Arc::new(AtomicU64::new(1)),
            timeout: ctx.limits.request_timeout,
            clock: ctx.clock,
        };

        let started_ms = ctx.clock.now_ms();
        self.transition(ScenarioState::Running);

        match scenario {
            Scenario::Single { samples } => {
                self.run_fixed(&requester, samples, None, &mut ctx, &stop).await
            }
            Scenario::Batch {
                samples,
                batch_size,
            } => {
                self.run_fixed(&requester, samples, Some(batch_size), &mut ctx, &stop)
                    .await
            }
            Scenario::Server {
                run_time_secs,
                concurrent_users,
                requests_per_user_per_min,
            } => {
                self.run_server(
                    &requester,
                    Duration::from_secs(run_time_secs),
                    concurrent_users,
                    requests_per_user_per_min,
                    &mut ctx,
                    &stop,
                )
                .await
            }
        }

        if stop.is_cancelled() {
            let reason = self
                .abort_reason
                .get_or_insert_with(|| "cancelled".to_string())
                .clone();
            self.transition(ScenarioState::Aborted);
            self.emit(DriverEvent::Aborted { reason });
        } else {
            if self.state == ScenarioState::Running {
                self.transition(ScenarioState::Draining);
            }
            self.transition(ScenarioState::Done);
        }

        let ended_ms = ctx.clock.now_ms();
        info!(
            state = self.state.as_str(),
            samples = self.samples.len(),
            duration_ms = ended_ms - started_ms,
            "Scenario finished"
        );

        ScenarioOutcome {
            state: self.state,
            samples: self.samples,
            started_ms,
            ended_ms,
            abort_reason: self.abort_reason,
            batches: self.batches,
        }
    }

    /// Single-stream (`batch_size = None`) and offline batch scenarios.
    async fn run_fixed(
        &mut self,
        requester: &Requester,
        samples: u32,
        batch_size: Option<u32>,
        ctx: &mut RunContext,
        stop: &CancellationToken,
    ) {
        let group = batch_size.unwrap_or(1).max(1);
        let mut submitted = 0u32;
        let mut index = 0u32;

        while submitted < samples && !stop.is_cancelled() {
            let size = group.min(samples - submitted);
            let lane = match batch_size {
                Some(_) => Lane::Batch(index),
                None => Lane::Sequential,
            };
            if batch_size.is_some() {
                debug!(batch = index, size, "Dispatching batch");
                self.emit(DriverEvent::BatchStarted { index, size });
                self.batches += 1;
            }

            let mut set = JoinSet::new();
            let mut pending = HashMap::new();
            for _ in 0..size {
                let req = requester.next(lane);
                pending.insert(req.request_id, req.clone());
                let requester = requester.clone();
                set.spawn(async move { requester.send(req).await });
            }
            submitted += size;
            index += 1;

            let drain_deadline = if submitted >= samples {
                self.transition(ScenarioState::Draining);
                Some(Instant::now() + ctx.limits.drain_timeout)
            } else {
                None
            };

            self.collect(&mut set, &mut pending, drain_deadline, ctx, stop)
                .await;
        }
    }

    /// Waits for every task in `set`, bounded by `deadline` and by the abort grace once stopped.
    async fn collect(
        &mut self,
        set: &mut JoinSet<MetricSample>,
        pending: &mut HashMap<u64, Pending>,
        deadline: Option<Instant>,
        ctx: &mut RunContext,
        stop: &CancellationToken,
    ) {
        let mut grace: Option<Instant> = None;
        loop {
            let cutoff = earliest(deadline, grace);
            tokio::select! {
                biased;
                _ = stop.cancelled(), if grace.is_none() => {
                    grace = Some(Instant::now() + ctx.limits.abort_grace);
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(sample)) => {
                        pending.remove(&sample.request_id);
                        self.record(sample, ctx, stop);
                    }
                    Some(Err(e)) => warn!(error = %e, "Request task failed"),
                },
                _ = sleep_until_opt(cutoff) => {
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if let Ok(sample) = joined {
                            pending.remove(&sample.request_id);
                            self.push(sample);
                        }
                    }
                    break;
                }
            }
        }
        self.force_timeouts(pending, ctx.clock);
    }

    async fn run_server(
        &mut self,
        requester: &Requester,
        run_time: Duration,
        users: u32,
        rate_per_min: f64,
        ctx: &mut RunContext,
        stop: &CancellationToken,
    ) {
        let deadline = Instant::now() + run_time;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for user in 0..users {
            let arrivals = PoissonArrivals::new(rate_per_min, StdRng::seed_from_u64(ctx.rng.gen()));
            tasks.spawn(virtual_user(
                user,
                arrivals,
                deadline,
                requester.clone(),
                stop.clone(),
                tx.clone(),
            ));
        }
        drop(tx);
        info!(users, rate_per_min, run_time_secs = run_time.as_secs(), "Virtual users started");

        let mut pending = HashMap::new();
        let mut drain: Option<Instant> = None;
        let mut grace: Option<Instant> = None;
        let mut users_done = false;
        loop {
            // idle users may finish early; the window still runs to the deadline
            if users_done && (drain.is_some() || grace.is_some()) {
                break;
            }
            let cutoff = earliest(drain, grace);
            tokio::select! {
                biased;
                _ = stop.cancelled(), if grace.is_none() => {
                    grace = Some(Instant::now() + ctx.limits.abort_grace);
                }
                event = rx.recv(), if !users_done => match event {
                    Some(UserEvent::Submitted(req)) => {
                        pending.insert(req.request_id, req);
                    }
                    Some(UserEvent::Completed(sample)) => {
                        pending.remove(&sample.request_id);
                        self.record(sample, ctx, stop);
                    }
                    None => users_done = true,
                },
                _ = sleep_until(deadline), if drain.is_none() && grace.is_none() => {
                    self.transition(ScenarioState::Draining);
                    drain = Some(Instant::now() + ctx.limits.drain_timeout);
                }
                _ = sleep_until_opt(cutoff) => break,
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        while let Ok(event) = rx.try_recv() {
            match event {
                UserEvent::Submitted(req) => {
                    pending.insert(req.request_id, req);
                }
                UserEvent::Completed(sample) => {
                    pending.remove(&sample.request_id);
                    self.push(sample);
                }
            }
        }
        self.force_timeouts(&mut pending, ctx.clock);
    }

    fn record(&mut self, sample: MetricSample, ctx: &mut RunContext, stop: &CancellationToken) {
        if ctx.failures.record(!sample.is_success()) && self.abort_reason.is_none() {
            let reason = format!(
                "failure rate {:.0}% exceeded threshold over the last {} requests",
                ctx.failures.failure_fraction() * 100.0,
                ctx.failures.len()
            );
            warn!(%reason, "Aborting scenario");
            self.abort_reason = Some(reason);
            stop.cancel();
        }
        self.push(sample);
    }

    fn push(&mut self, sample: MetricSample) {
        debug!(
            request_id = sample.request_id,
            outcome = sample.outcome.as_str(),
            latency_ms = sample.latency_ms(),
            "Request completed"
        );
        if self.events.is_some() {
            self.emit(DriverEvent::Sample {
                sample: sample.clone(),
            });
        }
        self.samples.push(sample);
    }

    fn force_timeouts(&mut self, pending: &mut HashMap<u64, Pending>, clock: RunClock) {
        if pending.is_empty() {
            return;
        }
        warn!(count = pending.len(), "Forcing unresolved requests to timeout");
        let now = clock.now_ms();
        let mut left: Vec<Pending> = pending.drain().map(|(_, p)| p).collect();
        left.sort_by_key(|p| p.request_id);
        for p in left {
            self.push(p.into_timeout(now));
        }
    }

    fn transition(&mut self, next: ScenarioState) {
        if !self.state.can_transition(next) {
            warn!(from = self.state.as_str(), to = next.as_str(), "Ignoring invalid state transition");
            return;
        }
        let from = std::mem::replace(&mut self.state, next);
        info!(from = from.as_str(), to = next.as_str(), "Scenario state changed");
        self.emit(DriverEvent::StateChanged { from, to: next });
    }

    /// Progress is best effort; a slow or closed consumer never stalls the run.
    fn emit(&self, event: DriverEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "Dropped driver event");
            }
        }
    }
}

/// Closed-loop virtual user: at most one request in flight, Poisson-scheduled submissions.
async fn virtual_user(
    user: u32,
    mut arrivals: PoissonArrivals,
    deadline: Instant,
    requester: Requester,
    stop: CancellationToken,
    tx: mpsc::UnboundedSender<UserEvent>,
) {
    let mut next_at = Instant::now() + arrivals.next_gap();
    let mut issued = 0u32;
    loop {
        if next_at >= deadline {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = sleep_until(next_at) => {}
        }
        // a completion past the deadline must not submit again
        if Instant::now() >= deadline {
            break;
        }

        let req = requester.next(Lane::User(user));
        if tx.send(UserEvent::Submitted(req.clone())).is_err() {
            break;
        }
        let sample = requester.send(req).await;
        if tx.send(UserEvent::Completed(sample)).is_err() {
            break;
        }
        issued += 1;
        // schedule from the previous arrival; a late completion submits at once if still in the window
        next_at += arrivals.next_gap();
    }
    debug!(user, issued, "Virtual user finished");
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
