use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::errors::SubmitError;
use crate::pool::PoolController;
use crate::recipe::{validator, Recipe};
use crate::types::{ExecutionOutcome, Tag, Value};

/// Pause before resubmitting a request rejected for backpressure
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

pub struct BenchmarkParams {
    /// Total requests to push through the pool
    pub requests: usize,
    /// Concurrent submitters
    pub concurrency: usize,
    pub recipe: String,
    pub input: String,
    pub input_type: Tag,
    /// Give up after this long (e.g. "60s", "5m")
    pub duration: Option<String>,
    /// Target submission rate across all submitters (requests/sec)
    pub rate: Option<f64>,
    /// Exclude the first N% of requests from latency metrics
    pub warmup_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkMetrics {
    pub elapsed: Duration,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Requests still unresolved when the deadline passed
    pub timed_out: usize,
    pub backpressure_retries: u64,
    /// Submit-to-result latencies in milliseconds, sorted, warmup excluded
    pub latencies_ms: Vec<f64>,
    pub peak_busy: usize,
    pub pool_size: usize,
}

impl BenchmarkMetrics {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.succeeded + self.failed) as f64 / secs
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.latencies_ms, p)
    }
}

struct Sample {
    index: usize,
    latency: Duration,
    outcome: Option<ExecutionOutcome>,
}

/// Push `params.requests` copies of one recipe through `pool` and measure it
pub async fn run_benchmark(pool: &PoolController, params: &BenchmarkParams) -> Result<BenchmarkMetrics> {
    validate_params(params)?;

    let recipe = Recipe::from_text(&params.recipe).context("Invalid benchmark recipe")?;
    let input = Value::parse_as(params.input_type, &params.input).map_err(|e| anyhow!(e))?;
    validator::validate_for_input(&recipe, &pool.registry(), input.tag())
        .context("Benchmark recipe does not type-check")?;

    let timeout = match &params.duration {
        Some(duration) => parse_duration(duration)?,
        None => Duration::from_secs(300),
    };
    let deadline = tokio::time::Instant::now() + timeout;

    // Each submitter paces itself so the aggregate matches `rate`
    let pace = params
        .rate
        .map(|rate| Duration::from_secs_f64(params.concurrency as f64 / rate));

    let next = Arc::new(AtomicUsize::new(0));
    let retries = Arc::new(AtomicU64::new(0));
    let recipe = Arc::new(recipe);
    let started = Instant::now();

    let mut submitters = JoinSet::new();
    for _ in 0..params.concurrency {
        let pool = pool.clone();
        let recipe = recipe.clone();
        let input = input.clone();
        let next = next.clone();
        let retries = retries.clone();
        let total = params.requests;

        submitters.spawn(async move {
            let mut samples = Vec::new();
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= total {
                    break;
                }

                let submitted_at = Instant::now();
                let id = loop {
                    match pool.submit(&recipe, input.clone()) {
                        Ok(id) => break Some(id),
                        Err(SubmitError::Backpressure { .. }) => {
                            retries.fetch_add(1, Ordering::Relaxed);
                            if tokio::time::Instant::now() >= deadline {
                                break None;
                            }
                            sleep(RETRY_BACKOFF).await;
                        }
                        Err(e) => return Err(anyhow::Error::from(e)),
                    }
                };

                let outcome = match id {
                    Some(id) => {
                        let outcome = tokio::time::timeout_at(deadline, pool.wait(&id))
                            .await
                            .ok()
                            .flatten();
                        if outcome.is_some() {
                            pool.take_result(&id);
                        } else {
                            pool.cancel(&id);
                        }
                        outcome
                    }
                    None => None,
                };

                samples.push(Sample {
                    index,
                    latency: submitted_at.elapsed(),
                    outcome,
                });

                if let Some(pace) = pace {
                    sleep(pace).await;
                }
            }
            Ok(samples)
        });
    }

    println!("⏳ Waiting for requests to complete...");
    let mut samples = Vec::with_capacity(params.requests);
    while let Some(joined) = submitters.join_next().await {
        samples.extend(joined.context("Benchmark submitter panicked")??);
    }
    let elapsed = started.elapsed();

    let stats = pool.stats();
    Ok(summarize(
        samples,
        params,
        elapsed,
        retries.load(Ordering::Relaxed),
        stats.peak_busy,
        stats.pool_size,
    ))
}

fn summarize(
    samples: Vec<Sample>,
    params: &BenchmarkParams,
    elapsed: Duration,
    backpressure_retries: u64,
    peak_busy: usize,
    pool_size: usize,
) -> BenchmarkMetrics {
    let warmup = (params.requests as f64 * params.warmup_percent / 100.0).floor() as usize;

    let mut metrics = BenchmarkMetrics {
        elapsed,
        submitted: samples.len(),
        succeeded: 0,
        failed: 0,
        cancelled: 0,
        timed_out: 0,
        backpressure_retries,
        latencies_ms: Vec::new(),
        peak_busy,
        pool_size,
    };

    for sample in samples {
        match sample.outcome {
            Some(ExecutionOutcome::Success(_)) => metrics.succeeded += 1,
            Some(ExecutionOutcome::Failure(_)) => metrics.failed += 1,
            Some(ExecutionOutcome::Cancelled) => metrics.cancelled += 1,
            None => {
                metrics.timed_out += 1;
                continue;
            }
        }
        if sample.index >= warmup {
            metrics.latencies_ms.push(sample.latency.as_secs_f64() * 1000.0);
        }
    }

    metrics.latencies_ms.sort_by(f64::total_cmp);
    metrics
}

fn validate_params(params: &BenchmarkParams) -> Result<()> {
    if params.requests == 0 {
        return Err(anyhow!("Must specify at least 1 request"));
    }

    if params.concurrency == 0 {
        return Err(anyhow!("Must have at least 1 submitter"));
    }

    if let Some(rate) = params.rate {
        if rate.is_nan() || rate <= 0.0 {
            return Err(anyhow!("Rate must be positive (got {})", rate));
        }
    }

    if !(0.0..100.0).contains(&params.warmup_percent) {
        return Err(anyhow!(
            "Warmup percentage must be in [0, 100) (got {})",
            params.warmup_percent
        ));
    }

    Ok(())
}

fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim();

    if let Some(ms) = duration_str.strip_suffix("ms") {
        Ok(Duration::from_millis(ms.parse()?))
    } else if let Some(secs) = duration_str.strip_suffix('s') {
        Ok(Duration::from_secs(secs.parse()?))
    } else if let Some(mins) = duration_str.strip_suffix('m') {
        let mins: u64 = mins.parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        Err(anyhow!("Invalid duration format. Use '500ms', '60s', '5m', etc."))
    }
}

/// Nearest-rank percentile of an ascending slice
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted.get(rank.min(sorted.len() - 1)).copied()
}

pub fn display_report(params: &BenchmarkParams, metrics: &BenchmarkMetrics) {
    println!("\n");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📊 Benchmark Results");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("📋 Configuration:");
    println!("   Recipe: {}", params.recipe);
    println!("   Submitters: {}", params.concurrency);
    println!("   Pool Size: {}", metrics.pool_size);
    if let Some(rate) = params.rate {
        println!("   Submit Rate: {}/sec", rate);
    }
    println!();
    println!("⏱️  Duration: {:.2}s", metrics.elapsed.as_secs_f64());
    println!();
    println!("📋 Requests:");
    println!("   Submitted: {}", metrics.submitted);
    println!("   Succeeded: {}", metrics.succeeded);
    println!("   Failed: {}", metrics.failed);
    println!("   Cancelled: {}", metrics.cancelled);
    if metrics.timed_out > 0 {
        println!("   ⚠️  Timed out: {}", metrics.timed_out);
    }
    println!("   Backpressure retries: {}", metrics.backpressure_retries);
    println!("   Peak busy workers: {}", metrics.peak_busy);
    println!();
    println!("🚀 Throughput: {:.1} requests/sec", metrics.throughput());
    println!();
    match (metrics.percentile(50.0), metrics.percentile(99.0)) {
        (Some(p50), Some(p99)) => println!("📈 Latency: p50 {:.2}ms, p99 {:.2}ms", p50, p99),
        _ => println!("📈 Latency: no samples"),
    }
    println!();
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
