use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::Config;

/// One generated sample: `delay` is the spacing to the next sample in
/// seconds, not wall-clock arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub delay: f64,
    pub payload: f64,
}

/// Immutable configuration for one simulated sensor attribute. Created when
/// the device starts; replaced only by restarting the owning actor.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub connector_id: String,
    pub sensor_id: String,
    pub sensor_type: String,
    pub attribute_id: String,
    pub attribute_type: String,
    pub sampling_rate: f64,
    pub duration: u32,
    pub heart_rate: f64,
    pub respiratory_rate: f64,
    pub scr_number: u32,
    pub burst_number: u32,
    pub batch_size: usize,
    pub batch_window: Duration,
}

impl DeviceConfig {
    /// Queue length below which a refill fetch is issued while replay keeps
    /// draining the remainder (20% of one generation cycle).
    pub fn low_water_mark(&self) -> usize {
        ((self.sampling_rate * self.duration as f64) * 0.20).ceil() as usize
    }

    pub fn generator_args(&self) -> Vec<String> {
        vec![
            "--sensor-id".to_string(),
            self.sensor_id.clone(),
            "--sensor-type".to_string(),
            self.sensor_type.clone(),
            "--duration".to_string(),
            self.duration.to_string(),
            "--sampling-rate".to_string(),
            self.sampling_rate.to_string(),
            "--heart-rate".to_string(),
            self.heart_rate.to_string(),
            "--respiratory-rate".to_string(),
            self.respiratory_rate.to_string(),
            "--scr-number".to_string(),
            self.scr_number.to_string(),
            "--burst-number".to_string(),
            self.burst_number.to_string(),
        ]
    }
}

pub type FetchResult = Result<Vec<Sample>>;

/// Asynchronous sample supply: the result arrives on `reply` as a later
/// message, so the requester keeps running while generation is in flight.
pub trait SampleSource: Clone + Send + Sync + 'static {
    fn request(&self, device: DeviceConfig, reply: mpsc::Sender<FetchResult>);
}

struct FetchJob {
    device: DeviceConfig,
    reply: mpsc::Sender<FetchResult>,
}

/// Fixed-size pool of stateless workers, each running one generator process
/// at a time. Requests are spread uniformly at random across members; the
/// pool never retries — callers reschedule failed fetches themselves.
#[derive(Clone)]
pub struct FetchPool {
    workers: Arc<Vec<mpsc::Sender<FetchJob>>>,
}

impl FetchPool {
    pub fn spawn(config: &Config) -> Self {
        let mut workers = Vec::with_capacity(config.fetch_pool_size);
        for worker in 0..config.fetch_pool_size {
            let (tx, rx) = mpsc::channel::<FetchJob>(8);
            tokio::spawn(run_fetch_worker(
                worker,
                config.generator_cmd.clone(),
                config.fetch_timeout,
                rx,
            ));
            workers.push(tx);
        }
        Self {
            workers: Arc::new(workers),
        }
    }

    pub async fn fetch(&self, device: DeviceConfig) -> FetchResult {
        let (tx, mut rx) = mpsc::channel(1);
        self.request(device, tx);
        rx.recv()
            .await
            .unwrap_or_else(|| Err(anyhow!("fetch pool unavailable")))
    }
}

impl SampleSource for FetchPool {
    fn request(&self, device: DeviceConfig, reply: mpsc::Sender<FetchResult>) {
        let index = rand::thread_rng().gen_range(0..self.workers.len());
        let job = FetchJob { device, reply };
        if let Err(err) = self.workers[index].try_send(job) {
            let job = match err {
                mpsc::error::TrySendError::Full(job) => job,
                mpsc::error::TrySendError::Closed(job) => job,
            };
            let _ = job
                .reply
                .try_send(Err(anyhow!("fetch worker {index} unavailable")));
        }
    }
}

async fn run_fetch_worker(
    worker: usize,
    generator_cmd: PathBuf,
    timeout: Duration,
    mut rx: mpsc::Receiver<FetchJob>,
) {
    while let Some(job) = rx.recv().await {
        let outcome = run_generator(&generator_cmd, &job.device, timeout).await;
        if let Err(err) = &outcome {
            tracing::debug!(worker, attribute = %job.device.attribute_id, error = %err, "generation failed");
        }
        if job.reply.try_send(outcome).is_err() {
            tracing::trace!(worker, "fetch requester gone; dropping result");
        }
    }
}

/// Runs one generator process to completion and parses its output. The call
/// is bounded by `timeout`; an overdue child is killed and reported as a
/// plain fetch error.
async fn run_generator(
    generator_cmd: &Path,
    device: &DeviceConfig,
    timeout: Duration,
) -> Result<Vec<Sample>> {
    let mut command = Command::new(generator_cmd);
    command
        .args(device.generator_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow!("generator timed out after {}ms", timeout.as_millis()))?
        .with_context(|| format!("spawn {}", generator_cmd.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("generator exited with {}: {}", output.status, stderr.trim());
    }

    parse_samples(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `timestamp,delay,payload` rows, one sample per line, in emission
/// order. Any malformed row fails the whole fetch.
pub fn parse_samples(raw: &str) -> Result<Vec<Sample>> {
    let mut out = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split(',');
        let timestamp = parts
            .next()
            .ok_or_else(|| anyhow!("row {}: missing timestamp", index + 1))?
            .trim()
            .parse::<i64>()
            .with_context(|| format!("row {}: invalid timestamp", index + 1))?;
        let delay = parts
            .next()
            .ok_or_else(|| anyhow!("row {}: missing delay", index + 1))?
            .trim()
            .parse::<f64>()
            .with_context(|| format!("row {}: invalid delay", index + 1))?;
        let payload = parts
            .next()
            .ok_or_else(|| anyhow!("row {}: missing payload", index + 1))?
            .trim()
            .parse::<f64>()
            .with_context(|| format!("row {}: invalid payload", index + 1))?;
        if parts.next().is_some() {
            bail!("row {}: trailing fields", index + 1);
        }
        out.push(Sample {
            timestamp,
            delay,
            payload,
        });
    }
    Ok(out)
}
