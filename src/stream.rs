use crate::generator::{DeviceConfig, FetchResult, Sample, SampleSource};
use crate::stats::PipelineStats;
use crate::wire::Measurement;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

/// Replays generated samples for one (device, sensor, attribute) triple and
/// re-batches them for push.
///
/// The whole state machine lives on one task: the replay queue is consumed
/// only here, the batch buffer is flushed only here, so the size and window
/// triggers can never race each other.
pub async fn run_attribute_stream<S: SampleSource>(
    device: DeviceConfig,
    source: S,
    out: mpsc::Sender<Vec<Measurement>>,
    fetch_retry_delay: Duration,
    stats: Arc<PipelineStats>,
) {
    let low_water = device.low_water_mark();
    let mut queue: VecDeque<Sample> = VecDeque::new();
    let mut buffer: Vec<Measurement> = Vec::with_capacity(device.batch_size);

    let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchResult>(2);
    let mut fetch_in_flight = false;

    let mut window = interval(device.batch_window);
    window.set_missed_tick_behavior(MissedTickBehavior::Delay);
    window.tick().await;

    let replay_sleep = sleep(Duration::ZERO);
    tokio::pin!(replay_sleep);
    let fetch_sleep = sleep(Duration::ZERO);
    tokio::pin!(fetch_sleep);
    let mut fetch_armed = true;

    loop {
        tokio::select! {
            _ = &mut fetch_sleep, if fetch_armed && !fetch_in_flight => {
                fetch_armed = false;
                fetch_in_flight = true;
                source.request(device.clone(), fetch_tx.clone());
            }

            maybe = fetch_rx.recv() => {
                let Some(outcome) = maybe else { break };
                fetch_in_flight = false;
                match outcome {
                    Ok(samples) if !samples.is_empty() => {
                        let was_empty = queue.is_empty();
                        queue.extend(samples);
                        if was_empty {
                            replay_sleep.as_mut().reset(Instant::now());
                        }
                    }
                    Ok(_) => {
                        // No data yet; throttle the next attempt.
                        fetch_armed = true;
                        fetch_sleep.as_mut().reset(Instant::now() + fetch_retry_delay);
                    }
                    Err(err) => {
                        stats.record_fetch_failure();
                        tracing::debug!(
                            attribute = %device.attribute_id,
                            error = %err,
                            "sample fetch failed; retrying"
                        );
                        fetch_armed = true;
                        fetch_sleep.as_mut().reset(Instant::now() + fetch_retry_delay);
                    }
                }
            }

            _ = &mut replay_sleep, if !queue.is_empty() => {
                let Some(sample) = queue.pop_front() else { continue };
                buffer.push(Measurement {
                    attribute_id: device.attribute_id.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                    payload: sample.payload,
                });
                if buffer.len() >= device.batch_size && flush(&out, &mut buffer).await.is_err() {
                    break;
                }

                // Negative or non-finite spacing means we are behind: fire the
                // next step without waiting.
                let delay = if sample.delay.is_finite() && sample.delay > 0.0 {
                    Duration::from_secs_f64(sample.delay)
                } else {
                    Duration::ZERO
                };
                replay_sleep.as_mut().reset(Instant::now() + delay);

                if queue.len() < low_water && !fetch_in_flight && !fetch_armed {
                    fetch_armed = true;
                    fetch_sleep.as_mut().reset(Instant::now());
                }
            }

            _ = window.tick() => {
                if !buffer.is_empty() && flush(&out, &mut buffer).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn flush(
    out: &mpsc::Sender<Vec<Measurement>>,
    buffer: &mut Vec<Measurement>,
) -> Result<(), mpsc::error::SendError<Vec<Measurement>>> {
    let batch = std::mem::take(buffer);
    out.send(batch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::testing::{test_device, ScriptedSource};
    use crate::generator::Sample;

    fn samples(payloads: &[f64], delay: f64) -> Vec<Sample> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| Sample {
                timestamp: 1000 + i as i64 * 100,
                delay,
                payload: *payload,
            })
            .collect()
    }

    fn spawn_stream(
        device: DeviceConfig,
        source: ScriptedSource,
    ) -> mpsc::Receiver<Vec<Measurement>> {
        let (out_tx, out_rx) = mpsc::channel(32);
        tokio::spawn(run_attribute_stream(
            device,
            source,
            out_tx,
            Duration::from_secs(1),
            Arc::new(PipelineStats::new()),
        ));
        out_rx
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_before_window() {
        let mut device = test_device("hr", 1.0, 60);
        device.batch_size = 2;
        device.batch_window = Duration::from_secs(600);
        let source = ScriptedSource::new(vec![Ok(samples(&[1.0, 2.0, 3.0], 0.01))]);
        let mut out_rx = spawn_stream(device, source);

        let first = out_rx.recv().await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.payload).collect::<Vec<_>>(),
            vec![1.0, 2.0]
        );

        // The odd sample out only leaves on the window trigger.
        let second = out_rx.recv().await.unwrap();
        assert_eq!(
            second.iter().map(|m| m.payload).collect::<Vec<_>>(),
            vec![3.0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_trigger_flushes_sparse_arrivals() {
        let mut device = test_device("hr", 1.0, 60);
        device.batch_size = 100;
        device.batch_window = Duration::from_secs(2);
        let source = ScriptedSource::new(vec![Ok(samples(&[1.0, 2.0, 3.0], 0.1))]);
        let mut out_rx = spawn_stream(device, source);

        let first = out_rx.recv().await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.payload).collect::<Vec<_>>(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replay_honors_sample_spacing() {
        let mut device = test_device("hr", 1.0, 60);
        device.batch_size = 1;
        device.batch_window = Duration::from_secs(600);
        let source = ScriptedSource::new(vec![Ok(samples(&[1.0, 2.0], 5.0))]);
        let mut out_rx = spawn_stream(device, source);

        let _ = out_rx.recv().await.unwrap();
        let first_at = Instant::now();
        let _ = out_rx.recv().await.unwrap();
        assert!(Instant::now() - first_at >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_emits_overdue_samples_immediately() {
        let mut device = test_device("hr", 1.0, 60);
        device.batch_size = 4;
        device.batch_window = Duration::from_secs(600);
        let source = ScriptedSource::new(vec![Ok(samples(&[1.0, 2.0, 3.0, 4.0], 0.0))]);
        let mut out_rx = spawn_stream(device, source);

        let started = Instant::now();
        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert!(Instant::now() - started < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn low_water_refill_preserves_order_without_gaps() {
        // One cycle is 10 samples, so the refill threshold is 2.
        let mut device = test_device("hr", 1.0, 10);
        device.batch_size = 100;
        device.batch_window = Duration::from_secs(1);
        let source = ScriptedSource::new(vec![
            Ok(samples(&[1.0, 2.0, 3.0, 4.0], 0.1)),
            Ok(samples(&[5.0, 6.0, 7.0], 0.1)),
        ]);
        let mut out_rx = spawn_stream(device, source.clone());

        let mut seen = Vec::new();
        while seen.len() < 7 {
            let batch = out_rx.recv().await.unwrap();
            seen.extend(batch.into_iter().map(|m| m.payload));
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        // The second fetch was issued by the low-water check, not by running dry.
        assert!(source.request_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_retries_after_delay() {
        let mut device = test_device("hr", 1.0, 60);
        device.batch_size = 1;
        device.batch_window = Duration::from_secs(600);
        let source = ScriptedSource::new(vec![
            Err(anyhow::anyhow!("generator exploded")),
            Ok(samples(&[9.0], 0.0)),
        ]);
        let mut out_rx = spawn_stream(device, source.clone());

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch[0].payload, 9.0);
        assert!(source.request_count() >= 2);
    }
}
