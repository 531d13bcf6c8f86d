use crate::config::Config;
use crate::connector::ChannelClient;
use crate::generator::{DeviceConfig, SampleSource};
use crate::stats::PipelineStats;
use crate::stream::run_attribute_stream;
use crate::wire::{self, JoinAttribute, JoinPayload, Measurement};
use anyhow::Result;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub key: String,
    pub attribute_type: String,
    pub sampling_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SensorSpec {
    pub sensor_id: String,
    pub sensor_name: String,
    pub sensor_type: String,
    pub sampling_rate: f64,
    pub attributes: Vec<AttributeSpec>,
}

pub fn attribute_id(sensor_id: &str, key: &str) -> String {
    format!("{sensor_id}-{key}")
}

/// Owns one channel subscription and the attribute streams beneath it.
///
/// The subscription cycles `Unsubscribed -> Joining -> Joined`; losing the
/// channel re-enters `Joining` without touching the attribute children, which
/// keep replaying and flushing throughout (their pushes are shed upstream
/// while disconnected).
pub async fn run_sensor_session<S: SampleSource>(
    spec: SensorSpec,
    connector_id: String,
    connector_name: String,
    config: Config,
    channel: ChannelClient,
    source: S,
    stats: Arc<PipelineStats>,
) {
    let (flush_tx, mut flush_rx) = mpsc::channel::<Vec<Measurement>>(64);
    let mut children: JoinSet<()> = JoinSet::new();
    let mut child_configs: HashMap<Id, DeviceConfig> = HashMap::new();

    for attr in &spec.attributes {
        let device = attribute_config(&spec, attr, &connector_id, &config);
        spawn_stream(
            &mut children,
            &mut child_configs,
            device,
            &source,
            &flush_tx,
            &config,
            &stats,
        );
    }

    let mut connected = channel.connected();
    let mut joined = false;
    let join_sleep = sleep(Duration::ZERO);
    tokio::pin!(join_sleep);
    let mut join_armed = *connected.borrow();

    loop {
        tokio::select! {
            maybe = flush_rx.recv() => {
                let Some(batch) = maybe else { break };
                forward_flush(&channel, &config.mqtt_topic_prefix, &connector_id, &spec.sensor_id, batch);
            }

            _ = &mut join_sleep, if join_armed && !joined => {
                join_armed = false;
                match try_join(&channel, &spec, &connector_id, &connector_name, &config).await {
                    Ok(()) => {
                        joined = true;
                        tracing::info!(sensor = %spec.sensor_id, "sensor subscription joined");
                    }
                    Err(err) => {
                        tracing::warn!(sensor = %spec.sensor_id, error = %err, "sensor join failed; retrying");
                        join_armed = true;
                        join_sleep.as_mut().reset(Instant::now() + config.join_retry_delay);
                    }
                }
            }

            res = connected.changed() => {
                if res.is_err() {
                    break;
                }
                if *connected.borrow() {
                    if !joined {
                        join_armed = true;
                        join_sleep.as_mut().reset(Instant::now());
                    }
                } else {
                    if joined {
                        tracing::warn!(sensor = %spec.sensor_id, "channel lost; rejoining on reconnect");
                    }
                    joined = false;
                    join_armed = false;
                }
            }

            Some(outcome) = children.join_next_with_id(), if !children.is_empty() => {
                let respawn = match outcome {
                    Ok((id, ())) => child_configs.remove(&id),
                    Err(err) if err.is_cancelled() => {
                        child_configs.remove(&err.id());
                        None
                    }
                    Err(err) => {
                        let id = err.id();
                        tracing::warn!(sensor = %spec.sensor_id, error = %err, "attribute stream crashed");
                        child_configs.remove(&id)
                    }
                };
                if let Some(device) = respawn {
                    // Fresh queues, same config: in-flight samples are lost by design.
                    tracing::warn!(
                        sensor = %spec.sensor_id,
                        attribute = %device.attribute_id,
                        "restarting attribute stream"
                    );
                    spawn_stream(
                        &mut children,
                        &mut child_configs,
                        device,
                        &source,
                        &flush_tx,
                        &config,
                        &stats,
                    );
                }
            }
        }
    }
}

fn spawn_stream<S: SampleSource>(
    children: &mut JoinSet<()>,
    child_configs: &mut HashMap<Id, DeviceConfig>,
    device: DeviceConfig,
    source: &S,
    flush_tx: &mpsc::Sender<Vec<Measurement>>,
    config: &Config,
    stats: &Arc<PipelineStats>,
) {
    let handle = children.spawn(run_attribute_stream(
        device.clone(),
        source.clone(),
        flush_tx.clone(),
        config.fetch_retry_delay,
        stats.clone(),
    ));
    child_configs.insert(handle.id(), device);
}

fn attribute_config(
    sensor: &SensorSpec,
    attr: &AttributeSpec,
    connector_id: &str,
    config: &Config,
) -> DeviceConfig {
    DeviceConfig {
        connector_id: connector_id.to_string(),
        sensor_id: sensor.sensor_id.clone(),
        sensor_type: sensor.sensor_type.clone(),
        attribute_id: attribute_id(&sensor.sensor_id, &attr.key),
        attribute_type: attr.attribute_type.clone(),
        sampling_rate: attr.sampling_rate,
        duration: config.generation_duration,
        heart_rate: config.heart_rate,
        respiratory_rate: config.respiratory_rate,
        scr_number: config.scr_number,
        burst_number: config.burst_number,
        batch_size: config.batch_size,
        batch_window: config.batch_window,
    }
}

/// Maps one flushed buffer onto its outbound message: a lone measurement goes
/// out as `measurement`, two or more as `measurements_batch`.
fn flush_request(
    prefix: &str,
    connector_id: &str,
    sensor_id: &str,
    batch: &[Measurement],
) -> Option<(String, Result<Bytes>)> {
    match batch {
        [] => None,
        [single] => Some((
            wire::measurement_topic(prefix, connector_id, sensor_id),
            wire::encode_measurement(single),
        )),
        many => Some((
            wire::measurements_topic(prefix, connector_id, sensor_id),
            wire::encode_batch(many),
        )),
    }
}

fn forward_flush(
    channel: &ChannelClient,
    prefix: &str,
    connector_id: &str,
    sensor_id: &str,
    batch: Vec<Measurement>,
) {
    let Some((topic, payload)) = flush_request(prefix, connector_id, sensor_id, &batch) else {
        return;
    };
    match payload {
        Ok(payload) => channel.publish(topic, payload, batch.len() as u64),
        Err(err) => {
            tracing::warn!(sensor = %sensor_id, error = %err, "failed to encode flush");
        }
    }
}

async fn try_join(
    channel: &ChannelClient,
    spec: &SensorSpec,
    connector_id: &str,
    connector_name: &str,
    config: &Config,
) -> Result<()> {
    let prefix = &config.mqtt_topic_prefix;
    channel
        .subscribe(wire::command_topic(prefix, connector_id, &spec.sensor_id))
        .await?;
    let join = build_join(spec, connector_id, connector_name, &config.bearer_token);
    channel
        .publish_tracked(
            wire::join_topic(prefix, connector_id, &spec.sensor_id),
            wire::encode_join(&join)?,
        )
        .await
}

fn build_join(
    spec: &SensorSpec,
    connector_id: &str,
    connector_name: &str,
    bearer_token: &str,
) -> JoinPayload {
    let mut attributes = BTreeMap::new();
    for attr in &spec.attributes {
        let id = attribute_id(&spec.sensor_id, &attr.key);
        attributes.insert(
            id.clone(),
            JoinAttribute {
                attribute_id: id,
                sampling_rate: attr.sampling_rate,
                attribute_type: attr.attribute_type.clone(),
            },
        );
    }
    JoinPayload {
        connector_id: connector_id.to_string(),
        connector_name: connector_name.to_string(),
        sensor_id: spec.sensor_id.clone(),
        sensor_name: spec.sensor_name.clone(),
        attributes,
        sampling_rate: spec.sampling_rate,
        bearer_token: bearer_token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ChannelRequest;
    use crate::generator::testing::ScriptedSource;
    use crate::generator::Sample;
    use tokio::sync::watch;
    use tokio::time::timeout;

    fn test_spec() -> SensorSpec {
        SensorSpec {
            sensor_id: "heartrate-1-hr".to_string(),
            sensor_name: "Heart Rate Monitor".to_string(),
            sensor_type: "heartrate".to_string(),
            sampling_rate: 1.0,
            attributes: vec![AttributeSpec {
                key: "heartrate".to_string(),
                attribute_type: "heartrate".to_string(),
                sampling_rate: 1.0,
            }],
        }
    }

    fn measurement(payload: f64) -> Measurement {
        Measurement {
            attribute_id: "a".to_string(),
            timestamp: 1,
            payload,
        }
    }

    #[test]
    fn single_item_flush_becomes_measurement_message() {
        let batch = vec![measurement(1.0)];
        let (topic, payload) = flush_request("sensors", "d", "s", &batch).unwrap();
        assert_eq!(topic, "sensors/d/s/measurement");
        let value: serde_json::Value = serde_json::from_slice(&payload.unwrap()).unwrap();
        assert!(value.is_object());
    }

    #[test]
    fn multi_item_flush_becomes_batch_message() {
        let batch = vec![measurement(1.0), measurement(2.0)];
        let (topic, payload) = flush_request("sensors", "d", "s", &batch).unwrap();
        assert_eq!(topic, "sensors/d/s/measurements");
        let value: serde_json::Value = serde_json::from_slice(&payload.unwrap()).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_flush_is_a_noop() {
        assert!(flush_request("sensors", "d", "s", &[]).is_none());
    }

    #[test]
    fn join_payload_carries_all_attributes() {
        let spec = test_spec();
        let join = build_join(&spec, "heartrate-1", "Simulated device heartrate-1", "tok");
        assert_eq!(join.connector_id, "heartrate-1");
        assert_eq!(join.attributes.len(), 1);
        assert!(join.attributes.contains_key("heartrate-1-hr-heartrate"));
        assert_eq!(join.bearer_token, "tok");
    }

    #[tokio::test]
    async fn session_joins_then_forwards_measurements() {
        let stats = Arc::new(PipelineStats::new());
        let (req_tx, mut req_rx) = mpsc::channel::<ChannelRequest>(64);
        let (_connected_tx, connected_rx) = watch::channel(true);
        let channel = ChannelClient::new(req_tx, connected_rx, stats.clone());

        let mut config = crate::config::test_config();
        config.batch_size = 1;
        config.batch_window = Duration::from_millis(50);

        let source = ScriptedSource::new(vec![Ok(vec![Sample {
            timestamp: 1000,
            delay: 0.0,
            payload: 64.0,
        }])]);

        tokio::spawn(run_sensor_session(
            test_spec(),
            "heartrate-1".to_string(),
            "Simulated device heartrate-1".to_string(),
            config,
            channel,
            source,
            stats,
        ));

        let mut subscribed = None;
        let mut join_topic = None;
        let mut push_topic = None;
        timeout(Duration::from_secs(5), async {
            while subscribed.is_none() || join_topic.is_none() || push_topic.is_none() {
                match req_rx.recv().await.expect("session hung up") {
                    ChannelRequest::Subscribe { topic, reply } => {
                        subscribed = Some(topic);
                        let _ = reply.send(Ok(()));
                    }
                    ChannelRequest::Publish { topic, reply, count, .. } => {
                        if topic.ends_with("/join") {
                            join_topic = Some(topic);
                        } else {
                            assert_eq!(count, 1);
                            push_topic = Some(topic);
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
            }
        })
        .await
        .expect("join/push flow timed out");

        assert_eq!(
            subscribed.unwrap(),
            "sensors/heartrate-1/heartrate-1-hr/cmd"
        );
        assert_eq!(
            join_topic.unwrap(),
            "sensors/heartrate-1/heartrate-1-hr/join"
        );
        assert_eq!(
            push_topic.unwrap(),
            "sensors/heartrate-1/heartrate-1-hr/measurement"
        );
    }
}
