use crate::config::Config;
use crate::generator::SampleSource;
use crate::sensor::{run_sensor_session, SensorSpec};
use crate::stats::PipelineStats;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{Id, JoinHandle, JoinSet};
use tokio::time::sleep;

/// One simulated device: the connector identity plus the sensors it carries.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub device_id: String,
    pub number: u32,
    pub sensor_type: String,
    pub connector_name: String,
    pub sensors: Vec<SensorSpec>,
}

/// Linear connect backoff: retry `n` waits `base * n`, capped, with a bounded
/// attempt budget per connection round.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    budget: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, budget: u32) -> Self {
        Self {
            base,
            cap,
            budget,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.budget {
            return None;
        }
        self.attempt += 1;
        Some(cmp::min(self.base * self.attempt, self.cap))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

pub enum ChannelRequest {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        count: u64,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

/// Handle sensors use to push through their owning connector. Holds the
/// request queue and the connected flag, never the transport itself.
#[derive(Clone)]
pub struct ChannelClient {
    req_tx: mpsc::Sender<ChannelRequest>,
    connected: watch::Receiver<bool>,
    stats: Arc<PipelineStats>,
}

impl ChannelClient {
    pub(crate) fn new(
        req_tx: mpsc::Sender<ChannelRequest>,
        connected: watch::Receiver<bool>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            req_tx,
            connected,
            stats,
        }
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Fire-and-forget measurement push. Dropped outright when the connector
    /// is not draining (disconnected or backlogged).
    pub fn publish(&self, topic: String, payload: Bytes, count: u64) {
        let req = ChannelRequest::Publish {
            topic,
            payload,
            count,
            reply: None,
        };
        if self.req_tx.try_send(req).is_err() {
            self.stats.record_dropped(count);
            tracing::debug!("channel queue unavailable; dropping push");
        }
    }

    pub async fn publish_tracked(&self, topic: String, payload: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = ChannelRequest::Publish {
            topic,
            payload,
            count: 0,
            reply: Some(tx),
        };
        self.req_tx
            .try_send(req)
            .map_err(|_| anyhow!("channel unavailable"))?;
        rx.await.map_err(|_| anyhow!("channel request dropped"))?
    }

    pub async fn subscribe(&self, topic: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = ChannelRequest::Subscribe { topic, reply: tx };
        self.req_tx
            .try_send(req)
            .map_err(|_| anyhow!("channel unavailable"))?;
        rx.await.map_err(|_| anyhow!("channel request dropped"))?
    }
}

/// Owns the persistent broker connection for one device and supervises its
/// sensor sessions. Never gives up: a failed connect round cools down and
/// starts over.
pub async fn run_connector_session<S: SampleSource>(
    spec: DeviceSpec,
    config: Config,
    source: S,
    stats: Arc<PipelineStats>,
    connected_tx: watch::Sender<bool>,
) {
    let (req_tx, mut req_rx) = mpsc::channel::<ChannelRequest>(256);
    let channel = ChannelClient::new(req_tx, connected_tx.subscribe(), stats.clone());

    let mut sensors: JoinSet<()> = JoinSet::new();
    let mut sensor_specs: HashMap<Id, SensorSpec> = HashMap::new();
    let mut sensors_started = false;

    loop {
        let client_id = format!("{}-{}", config.mqtt_client_prefix, spec.device_id);
        let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(15));
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (client, mut eventloop) = AsyncClient::new(options, 256);

        let mut backoff = Backoff::new(
            config.connect_base_delay,
            config.connect_max_delay,
            config.connect_retry_budget,
        );
        let ready = loop {
            match await_connack(&mut eventloop).await {
                Ok(()) => break true,
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            device = %spec.device_id,
                            attempt = backoff.attempt(),
                            error = %err,
                            "broker not ready; retrying"
                        );
                        sleep(delay).await;
                    }
                    None => break false,
                },
            }
        };
        if !ready {
            tracing::warn!(
                device = %spec.device_id,
                cooldown_ms = config.reconnect_cooldown.as_millis() as u64,
                "connect retry budget exhausted; cooling down"
            );
            sleep(config.reconnect_cooldown).await;
            continue;
        }

        // Anything queued while we were away reflects dead state; shed it
        // before letting sensors see the connection.
        drain_stale_requests(&mut req_rx, &stats);
        let _ = connected_tx.send(true);
        stats.record_reconnect();
        tracing::info!(device = %spec.device_id, "channel connected");

        if !sensors_started {
            sensors_started = true;
            for sensor in spec.sensors.clone() {
                spawn_sensor(
                    &mut sensors,
                    &mut sensor_specs,
                    sensor,
                    &spec,
                    &config,
                    &channel,
                    &source,
                    &stats,
                );
            }
        }

        let mut poller = spawn_event_poller(eventloop);
        loop {
            tokio::select! {
                res = &mut poller => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(device = %spec.device_id, error = %err, "channel connection lost");
                        }
                        Err(err) => {
                            tracing::warn!(device = %spec.device_id, error = %err, "channel poller failed");
                        }
                    }
                    break;
                }

                maybe = req_rx.recv() => {
                    let Some(req) = maybe else { return };
                    handle_request(&client, req, &stats).await;
                }

                Some(outcome) = sensors.join_next_with_id(), if !sensors.is_empty() => {
                    let respawn = match outcome {
                        Ok((id, ())) => sensor_specs.remove(&id),
                        Err(err) if err.is_cancelled() => {
                            sensor_specs.remove(&err.id());
                            None
                        }
                        Err(err) => {
                            let id = err.id();
                            tracing::warn!(device = %spec.device_id, error = %err, "sensor session crashed");
                            sensor_specs.remove(&id)
                        }
                    };
                    if let Some(sensor) = respawn {
                        tracing::warn!(
                            device = %spec.device_id,
                            sensor = %sensor.sensor_id,
                            "restarting sensor session"
                        );
                        spawn_sensor(
                            &mut sensors,
                            &mut sensor_specs,
                            sensor,
                            &spec,
                            &config,
                            &channel,
                            &source,
                            &stats,
                        );
                    }
                }
            }
        }

        let _ = connected_tx.send(false);
        poller.abort();
        sleep(Duration::from_secs(1)).await;
    }
}

fn spawn_sensor<S: SampleSource>(
    sensors: &mut JoinSet<()>,
    sensor_specs: &mut HashMap<Id, SensorSpec>,
    sensor: SensorSpec,
    spec: &DeviceSpec,
    config: &Config,
    channel: &ChannelClient,
    source: &S,
    stats: &Arc<PipelineStats>,
) {
    let handle = sensors.spawn(run_sensor_session(
        sensor.clone(),
        spec.device_id.clone(),
        spec.connector_name.clone(),
        config.clone(),
        channel.clone(),
        source.clone(),
        stats.clone(),
    ));
    sensor_specs.insert(handle.id(), sensor);
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(anyhow!("connection rejected: {:?}", ack.code));
            }
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

fn spawn_event_poller(mut eventloop: EventLoop) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    tracing::debug!(topic = %publish.topic, "command received");
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return Err(anyhow!("broker closed the connection"));
                }
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }
    })
}

async fn handle_request(client: &AsyncClient, req: ChannelRequest, stats: &Arc<PipelineStats>) {
    match req {
        ChannelRequest::Publish {
            topic,
            payload,
            count,
            reply,
        } => {
            let res = client.publish(topic, QoS::AtLeastOnce, false, payload).await;
            match &res {
                Ok(()) => {
                    if count > 0 {
                        stats.record_push(count);
                    }
                }
                Err(err) => {
                    stats.record_dropped(count);
                    tracing::debug!(error = %err, "publish failed");
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(res.map_err(Into::into));
            }
        }
        ChannelRequest::Subscribe { topic, reply } => {
            let res = client.subscribe(topic, QoS::AtLeastOnce).await;
            let _ = reply.send(res.map_err(Into::into));
        }
    }
}

fn drain_stale_requests(req_rx: &mut mpsc::Receiver<ChannelRequest>, stats: &Arc<PipelineStats>) {
    while let Ok(req) = req_rx.try_recv() {
        match req {
            ChannelRequest::Publish { count, reply, .. } => {
                stats.record_dropped(count);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(anyhow!("not connected")));
                }
            }
            ChannelRequest::Subscribe { reply, .. } => {
                let _ = reply.send(Err(anyhow!("not connected")));
            }
        }
    }
}
