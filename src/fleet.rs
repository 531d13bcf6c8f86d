use crate::config::Config;
use crate::connector::{run_connector_session, DeviceSpec};
use crate::generator::SampleSource;
use crate::sensor::{AttributeSpec, SensorSpec};
use crate::stats::PipelineStats;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio::time::sleep;

struct SensorProfile {
    suffix: &'static str,
    sensor_name: &'static str,
    sampling_rate: f64,
    attributes: &'static [(&'static str, &'static str, f64)],
}

static HEARTRATE: SensorProfile = SensorProfile {
    suffix: "hr",
    sensor_name: "Heart Rate Monitor",
    sampling_rate: 1.0,
    attributes: &[("heartrate", "heartrate", 1.0)],
};

static ECG: SensorProfile = SensorProfile {
    suffix: "ecg",
    sensor_name: "ECG",
    sampling_rate: 130.0,
    attributes: &[("ecg", "ecg", 130.0)],
};

static EDA: SensorProfile = SensorProfile {
    suffix: "eda",
    sensor_name: "EDA",
    sampling_rate: 8.0,
    attributes: &[("eda", "eda", 8.0), ("scr", "scr_events", 8.0)],
};

fn sensor_profile(sensor_type: &str) -> Option<&'static SensorProfile> {
    match sensor_type {
        "heartrate" => Some(&HEARTRATE),
        "ecg" => Some(&ECG),
        "eda" => Some(&EDA),
        _ => None,
    }
}

/// Builds the full spec for one numbered device of a sensor type.
pub fn device_spec(sensor_type: &str, number: u32) -> Result<DeviceSpec> {
    let profile = sensor_profile(sensor_type)
        .ok_or_else(|| anyhow!("unknown sensor type: {sensor_type}"))?;
    let device_id = format!("{sensor_type}-{number}");
    let sensor_id = format!("{device_id}-{}", profile.suffix);
    let attributes = profile
        .attributes
        .iter()
        .map(|(key, attribute_type, sampling_rate)| AttributeSpec {
            key: key.to_string(),
            attribute_type: attribute_type.to_string(),
            sampling_rate: *sampling_rate,
        })
        .collect();
    Ok(DeviceSpec {
        connector_name: format!("Simulated device {device_id}"),
        device_id,
        number,
        sensor_type: sensor_type.to_string(),
        sensors: vec![SensorSpec {
            sensor_id,
            sensor_name: profile.sensor_name.to_string(),
            sensor_type: sensor_type.to_string(),
            sampling_rate: profile.sampling_rate,
            attributes,
        }],
    })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResizePlan {
    pub stops: Vec<u32>,
    pub starts: Vec<u32>,
}

/// Deterministic resize selection: stops come off the tail of the sorted
/// running set (lowest numbers survive), starts continue past the highest
/// existing number so ids are never reused.
pub(crate) fn plan_resize(mut running: Vec<u32>, target: usize) -> ResizePlan {
    running.sort_unstable();
    if running.len() > target {
        let stops = running.split_off(target).into_iter().rev().collect();
        ResizePlan {
            stops,
            starts: Vec::new(),
        }
    } else {
        let base = running.last().copied().unwrap_or(0);
        let missing = (target - running.len()) as u32;
        ResizePlan {
            stops: Vec::new(),
            starts: (1..=missing).map(|i| base + i).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnsureRequest {
    pub sensor_type: String,
    pub target: usize,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub number: u32,
    pub sensor_type: String,
    pub connected: bool,
}

pub struct LaunchedDevice {
    pub abort: AbortHandle,
    pub connected: watch::Receiver<bool>,
}

/// Starts one device task into the controller's task set. Implemented by the
/// transport-backed launcher in production and by stubs in tests.
pub trait DeviceLauncher: Send + 'static {
    fn launch(&self, spec: &DeviceSpec, devices: &mut JoinSet<()>) -> Result<LaunchedDevice>;
}

pub struct MqttLauncher<S: SampleSource> {
    pub config: Config,
    pub source: S,
    pub stats: Arc<PipelineStats>,
}

impl<S: SampleSource> DeviceLauncher for MqttLauncher<S> {
    fn launch(&self, spec: &DeviceSpec, devices: &mut JoinSet<()>) -> Result<LaunchedDevice> {
        let (connected_tx, connected_rx) = watch::channel(false);
        let abort = devices.spawn(run_connector_session(
            spec.clone(),
            self.config.clone(),
            self.source.clone(),
            self.stats.clone(),
            connected_tx,
        ));
        Ok(LaunchedDevice {
            abort,
            connected: connected_rx,
        })
    }
}

enum FleetCommand {
    Ensure {
        req: EnsureRequest,
        reply: oneshot::Sender<Result<Vec<DeviceInfo>, String>>,
    },
    List {
        reply: oneshot::Sender<Vec<DeviceInfo>>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct FleetHandle {
    tx: mpsc::Sender<FleetCommand>,
}

impl FleetHandle {
    pub async fn ensure(&self, req: EnsureRequest) -> Result<Vec<DeviceInfo>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FleetCommand::Ensure { req, reply: tx })
            .await
            .map_err(|_| anyhow!("fleet controller stopped"))?;
        rx.await
            .map_err(|_| anyhow!("fleet controller dropped request"))?
            .map_err(|err| anyhow!(err))
    }

    pub async fn list(&self) -> Result<Vec<DeviceInfo>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FleetCommand::List { reply: tx })
            .await
            .map_err(|_| anyhow!("fleet controller stopped"))?;
        rx.await.map_err(|_| anyhow!("fleet controller dropped request"))
    }

    pub async fn stop_all(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FleetCommand::StopAll { reply: tx })
            .await
            .map_err(|_| anyhow!("fleet controller stopped"))?;
        rx.await.map_err(|_| anyhow!("fleet controller dropped request"))
    }
}

struct DeviceEntry {
    number: u32,
    sensor_type: String,
    spec: DeviceSpec,
    task_id: Id,
    abort: AbortHandle,
    connected: watch::Receiver<bool>,
}

pub fn spawn_controller<L: DeviceLauncher + Sync>(launcher: L, settle_delay: Duration) -> FleetHandle {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run_controller(launcher, settle_delay, rx));
    FleetHandle { tx }
}

async fn run_controller<L: DeviceLauncher>(
    launcher: L,
    settle_delay: Duration,
    mut rx: mpsc::Receiver<FleetCommand>,
) {
    let mut devices: JoinSet<()> = JoinSet::new();
    let mut registry: HashMap<String, DeviceEntry> = HashMap::new();

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(cmd) = maybe else { break };
                match cmd {
                    FleetCommand::Ensure { req, reply } => {
                        let result = ensure_running_count(
                            &launcher,
                            &mut devices,
                            &mut registry,
                            &req,
                            settle_delay,
                        )
                        .await;
                        let _ = reply.send(result.map_err(|err| err.to_string()));
                    }
                    FleetCommand::List { reply } => {
                        let mut infos: Vec<DeviceInfo> = registry.values().map(device_info).collect();
                        infos.sort_by(|a, b| {
                            (&a.sensor_type, a.number).cmp(&(&b.sensor_type, b.number))
                        });
                        let _ = reply.send(infos);
                    }
                    FleetCommand::StopAll { reply } => {
                        for (device_id, entry) in registry.drain() {
                            entry.abort.abort();
                            tracing::info!(device = %device_id, "device stopped");
                        }
                        let _ = reply.send(());
                    }
                }
            }

            Some(outcome) = devices.join_next_with_id(), if !devices.is_empty() => {
                handle_device_exit(&launcher, &mut devices, &mut registry, outcome);
            }
        }
    }
}

async fn ensure_running_count<L: DeviceLauncher>(
    launcher: &L,
    devices: &mut JoinSet<()>,
    registry: &mut HashMap<String, DeviceEntry>,
    req: &EnsureRequest,
    settle_delay: Duration,
) -> Result<Vec<DeviceInfo>> {
    sensor_profile(&req.sensor_type)
        .ok_or_else(|| anyhow!("unknown sensor type: {}", req.sensor_type))?;

    let running: Vec<u32> = registry
        .values()
        .filter(|entry| entry.sensor_type == req.sensor_type)
        .map(|entry| entry.number)
        .collect();
    let plan = plan_resize(running, req.target);

    for (index, number) in plan.stops.iter().enumerate() {
        if index > 0 {
            sleep(req.ramp_down).await;
        }
        let device_id = format!("{}-{}", req.sensor_type, number);
        match registry.remove(&device_id) {
            Some(entry) => {
                entry.abort.abort();
                tracing::info!(device = %device_id, "device stopped");
            }
            None => {
                tracing::warn!(device = %device_id, "device missing at stop; skipping");
            }
        }
    }

    for (index, number) in plan.starts.iter().enumerate() {
        if index > 0 {
            sleep(req.ramp_up).await;
        }
        let spec = match device_spec(&req.sensor_type, *number) {
            Ok(spec) => spec,
            Err(err) => {
                tracing::warn!(
                    sensor_type = %req.sensor_type,
                    number,
                    error = %err,
                    "device start failed; skipping"
                );
                continue;
            }
        };
        match launcher.launch(&spec, devices) {
            Ok(launched) => {
                tracing::info!(device = %spec.device_id, "device started");
                registry.insert(
                    spec.device_id.clone(),
                    DeviceEntry {
                        number: *number,
                        sensor_type: req.sensor_type.clone(),
                        spec,
                        task_id: launched.abort.id(),
                        abort: launched.abort,
                        connected: launched.connected,
                    },
                );
            }
            Err(err) => {
                tracing::warn!(
                    sensor_type = %req.sensor_type,
                    number,
                    error = %err,
                    "device start failed; skipping"
                );
            }
        }
    }

    sleep(settle_delay).await;

    let mut infos: Vec<DeviceInfo> = registry
        .values()
        .filter(|entry| entry.sensor_type == req.sensor_type)
        .map(device_info)
        .collect();
    infos.sort_by_key(|info| info.number);
    Ok(infos)
}

fn device_info(entry: &DeviceEntry) -> DeviceInfo {
    DeviceInfo {
        device_id: entry.spec.device_id.clone(),
        number: entry.number,
        sensor_type: entry.sensor_type.clone(),
        connected: *entry.connected.borrow(),
    }
}

fn handle_device_exit<L: DeviceLauncher>(
    launcher: &L,
    devices: &mut JoinSet<()>,
    registry: &mut HashMap<String, DeviceEntry>,
    outcome: Result<(Id, ()), JoinError>,
) {
    let (task_id, crashed) = match outcome {
        Ok((id, ())) => (id, true),
        Err(err) => {
            let cancelled = err.is_cancelled();
            (err.id(), !cancelled)
        }
    };
    let Some(device_id) = registry
        .iter()
        .find_map(|(id, entry)| (entry.task_id == task_id).then(|| id.clone()))
    else {
        return;
    };
    if !crashed {
        registry.remove(&device_id);
        return;
    }
    tracing::warn!(device = %device_id, "device task exited; restarting");
    let Some(entry) = registry.get_mut(&device_id) else {
        return;
    };
    match launcher.launch(&entry.spec, devices) {
        Ok(launched) => {
            entry.task_id = launched.abort.id();
            entry.abort = launched.abort;
            entry.connected = launched.connected;
        }
        Err(err) => {
            tracing::warn!(device = %device_id, error = %err, "device restart failed");
            registry.remove(&device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestLauncher {
        launches: Arc<AtomicUsize>,
    }

    impl DeviceLauncher for TestLauncher {
        fn launch(&self, _spec: &DeviceSpec, devices: &mut JoinSet<()>) -> Result<LaunchedDevice> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = watch::channel(true);
            let abort = devices.spawn(async move {
                let _keep = tx;
                std::future::pending::<()>().await;
            });
            Ok(LaunchedDevice {
                abort,
                connected: rx,
            })
        }
    }

    /// The first launched task exits immediately; later ones stay up.
    #[derive(Clone)]
    struct FlakyLauncher {
        launches: Arc<AtomicUsize>,
    }

    impl DeviceLauncher for FlakyLauncher {
        fn launch(&self, _spec: &DeviceSpec, devices: &mut JoinSet<()>) -> Result<LaunchedDevice> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = watch::channel(true);
            let abort = if launch == 0 {
                devices.spawn(async move {
                    let _keep = tx;
                })
            } else {
                devices.spawn(async move {
                    let _keep = tx;
                    std::future::pending::<()>().await;
                })
            };
            Ok(LaunchedDevice {
                abort,
                connected: rx,
            })
        }
    }

    fn ensure_req(sensor_type: &str, target: usize) -> EnsureRequest {
        EnsureRequest {
            sensor_type: sensor_type.to_string(),
            target,
            ramp_up: Duration::ZERO,
            ramp_down: Duration::ZERO,
        }
    }

    #[test]
    fn plan_grows_past_the_highest_existing_number() {
        assert_eq!(
            plan_resize(vec![], 3),
            ResizePlan {
                stops: vec![],
                starts: vec![1, 2, 3]
            }
        );
        assert_eq!(
            plan_resize(vec![2, 5], 4),
            ResizePlan {
                stops: vec![],
                starts: vec![6, 7]
            }
        );
    }

    #[test]
    fn plan_stops_from_the_tail() {
        assert_eq!(
            plan_resize(vec![3, 1, 5, 2, 4], 3),
            ResizePlan {
                stops: vec![5, 4],
                starts: vec![]
            }
        );
        assert_eq!(
            plan_resize(vec![1, 4, 7], 2),
            ResizePlan {
                stops: vec![7],
                starts: vec![]
            }
        );
    }

    #[test]
    fn plan_at_target_is_a_noop() {
        assert_eq!(
            plan_resize(vec![1, 2, 3], 3),
            ResizePlan {
                stops: vec![],
                starts: vec![]
            }
        );
    }

    #[test]
    fn device_spec_builds_numbered_identities() {
        let spec = device_spec("heartrate", 3).unwrap();
        assert_eq!(spec.device_id, "heartrate-3");
        assert_eq!(spec.sensors.len(), 1);
        assert_eq!(spec.sensors[0].sensor_id, "heartrate-3-hr");

        let eda = device_spec("eda", 1).unwrap();
        assert_eq!(eda.sensors[0].attributes.len(), 2);

        assert!(device_spec("thermal", 1).is_err());
    }

    #[tokio::test]
    async fn fleet_converges_and_is_idempotent() {
        let launches = Arc::new(AtomicUsize::new(0));
        let fleet = spawn_controller(
            TestLauncher {
                launches: launches.clone(),
            },
            Duration::ZERO,
        );

        let up = fleet.ensure(ensure_req("heartrate", 5)).await.unwrap();
        assert_eq!(
            up.iter().map(|d| d.number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(up.iter().all(|d| d.connected));

        let down = fleet.ensure(ensure_req("heartrate", 3)).await.unwrap();
        assert_eq!(
            down.iter().map(|d| d.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let same = fleet.ensure(ensure_req("heartrate", 3)).await.unwrap();
        assert_eq!(same.len(), 3);
        assert_eq!(launches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn fleets_resize_independently_per_type() {
        let launches = Arc::new(AtomicUsize::new(0));
        let fleet = spawn_controller(
            TestLauncher {
                launches: launches.clone(),
            },
            Duration::ZERO,
        );

        fleet.ensure(ensure_req("heartrate", 2)).await.unwrap();
        fleet.ensure(ensure_req("ecg", 3)).await.unwrap();

        let listed = fleet.list().await.unwrap();
        assert_eq!(listed.len(), 5);

        fleet.ensure(ensure_req("heartrate", 0)).await.unwrap();
        let listed = fleet.list().await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|d| d.sensor_type == "ecg"));
    }

    #[tokio::test]
    async fn unknown_sensor_type_is_rejected() {
        let fleet = spawn_controller(
            TestLauncher {
                launches: Arc::new(AtomicUsize::new(0)),
            },
            Duration::ZERO,
        );
        assert!(fleet.ensure(ensure_req("thermal", 1)).await.is_err());
    }

    #[tokio::test]
    async fn exited_device_is_restarted_with_its_config() {
        let launches = Arc::new(AtomicUsize::new(0));
        let fleet = spawn_controller(
            FlakyLauncher {
                launches: launches.clone(),
            },
            Duration::ZERO,
        );

        fleet.ensure(ensure_req("heartrate", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let listed = fleet.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].device_id, "heartrate-1");
        assert!(launches.load(Ordering::SeqCst) >= 2);
    }
}
