use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One emitted sample, stamped with its wall-clock push time (not the
/// generator's original timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub attribute_id: String,
    pub timestamp: i64,
    pub payload: f64,
}

#[derive(Debug, Serialize)]
pub struct JoinAttribute {
    pub attribute_id: String,
    pub sampling_rate: f64,
    pub attribute_type: String,
}

/// Metadata published once per sensor subscribe.
#[derive(Debug, Serialize)]
pub struct JoinPayload {
    pub connector_id: String,
    pub connector_name: String,
    pub sensor_id: String,
    pub sensor_name: String,
    pub attributes: BTreeMap<String, JoinAttribute>,
    pub sampling_rate: f64,
    pub bearer_token: String,
}

pub fn join_topic(prefix: &str, connector_id: &str, sensor_id: &str) -> String {
    format!("{prefix}/{connector_id}/{sensor_id}/join")
}

pub fn command_topic(prefix: &str, connector_id: &str, sensor_id: &str) -> String {
    format!("{prefix}/{connector_id}/{sensor_id}/cmd")
}

pub fn measurement_topic(prefix: &str, connector_id: &str, sensor_id: &str) -> String {
    format!("{prefix}/{connector_id}/{sensor_id}/measurement")
}

pub fn measurements_topic(prefix: &str, connector_id: &str, sensor_id: &str) -> String {
    format!("{prefix}/{connector_id}/{sensor_id}/measurements")
}

pub fn encode_measurement(measurement: &Measurement) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(measurement)?))
}

pub fn encode_batch(measurements: &[Measurement]) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(measurements)?))
}

pub fn encode_join(join: &JoinPayload) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(join)?))
}
