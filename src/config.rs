use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_client_prefix: String,

    pub http_bind: String,

    pub generator_cmd: PathBuf,
    pub fetch_pool_size: usize,
    pub fetch_timeout: Duration,
    pub fetch_retry_delay: Duration,

    pub batch_size: usize,
    pub batch_window: Duration,
    pub generation_duration: u32,
    pub heart_rate: f64,
    pub respiratory_rate: f64,
    pub scr_number: u32,
    pub burst_number: u32,

    pub connect_base_delay: Duration,
    pub connect_max_delay: Duration,
    pub connect_retry_budget: u32,
    pub reconnect_cooldown: Duration,
    pub join_retry_delay: Duration,
    pub settle_delay: Duration,

    pub initial_devices: Vec<(String, usize)>,
    pub bearer_token: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mqtt_url = env_string("FLEET_MQTT_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let url = Url::parse(&mqtt_url).context("invalid FLEET_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("FLEET_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("FLEET_MQTT_USERNAME");
        let mqtt_password = env_optional("FLEET_MQTT_PASSWORD");

        let mqtt_topic_prefix = env_string("FLEET_MQTT_TOPIC_PREFIX", Some("sensors".to_string()))?;
        let mqtt_client_prefix =
            env_string("FLEET_MQTT_CLIENT_PREFIX", Some("fleet-sim".to_string()))?;

        let http_bind = env_string("FLEET_HTTP_BIND", Some("127.0.0.1:9330".to_string()))?;

        let generator_cmd = PathBuf::from(env_string(
            "FLEET_GENERATOR_CMD",
            Some("/usr/local/bin/samplegen".to_string()),
        )?);
        let fetch_pool_size = env_u64("FLEET_FETCH_POOL_SIZE", Some(4))?.max(1) as usize;
        let fetch_timeout =
            Duration::from_millis(env_u64("FLEET_FETCH_TIMEOUT_MS", Some(30_000))?);
        let fetch_retry_delay =
            Duration::from_millis(env_u64("FLEET_FETCH_RETRY_DELAY_MS", Some(1_000))?);

        let batch_size = env_u64("FLEET_BATCH_SIZE", Some(25))?.max(1) as usize;
        let batch_window = Duration::from_millis(env_u64("FLEET_BATCH_WINDOW_MS", Some(2_000))?);
        let generation_duration =
            env_u64("FLEET_GENERATION_DURATION_SECONDS", Some(60))?.max(1) as u32;
        let heart_rate = env_f64("FLEET_HEART_RATE", Some(70.0))?;
        let respiratory_rate = env_f64("FLEET_RESPIRATORY_RATE", Some(15.0))?;
        let scr_number = env_u64("FLEET_SCR_NUMBER", Some(4))? as u32;
        let burst_number = env_u64("FLEET_BURST_NUMBER", Some(2))? as u32;

        let connect_base_delay =
            Duration::from_millis(env_u64("FLEET_CONNECT_BASE_DELAY_MS", Some(500))?);
        let connect_max_delay =
            Duration::from_millis(env_u64("FLEET_CONNECT_MAX_DELAY_MS", Some(5_000))?);
        let connect_retry_budget = env_u64("FLEET_CONNECT_RETRY_BUDGET", Some(10))? as u32;
        let reconnect_cooldown =
            Duration::from_millis(env_u64("FLEET_RECONNECT_COOLDOWN_MS", Some(15_000))?);
        let join_retry_delay =
            Duration::from_millis(env_u64("FLEET_JOIN_RETRY_DELAY_MS", Some(2_000))?);
        let settle_delay = Duration::from_millis(env_u64("FLEET_SETTLE_DELAY_MS", Some(250))?);

        let initial_devices = parse_initial_devices(
            &env_string("FLEET_INITIAL_DEVICES", Some(String::new()))?,
        )?;
        let bearer_token = env_string(
            "FLEET_BEARER_TOKEN",
            Some(Uuid::new_v4().to_string()),
        )?;

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_client_prefix,
            http_bind,
            generator_cmd,
            fetch_pool_size,
            fetch_timeout,
            fetch_retry_delay,
            batch_size,
            batch_window,
            generation_duration,
            heart_rate,
            respiratory_rate,
            scr_number,
            burst_number,
            connect_base_delay,
            connect_max_delay,
            connect_retry_budget,
            reconnect_cooldown,
            join_retry_delay,
            settle_delay,
            initial_devices,
            bearer_token,
        })
    }
}

/// Parses `"heartrate=2,ecg=1"` into per-sensor-type device counts.
pub fn parse_initial_devices(raw: &str) -> Result<Vec<(String, usize)>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (sensor_type, count) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid FLEET_INITIAL_DEVICES entry: {part}"))?;
        let count = count
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid device count in {part}"))?;
        out.push((sensor_type.trim().to_string(), count));
    }
    Ok(out)
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_topic_prefix: "sensors".to_string(),
        mqtt_client_prefix: "fleet-sim-test".to_string(),
        http_bind: "127.0.0.1:0".to_string(),
        generator_cmd: PathBuf::from("/bin/false"),
        fetch_pool_size: 2,
        fetch_timeout: Duration::from_secs(5),
        fetch_retry_delay: Duration::from_millis(1_000),
        batch_size: 25,
        batch_window: Duration::from_millis(2_000),
        generation_duration: 60,
        heart_rate: 70.0,
        respiratory_rate: 15.0,
        scr_number: 4,
        burst_number: 2,
        connect_base_delay: Duration::from_millis(500),
        connect_max_delay: Duration::from_millis(5_000),
        connect_retry_budget: 10,
        reconnect_cooldown: Duration::from_millis(15_000),
        join_retry_delay: Duration::from_millis(2_000),
        settle_delay: Duration::from_millis(0),
        initial_devices: Vec::new(),
        bearer_token: "test-token".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_initial_devices_accepts_multiple_types() {
        let parsed = parse_initial_devices("heartrate=2, ecg=1").unwrap();
        assert_eq!(
            parsed,
            vec![("heartrate".to_string(), 2), ("ecg".to_string(), 1)]
        );
    }

    #[test]
    fn parse_initial_devices_empty_is_empty() {
        assert!(parse_initial_devices("").unwrap().is_empty());
        assert!(parse_initial_devices(" , ").unwrap().is_empty());
    }

    #[test]
    fn parse_initial_devices_rejects_missing_count() {
        assert!(parse_initial_devices("heartrate").is_err());
        assert!(parse_initial_devices("heartrate=x").is_err());
    }
}
