use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer::{DEFAULT_LOG_CAPACITY, DEFAULT_RAW_CAPACITY};
use crate::controller::{
    ControllerSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_FETCH_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use crate::grid::{FrameResolution, GridShape};
use crate::liveness::DEFAULT_LIVENESS_WINDOW;
use crate::session::SessionSettings;
use crate::transport::{
    parse_mqtt_endpoint, BrokerSettings, Credentials, MqttEndpoint, DEFAULT_CLIENT_ID,
    DEFAULT_KEEP_ALIVE, DEFAULT_TOPIC,
};

const DEFAULT_BROKER_ADDR: &str = "broker.mqttdashboard.com:1883";
/// Largest grid edge, in zones.
const MAX_GRID_DIMENSION: u32 = 1024;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    mqtt: Option<MqttConfigFile>,
    grid: Option<DimensionsFile>,
    frame: Option<DimensionsFile>,
    buffers: Option<BuffersConfigFile>,
    liveness: Option<LivenessConfigFile>,
    fetch: Option<FetchConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    keep_alive_secs: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DimensionsFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BuffersConfigFile {
    log_capacity: Option<usize>,
    raw_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct LivenessConfigFile {
    window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FetchConfigFile {
    timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

/// Fully resolved monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mqtt: MqttSettings,
    pub grid: GridShape,
    pub frame: FrameResolution,
    pub log_capacity: usize,
    pub raw_capacity: usize,
    pub liveness_window: Duration,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl MonitorConfig {
    /// Defaults, then `$ZONE_MONITOR_CONFIG` (JSON), then environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ZONE_MONITOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let mqtt = file.mqtt.unwrap_or_default();
        let grid = file.grid.unwrap_or_default();
        let frame = file.frame.unwrap_or_default();
        let buffers = file.buffers.unwrap_or_default();
        let liveness = file.liveness.unwrap_or_default();
        let fetch = file.fetch.unwrap_or_default();

        Self {
            mqtt: MqttSettings {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                keep_alive: mqtt
                    .keep_alive_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_KEEP_ALIVE),
                connect_timeout: mqtt
                    .connect_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            },
            grid: GridShape {
                width: grid.width.unwrap_or(GridShape::default().width),
                height: grid.height.unwrap_or(GridShape::default().height),
            },
            frame: FrameResolution {
                width: frame.width.unwrap_or(FrameResolution::default().width),
                height: frame.height.unwrap_or(FrameResolution::default().height),
            },
            log_capacity: buffers.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY),
            raw_capacity: buffers.raw_capacity.unwrap_or(DEFAULT_RAW_CAPACITY),
            liveness_window: liveness
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LIVENESS_WINDOW),
            fetch_timeout: fetch
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FETCH_TIMEOUT),
            poll_interval: fetch
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("MQTT_BROKER_ADDR") {
            self.mqtt.broker_addr = addr;
        }
        if let Some(topic) = non_empty_env("MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(client_id) = non_empty_env("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = non_empty_env("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = non_empty_env("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(use_tls) = non_empty_env("MQTT_USE_TLS") {
            self.mqtt.use_tls = parse_bool(&use_tls)
                .ok_or_else(|| anyhow!("MQTT_USE_TLS must be true or false"))?;
        }
        if let Some(path) = non_empty_env("MQTT_TLS_CA_PATH") {
            self.mqtt.tls_ca_path = Some(PathBuf::from(path));
        }
        if let Some(grid) = non_empty_env("ZONE_MONITOR_GRID") {
            let (width, height) = parse_dimensions(&grid)
                .ok_or_else(|| anyhow!("ZONE_MONITOR_GRID must look like 6x4"))?;
            self.grid = GridShape { width, height };
        }
        if let Some(frame) = non_empty_env("ZONE_MONITOR_FRAME") {
            let (width, height) = parse_dimensions(&frame)
                .ok_or_else(|| anyhow!("ZONE_MONITOR_FRAME must look like 640x480"))?;
            self.frame = FrameResolution { width, height };
        }
        if let Some(window) = non_empty_env("ZONE_MONITOR_LIVENESS_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("ZONE_MONITOR_LIVENESS_SECS must be an integer number of seconds")
            })?;
            self.liveness_window = Duration::from_secs(seconds);
        }
        if let Some(timeout) = non_empty_env("ZONE_MONITOR_FETCH_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("ZONE_MONITOR_FETCH_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.fetch_timeout = Duration::from_millis(millis);
        }
        if let Some(timeout) = non_empty_env("ZONE_MONITOR_CONNECT_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("ZONE_MONITOR_CONNECT_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.mqtt.connect_timeout = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.grid.width == 0 || self.grid.height == 0 {
            return Err(anyhow!("grid dimensions must be greater than zero"));
        }
        if self.grid.width > MAX_GRID_DIMENSION || self.grid.height > MAX_GRID_DIMENSION {
            return Err(anyhow!(
                "grid dimensions must be at most {} zones per axis",
                MAX_GRID_DIMENSION
            ));
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(anyhow!("frame resolution must be greater than zero"));
        }
        if self.log_capacity == 0 || self.raw_capacity == 0 {
            return Err(anyhow!("buffer capacities must be greater than zero"));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(anyhow!("MQTT topic must not be empty"));
        }
        if self.mqtt.connect_timeout.is_zero() {
            return Err(anyhow!("MQTT connect timeout must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("fetch poll interval must be greater than zero"));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            return Err(anyhow!("MQTT password provided without username"));
        }
        self.endpoint()?;
        Ok(())
    }

    pub fn endpoint(&self) -> Result<MqttEndpoint> {
        parse_mqtt_endpoint(&self.mqtt.broker_addr, self.mqtt.use_tls)
    }

    /// Broker settings for the transport; reads the CA file if configured.
    pub fn broker_settings(&self) -> Result<BrokerSettings> {
        let endpoint = self.endpoint()?;
        let tls_ca = match &self.mqtt.tls_ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };
        let credentials = self.mqtt.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.mqtt.password.clone().unwrap_or_default(),
        });
        Ok(BrokerSettings {
            endpoint,
            topic: self.mqtt.topic.clone(),
            client_id: self.mqtt.client_id.clone(),
            credentials,
            keep_alive: self.mqtt.keep_alive,
            tls_ca,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            grid: self.grid,
            log_capacity: self.log_capacity,
            raw_capacity: self.raw_capacity,
            liveness_window: self.liveness_window,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            frame: self.frame,
            connect_timeout: self.mqtt.connect_timeout,
            fetch_timeout: self.fetch_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_dimensions(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.trim().to_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().parse().ok(), h.trim().parse().ok())
    })?;
    Some((width?, height?))
}
