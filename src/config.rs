use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    pub netatmo: NetatmoConfig,
    pub monitor: MonitorConfig,
    pub message: MessageConfig,
    pub speech: SpeechConfig,
    pub speaker: SpeakerConfig,
    pub resilience: ResilienceConfig,
    pub network: NetworkConfig,
    pub status: BridgeConfig,
    pub trigger: BridgeConfig,
}

/// Password-grant credentials plus the station to query.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetatmoConfig {
    pub token_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub scope: String,
    pub device_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    pub target_location: String,
    pub warning_level: i64,
    pub interval_minutes: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// `report` takes `{location}` and `{value}` placeholders.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MessageConfig {
    pub report: String,
    pub advice: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub language: String,
    pub plain_http: bool,
    pub max_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpeakerConfig {
    pub name: String,
    pub executable: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResilienceConfig {
    pub initial_fuse: u32,
    pub link_retry_secs: u64,
    pub compose_retry_secs: u64,
    pub synthesis_retry_secs: u64,
    pub playback_retry_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    pub http_timeout_secs: u64,
}

/// Local UDP endpoint pair for a helper process. A zero port disables the bridge.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub buffer_size: usize,
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Failed to parse {}: {:?}", key, value))
}

impl Config {
    /// Builds the configuration from the environment variables `build.rs`
    /// exported out of config.toml at compile time.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            netatmo: NetatmoConfig {
                token_url: env!("NETATMO_TOKEN_URL").to_string(),
                api_url: env!("NETATMO_API_URL").to_string(),
                client_id: env!("NETATMO_CLIENT_ID").to_string(),
                client_secret: env!("NETATMO_CLIENT_SECRET").to_string(),
                username: env!("NETATMO_USERNAME").to_string(),
                password: env!("NETATMO_PASSWORD").to_string(),
                scope: env!("NETATMO_SCOPE").to_string(),
                device_id: env!("NETATMO_DEVICE_ID").to_string(),
            },

            monitor: MonitorConfig {
                target_location: env!("TARGET_LOCATION").to_string(),
                warning_level: parse(env!("WARNING_LEVEL"), "WARNING_LEVEL")?,
                interval_minutes: parse(env!("INTERVAL_MINUTES"), "INTERVAL_MINUTES")?,
            },

            message: MessageConfig {
                report: env!("MESSAGE_REPORT").to_string(),
                advice: env!("MESSAGE_ADVICE").to_string(),
            },

            speech: SpeechConfig {
                endpoint: env!("SPEECH_ENDPOINT").to_string(),
                language: env!("SPEECH_LANGUAGE").to_string(),
                plain_http: parse(env!("SPEECH_PLAIN_HTTP"), "SPEECH_PLAIN_HTTP")?,
                max_chars: parse(env!("SPEECH_MAX_CHARS"), "SPEECH_MAX_CHARS")?,
            },

            speaker: SpeakerConfig {
                name: env!("SPEAKER_NAME").to_string(),
                executable: env!("SPEAKER_EXECUTABLE").to_string(),
                timeout_ms: parse(env!("SPEAKER_TIMEOUT_MS"), "SPEAKER_TIMEOUT_MS")?,
            },

            resilience: ResilienceConfig {
                initial_fuse: parse(env!("INITIAL_FUSE"), "INITIAL_FUSE")?,
                link_retry_secs: parse(env!("LINK_RETRY_SECS"), "LINK_RETRY_SECS")?,
                compose_retry_secs: parse(env!("COMPOSE_RETRY_SECS"), "COMPOSE_RETRY_SECS")?,
                synthesis_retry_secs: parse(env!("SYNTHESIS_RETRY_SECS"), "SYNTHESIS_RETRY_SECS")?,
                playback_retry_secs: parse(env!("PLAYBACK_RETRY_SECS"), "PLAYBACK_RETRY_SECS")?,
            },

            network: NetworkConfig {
                probe_host: env!("PROBE_HOST").to_string(),
                probe_port: parse(env!("PROBE_PORT"), "PROBE_PORT")?,
                probe_timeout_ms: parse(env!("PROBE_TIMEOUT_MS"), "PROBE_TIMEOUT_MS")?,
                http_timeout_secs: parse(env!("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS")?,
            },

            // LED helper only receives
            status: BridgeConfig {
                local_ip: env!("STATUS_LOCAL_IP").to_string(),
                local_port: parse(env!("STATUS_LOCAL_PORT"), "STATUS_LOCAL_PORT")?,
                remote_ip: env!("STATUS_REMOTE_IP").to_string(),
                remote_port: parse(env!("STATUS_REMOTE_PORT"), "STATUS_REMOTE_PORT")?,
                buffer_size: 0,
            },

            // button helper only sends
            trigger: BridgeConfig {
                local_ip: env!("TRIGGER_LOCAL_IP").to_string(),
                local_port: parse(env!("TRIGGER_LOCAL_PORT"), "TRIGGER_LOCAL_PORT")?,
                remote_ip: String::new(),
                remote_port: 0,
                buffer_size: parse(env!("TRIGGER_BUFFER_SIZE"), "TRIGGER_BUFFER_SIZE")?,
            },
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.network.http_timeout_secs)
    }

    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.app_name, self.app_version)
    }
}
