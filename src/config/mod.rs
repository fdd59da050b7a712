//! Configuration management for ptt-core
//!
//! All runtime configuration is environment-sourced; a handful of CLI flags
//! (see `args.rs`) override individual fields.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server microphone arming mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMicMode {
    /// Transmit whenever the floor is free of web clients
    #[default]
    Always,
    /// Transmit only while the server itself holds the floor
    Ptt,
}

impl ServerMicMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMicMode::Always => "always",
            ServerMicMode::Ptt => "ptt",
        }
    }
}

/// Speaker subprocess flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerFlavor {
    /// Spawned on floor grant, killed on release
    #[default]
    PerSession,
    /// Long-lived helper kept across silences for lower latency
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// ICE servers advertised to clients
    pub ice: IceConfig,

    /// Floor arbitration configuration
    pub floor: FloorConfig,

    /// Local audio (server mic / speaker) configuration
    pub audio: AudioConfig,

    /// Serial relay configuration
    pub relay: RelayConfig,

    /// Dashboard authentication
    pub dash: DashConfig,

    /// Web push (VAPID) configuration
    pub push: PushConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Protocol timers
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind port (`HTTP_PORT`)
    pub http_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// Single STUN URL advertised in the config envelope (`STUN_SERVER`)
    pub stun_server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorConfig {
    /// Maximum transmit duration in milliseconds; 0 disables (`PTT_TIMEOUT`)
    pub ptt_timeout_ms: u64,
}

impl FloorConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.ptt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Master switch for local playback (`ENABLE_LOCAL_AUDIO`)
    pub enable_local_audio: bool,

    /// Master switch for the server microphone (`ENABLE_SERVER_MIC`)
    pub enable_server_mic: bool,

    /// Server microphone arming mode (`SERVER_MIC_MODE`)
    pub server_mic_mode: ServerMicMode,

    /// ALSA capture device for the mic transcoder (`MIC_DEVICE`)
    pub mic_device: String,

    /// Output device index for the persistent speaker helper (`SPEAKER_DEVICE_ID`)
    pub speaker_device_id: String,

    /// Speaker subprocess flavor; `USE_PYTHON_AUDIO` selects Persistent
    pub speaker_flavor: SpeakerFlavor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Enable the serial relay (`ENABLE_RELAY`)
    pub enabled: bool,

    /// Serial device path (`RELAY_PORT`)
    pub port: String,

    /// Baud rate (`RELAY_BAUD_RATE`)
    pub baud_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashConfig {
    /// Dashboard password (`DASH_PASSWORD`); empty disables login
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushConfig {
    /// VAPID public key, advertised in the config envelope (`VAPID_PUBLIC_KEY`)
    pub vapid_public_key: Option<String>,

    /// VAPID private key (`VAPID_PRIVATE_KEY`)
    pub vapid_private_key: Option<String>,

    /// VAPID subject, typically a mailto: URL (`VAPID_SUBJECT`)
    pub vapid_subject: Option<String>,
}

impl PushConfig {
    /// Delivery is possible only with a complete key pair.
    pub fn delivery_enabled(&self) -> bool {
        self.vapid_public_key.is_some() && self.vapid_private_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Mirror log lines into daily files (`ENABLE_FILE_LOG`)
    pub enable_file_log: bool,

    /// Days to keep rotated log files (`LOG_RETENTION_DAYS`)
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Finished recordings
    pub recordings_dir: PathBuf,

    /// In-flight recording scratch space
    pub recordings_temp_dir: PathBuf,

    /// Daily log files
    pub log_dir: PathBuf,
}

impl PathsConfig {
    /// The client-name table lives next to the recordings so post-hoc
    /// processing can label audio.
    pub fn client_names_file(&self) -> PathBuf {
        self.recordings_dir.join("client_names.json")
    }

    /// Graceful-exit intent marker written by the dashboard restart endpoint.
    pub fn restart_marker(&self) -> PathBuf {
        PathBuf::from("restart.requested")
    }
}

/// Protocol timers. Defaults follow the documented values; sites must read
/// these fields instead of hard-coding durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for the first offer after the config envelope
    pub offer_wait_secs: u64,

    /// ICE gathering deadline before a p2p_offer is sent anyway
    pub ice_gather_timeout_ms: u64,

    /// Deadline for the client to answer a restart prompt / settle the restart
    pub ice_restart_timeout_ms: u64,

    /// Window after a successful restart during which transient
    /// `disconnected` events are ignored
    pub ice_restart_cooldown_ms: u64,

    /// Restart attempts per disconnect episode before the session is closed
    pub ice_restart_max_attempts: u32,

    /// Grace before a disconnected P2P connection is torn down
    pub p2p_cleanup_grace_ms: u64,

    /// Heartbeat ping interval
    pub heartbeat_secs: u64,

    /// Wait for the recorder subprocess to exit after stdin half-close
    pub recorder_close_secs: u64,

    /// Per-frame subprocess stdin write deadline
    pub subprocess_write_ms: u64,

    /// Cool-down after a mic or speaker subprocess exit
    pub respawn_cooldown_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            offer_wait_secs: 30,
            ice_gather_timeout_ms: 2_500,
            ice_restart_timeout_ms: 5_000,
            ice_restart_cooldown_ms: 10_000,
            ice_restart_max_attempts: 5,
            p2p_cleanup_grace_ms: 15_000,
            heartbeat_secs: 30,
            recorder_close_secs: 5,
            subprocess_write_ms: 250,
            respawn_cooldown_secs: 10,
        }
    }
}

impl TimingConfig {
    pub fn offer_wait(&self) -> Duration {
        Duration::from_secs(self.offer_wait_secs)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn ice_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_restart_timeout_ms)
    }

    pub fn ice_restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.ice_restart_cooldown_ms)
    }

    pub fn p2p_cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.p2p_cleanup_grace_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn recorder_close(&self) -> Duration {
        Duration::from_secs(self.recorder_close_secs)
    }

    pub fn subprocess_write(&self) -> Duration {
        Duration::from_millis(self.subprocess_write_ms)
    }

    pub fn respawn_cooldown(&self) -> Duration {
        Duration::from_secs(self.respawn_cooldown_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { http_port: 3000 },
            ice: IceConfig {
                stun_server: default_stun_server(),
            },
            floor: FloorConfig { ptt_timeout_ms: 0 },
            audio: AudioConfig {
                enable_local_audio: false,
                enable_server_mic: false,
                server_mic_mode: ServerMicMode::Always,
                mic_device: "default".to_string(),
                speaker_device_id: String::new(),
                speaker_flavor: SpeakerFlavor::PerSession,
            },
            relay: RelayConfig {
                enabled: false,
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
            },
            dash: DashConfig {
                password: String::new(),
            },
            push: PushConfig::default(),
            logging: LoggingConfig {
                enable_file_log: false,
                retention_days: 14,
            },
            paths: PathsConfig {
                recordings_dir: PathBuf::from("recordings"),
                recordings_temp_dir: PathBuf::from("recordings_temp"),
                log_dir: PathBuf::from("logs"),
            },
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(port) = env_parse::<u16>("HTTP_PORT") {
            config.server.http_port = port;
        }
        if let Ok(url) = env::var("STUN_SERVER") {
            if !url.is_empty() {
                config.ice.stun_server = url;
            }
        }
        if let Some(ms) = env_parse::<u64>("PTT_TIMEOUT") {
            config.floor.ptt_timeout_ms = ms;
        }

        config.audio.enable_local_audio = env_bool("ENABLE_LOCAL_AUDIO", false);
        config.audio.enable_server_mic = env_bool("ENABLE_SERVER_MIC", false);
        if let Ok(mode) = env::var("SERVER_MIC_MODE") {
            config.audio.server_mic_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "ptt" => ServerMicMode::Ptt,
                _ => ServerMicMode::Always,
            };
        }
        if let Ok(device) = env::var("MIC_DEVICE") {
            if !device.is_empty() {
                config.audio.mic_device = device;
            }
        }
        if let Ok(id) = env::var("SPEAKER_DEVICE_ID") {
            config.audio.speaker_device_id = id;
        }
        if env_bool("USE_PYTHON_AUDIO", false) {
            config.audio.speaker_flavor = SpeakerFlavor::Persistent;
        }

        config.relay.enabled = env_bool("ENABLE_RELAY", false);
        if let Ok(port) = env::var("RELAY_PORT") {
            if !port.is_empty() {
                config.relay.port = port;
            }
        }
        if let Some(baud) = env_parse::<u32>("RELAY_BAUD_RATE") {
            config.relay.baud_rate = baud;
        }

        if let Ok(password) = env::var("DASH_PASSWORD") {
            config.dash.password = password;
        }

        config.push.vapid_public_key = env_nonempty("VAPID_PUBLIC_KEY");
        config.push.vapid_private_key = env_nonempty("VAPID_PRIVATE_KEY");
        config.push.vapid_subject = env_nonempty("VAPID_SUBJECT");

        config.logging.enable_file_log = env_bool("ENABLE_FILE_LOG", false);
        if let Some(days) = env_parse::<u32>("LOG_RETENTION_DAYS") {
            config.logging.retention_days = days;
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.http_port == 0 {
            return Err("HTTP port must be non-zero".into());
        }

        if self.ice.stun_server.is_empty() {
            return Err("STUN server URL must not be empty".into());
        }
        if !self.ice.stun_server.starts_with("stun:") {
            return Err("STUN server URL must use the stun: scheme".into());
        }

        if self.relay.enabled {
            if self.relay.port.is_empty() {
                return Err("Relay is enabled but RELAY_PORT is empty".into());
            }
            if self.relay.baud_rate == 0 {
                return Err("Relay baud rate must be non-zero".into());
            }
        }

        if self.push.vapid_private_key.is_some() && self.push.vapid_public_key.is_none() {
            return Err("VAPID_PRIVATE_KEY is set without VAPID_PUBLIC_KEY".into());
        }

        if self.timing.ice_restart_max_attempts == 0 {
            return Err("ICE restart attempt limit must be non-zero".into());
        }

        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn default_stun_server() -> String {
    "stun:stun.l.google.com:19302".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = Config::default();
        cfg.server.http_port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_stun_scheme() {
        let mut cfg = Config::default();
        cfg.ice.stun_server = "turn:example.com:3478".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_relay_requires_port() {
        let mut cfg = Config::default();
        cfg.relay.enabled = true;
        cfg.relay.port = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_private_key_without_public() {
        let mut cfg = Config::default();
        cfg.push.vapid_private_key = Some("key".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn floor_timeout_zero_disables() {
        let cfg = Config::default();
        assert_eq!(cfg.floor.max_duration(), Duration::ZERO);
    }

    #[test]
    fn push_delivery_requires_both_keys() {
        let mut push = PushConfig::default();
        assert!(!push.delivery_enabled());
        push.vapid_public_key = Some("pub".to_string());
        assert!(!push.delivery_enabled());
        push.vapid_private_key = Some("priv".to_string());
        assert!(push.delivery_enabled());
    }
}
