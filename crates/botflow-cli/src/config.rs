//! Configuration vault – reads/writes `~/.botflow/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use botflow_link::SubscriberConfig;
use botflow_runtime::{
    ActionClientConfig, BatteryMonitorConfig, InterpreterConfig, MoveConfig,
};

/// Persisted operator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host or IP of the robot's websocket bridge.
    pub robot_host: String,
    pub robot_port: u16,
    pub heartbeat_interval_ms: u64,
    pub status_poll_interval_ms: u64,
    /// Telemetry older than this is treated as stale.
    pub status_freshness_secs: u64,
    pub reconnect_delay_secs: u64,
    pub stop_timeout_secs: u64,
    pub compensation_timeout_secs: u64,
    /// Battery percent that aborts a routine.  `0` disables the monitor.
    pub low_battery_threshold: i64,
    pub battery_check_interval_secs: u64,
    pub voice_name: String,
    /// Directory holding `<id>.json` routine files.
    pub routines_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_host: "localhost".to_string(),
            robot_port: 9090,
            heartbeat_interval_ms: 3000,
            status_poll_interval_ms: 1000,
            status_freshness_secs: 10,
            reconnect_delay_secs: 5,
            stop_timeout_secs: 5,
            compensation_timeout_secs: 300,
            low_battery_threshold: 50,
            battery_check_interval_secs: 30,
            voice_name: "English-US.Male-1".to_string(),
            routines_dir: botflow_dir(&home_dir()).join("routines"),
        }
    }
}

impl Config {
    /// `ws://host:port` of the robot.
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}", self.robot_host, self.robot_port)
    }

    pub fn status_freshness(&self) -> Duration {
        Duration::from_secs(self.status_freshness_secs)
    }

    /// Zero periods in the file are raised to the smallest valid tick.
    pub fn action_client(&self) -> ActionClientConfig {
        ActionClientConfig {
            endpoint: self.endpoint(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            voice_name: self.voice_name.clone(),
            ..ActionClientConfig::default()
        }
    }

    pub fn mover(&self) -> MoveConfig {
        MoveConfig {
            poll_interval: Duration::from_millis(self.status_poll_interval_ms.max(1)),
        }
    }

    pub fn interpreter(&self) -> InterpreterConfig {
        InterpreterConfig {
            compensation_timeout: Duration::from_secs(self.compensation_timeout_secs),
            ..InterpreterConfig::default()
        }
    }

    pub fn subscriber(&self) -> SubscriberConfig {
        SubscriberConfig {
            endpoint: self.endpoint(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn battery_monitor(&self) -> BatteryMonitorConfig {
        BatteryMonitorConfig {
            threshold: self.low_battery_threshold,
            interval: Duration::from_secs(self.battery_check_interval_secs.max(1)),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn botflow_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".botflow")
}

/// `~/.botflow/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    botflow_dir(home).join("config.toml")
}

/// Load the config.  `None` when the file does not exist yet.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply environment overrides.
///
/// | Variable | Config field |
/// |---|---|
/// | `BOTFLOW_ROBOT_IP` (or `ROBOT_IP`) | `robot_host` |
/// | `BOTFLOW_ROBOT_PORT` | `robot_port` |
/// | `BOTFLOW_ROUTINES_DIR` | `routines_dir` |
/// | `BOTFLOW_LOW_BATTERY` | `low_battery_threshold` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BOTFLOW_ROBOT_IP").or_else(|_| std::env::var("ROBOT_IP"))
        && !v.trim().is_empty()
    {
        cfg.robot_host = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("BOTFLOW_ROBOT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.robot_port = port;
    }
    if let Ok(v) = std::env::var("BOTFLOW_ROUTINES_DIR") {
        cfg.routines_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("BOTFLOW_LOW_BATTERY")
        && let Ok(level) = v.parse::<i64>()
        && (0..=100).contains(&level)
    {
        cfg.low_battery_threshold = level;
    }
}

pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Write `cfg` to `path`, owner-only on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests touching process env must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn endpoint_is_derived_from_host_and_port() {
        let cfg = Config {
            robot_host: "10.0.0.7".into(),
            robot_port: 9191,
            ..Config::default()
        };
        assert_eq!(cfg.endpoint(), "ws://10.0.0.7:9191");
        assert_eq!(cfg.action_client().endpoint, "ws://10.0.0.7:9191");
        assert_eq!(cfg.subscriber().endpoint, "ws://10.0.0.7:9191");
    }

    #[test]
    fn runtime_configs_use_configured_intervals() {
        let cfg = Config {
            heartbeat_interval_ms: 1500,
            status_poll_interval_ms: 250,
            compensation_timeout_secs: 60,
            ..Config::default()
        };
        assert_eq!(cfg.action_client().heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(cfg.mover().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.interpreter().compensation_timeout, Duration::from_secs(60));
        assert_eq!(cfg.battery_monitor().threshold, 50);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_settings() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = Config {
            robot_port: 9300,
            low_battery_threshold: 30,
            voice_name: "English-US.Female-1".into(),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot_port, 9300);
        assert_eq!(loaded.low_battery_threshold, 30);
        assert_eq!(loaded.voice_name, "English-US.Female-1");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "robot_host = \"robot.local\"\n").unwrap();
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.robot_host, "robot.local");
        assert_eq!(loaded.robot_port, 9090);
        assert_eq!(loaded.stop_timeout_secs, 5);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn env_overrides_robot_address() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: guarded by ENV_LOCK.
        unsafe {
            std::env::set_var("BOTFLOW_ROBOT_IP", "192.168.1.20");
            std::env::set_var("BOTFLOW_ROBOT_PORT", "9099");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe {
            std::env::remove_var("BOTFLOW_ROBOT_IP");
            std::env::remove_var("BOTFLOW_ROBOT_PORT");
        }
        assert_eq!(cfg.endpoint(), "ws://192.168.1.20:9099");
    }

    #[test]
    fn legacy_robot_ip_is_honoured() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: guarded by ENV_LOCK.
        unsafe { std::env::set_var("ROBOT_IP", "robot-7") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("ROBOT_IP") };
        assert_eq!(cfg.robot_host, "robot-7");
    }

    #[test]
    fn out_of_range_battery_threshold_is_ignored() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: guarded by ENV_LOCK.
        unsafe { std::env::set_var("BOTFLOW_LOW_BATTERY", "140") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("BOTFLOW_LOW_BATTERY") };
        assert_eq!(cfg.low_battery_threshold, 50);
    }

    #[test]
    fn zero_intervals_are_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "heartbeat_interval_ms = 0\nstatus_poll_interval_ms = 0\nbattery_check_interval_secs = 0\n",
        )
        .unwrap();
        let cfg = {
            let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            load_from(&path).unwrap().unwrap()
        };
        assert!(!cfg.action_client().heartbeat_interval.is_zero());
        assert!(!cfg.mover().poll_interval.is_zero());
        assert_eq!(cfg.battery_monitor().interval, Duration::from_secs(1));
    }
}
