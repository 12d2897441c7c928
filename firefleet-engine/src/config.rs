//! Engine configuration.
//!
//! Defaults reproduce the single-host layout the service was first deployed
//! with (`/tmp/vms`, `/tmp/firecracker_sockets`, ports from 9000, bridge
//! `br0`). Every field can be overridden through `FIREFLEET_*` variables.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::EngineError;

/// Boot arguments used for every guest kernel.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Runtime settings for the allocator, workspace manager and supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EngineConfig {
    /// Root of the per-user, per-VM directory tree.
    pub base_dir: PathBuf,
    /// Directory holding every VM's control socket.
    pub socket_dir: PathBuf,
    /// Socket file prefix: sockets are named `{prefix}_{id}.sock`.
    pub socket_prefix: String,
    /// SQLite database backing the lifecycle registry.
    pub database_path: PathBuf,
    /// Path to the `firecracker` binary.
    pub firecracker_binary: PathBuf,
    /// Directory containing the network/storage/cleanup scripts.
    pub script_dir: PathBuf,
    /// Run scripts through `sudo`.
    pub use_sudo: bool,
    /// Host bridge new tap devices are attached to.
    pub bridge_name: String,
    /// First port handed out.
    pub start_port: u16,
    /// Tap devices are named `{tap_prefix}{n}`.
    pub tap_prefix: String,
    /// First tap index handed out.
    pub start_tap: u32,
    /// Allocation retries before `AllocationConflict` surfaces.
    pub allocation_attempts: u32,
    /// Wait between hypervisor launch and the liveness poll.
    pub liveness_grace: Duration,
    /// Upper bound on waiting for the control socket to appear.
    pub socket_timeout: Duration,
    /// Graceful-shutdown window before the hypervisor is killed.
    pub terminate_timeout: Duration,
    /// Host address control bridges listen on; `None` disables bridges.
    pub control_bridge_host: Option<IpAddr>,
    /// Period of the background liveness sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// Kernel command line.
    pub boot_args: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/vms"),
            socket_dir: PathBuf::from("/tmp/firecracker_sockets"),
            socket_prefix: "firecracker".to_owned(),
            database_path: PathBuf::from("./vm.db"),
            firecracker_binary: PathBuf::from("firecracker"),
            script_dir: PathBuf::from("."),
            use_sudo: true,
            bridge_name: "br0".to_owned(),
            start_port: 9000,
            tap_prefix: "tap".to_owned(),
            start_tap: 0,
            allocation_attempts: 8,
            liveness_grace: Duration::from_secs(1),
            socket_timeout: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(3),
            control_bridge_host: Some(IpAddr::from([127, 0, 0, 1])),
            sweep_interval: Some(Duration::from_secs(30)),
            boot_args: DEFAULT_BOOT_ARGS.to_owned(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `FIREFLEET_*` environment variables.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if a variable is present but malformed.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, starting from defaults.
    ///
    /// Durations are whole milliseconds. `FIREFLEET_CONTROL_BRIDGE_HOST` and
    /// `FIREFLEET_SWEEP_INTERVAL_MS` accept `off` to disable the feature.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] naming the first malformed key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FIREFLEET_BASE_DIR") {
            config.base_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FIREFLEET_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FIREFLEET_SOCKET_PREFIX") {
            config.socket_prefix = v;
        }
        if let Some(v) = get("FIREFLEET_DATABASE") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("FIREFLEET_FIRECRACKER_BIN") {
            config.firecracker_binary = PathBuf::from(v);
        }
        if let Some(v) = get("FIREFLEET_SCRIPT_DIR") {
            config.script_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FIREFLEET_USE_SUDO") {
            config.use_sudo = parse("FIREFLEET_USE_SUDO", &v)?;
        }
        if let Some(v) = get("FIREFLEET_BRIDGE") {
            config.bridge_name = v;
        }
        if let Some(v) = get("FIREFLEET_START_PORT") {
            config.start_port = parse("FIREFLEET_START_PORT", &v)?;
        }
        if let Some(v) = get("FIREFLEET_TAP_PREFIX") {
            config.tap_prefix = v;
        }
        if let Some(v) = get("FIREFLEET_START_TAP") {
            config.start_tap = parse("FIREFLEET_START_TAP", &v)?;
        }
        if let Some(v) = get("FIREFLEET_ALLOCATION_ATTEMPTS") {
            config.allocation_attempts = parse("FIREFLEET_ALLOCATION_ATTEMPTS", &v)?;
            if config.allocation_attempts == 0 {
                return Err(EngineError::Config {
                    key: "FIREFLEET_ALLOCATION_ATTEMPTS",
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if let Some(v) = get("FIREFLEET_LIVENESS_GRACE_MS") {
            config.liveness_grace = millis("FIREFLEET_LIVENESS_GRACE_MS", &v)?;
        }
        if let Some(v) = get("FIREFLEET_SOCKET_TIMEOUT_MS") {
            config.socket_timeout = millis("FIREFLEET_SOCKET_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("FIREFLEET_TERMINATE_TIMEOUT_MS") {
            config.terminate_timeout = millis("FIREFLEET_TERMINATE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("FIREFLEET_CONTROL_BRIDGE_HOST") {
            config.control_bridge_host = if v == "off" {
                None
            } else {
                Some(parse("FIREFLEET_CONTROL_BRIDGE_HOST", &v)?)
            };
        }
        if let Some(v) = get("FIREFLEET_SWEEP_INTERVAL_MS") {
            config.sweep_interval = if v == "off" {
                None
            } else {
                Some(millis("FIREFLEET_SWEEP_INTERVAL_MS", &v)?)
            };
        }
        if let Some(v) = get("FIREFLEET_BOOT_ARGS") {
            config.boot_args = v;
        }

        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| EngineError::Config {
        key,
        reason: format!("'{value}': {e}"),
    })
}

fn millis(key: &'static str, value: &str) -> Result<Duration, EngineError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.start_port, 9000);
        assert_eq!(config.socket_prefix, "firecracker");
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("FIREFLEET_BASE_DIR", "/srv/vms"),
            ("FIREFLEET_START_PORT", "10000"),
            ("FIREFLEET_USE_SUDO", "false"),
            ("FIREFLEET_LIVENESS_GRACE_MS", "250"),
            ("FIREFLEET_CONTROL_BRIDGE_HOST", "off"),
            ("FIREFLEET_SWEEP_INTERVAL_MS", "1000"),
        ]))
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.base_dir, PathBuf::from("/srv/vms"));
        assert_eq!(config.start_port, 10000);
        assert!(!config.use_sudo);
        assert_eq!(config.liveness_grace, Duration::from_millis(250));
        assert_eq!(config.control_bridge_host, None);
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[("FIREFLEET_BRIDGE", "  ")]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.bridge_name, "br0");
    }

    #[test]
    fn malformed_values_name_the_key() {
        let cases = [
            ("FIREFLEET_START_PORT", "70000"),
            ("FIREFLEET_USE_SUDO", "maybe"),
            ("FIREFLEET_ALLOCATION_ATTEMPTS", "0"),
            ("FIREFLEET_CONTROL_BRIDGE_HOST", "localhost"),
        ];
        for (key, value) in cases {
            match EngineConfig::from_lookup(lookup(&[(key, value)])) {
                Err(EngineError::Config { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{key}={value}: expected Config error, got {other:?}"),
            }
        }
    }
}
