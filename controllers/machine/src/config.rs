//! Controller settings.
//!
//! All settings come from environment variables with sensible defaults so the
//! controller runs unconfigured inside a cluster.

use crate::error::ControllerError;
use crate::reconciler::ReconcileSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the Machine Controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Restrict watches to one namespace (`None` watches all namespaces)
    pub namespace: Option<String>,
    /// Requeue delay while a provider is not ready or not found
    pub external_ready_wait: Duration,
    /// Requeue delay while external resources are being deleted
    pub delete_requeue: Duration,
    /// Upper bound for a single reconciliation pass
    pub reconcile_timeout: Duration,
    /// Maximum number of machines reconciled in parallel
    pub max_concurrent_reconciles: u16,
    /// Listen address for health probes and metrics
    pub probe_bind_address: SocketAddr,
    /// Optional multi-document YAML bundle applied at startup
    pub components_path: Option<PathBuf>,
    /// Poll interval while applying the component bundle
    pub components_apply_interval: Duration,
    /// Give up applying the component bundle after this long
    pub components_apply_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: None,
            external_ready_wait: Duration::from_secs(30),
            delete_requeue: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(60),
            max_concurrent_reconciles: 10,
            probe_bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            components_path: None,
            components_apply_interval: Duration::from_secs(10),
            components_apply_timeout: Duration::from_secs(300),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::InvalidConfig` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::InvalidConfig` if a value is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let seconds = |key: &str, default: Duration| -> Result<Duration, ControllerError> {
            match value(key) {
                None => Ok(default),
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
            }
        };

        let max_concurrent_reconciles = match value("MAX_CONCURRENT_RECONCILES") {
            None => defaults.max_concurrent_reconciles,
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) => {
                    return Err(ControllerError::InvalidConfig(
                        "MAX_CONCURRENT_RECONCILES must be at least 1".to_string(),
                    ));
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "MAX_CONCURRENT_RECONCILES={raw}: {e}"
                    )));
                }
            },
        };

        let probe_bind_address = match value("PROBE_BIND_ADDRESS") {
            None => defaults.probe_bind_address,
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| ControllerError::InvalidConfig(format!("PROBE_BIND_ADDRESS={raw}: {e}")))?,
        };

        Ok(Self {
            namespace: value("WATCH_NAMESPACE"),
            external_ready_wait: seconds("EXTERNAL_READY_WAIT_SECS", defaults.external_ready_wait)?,
            delete_requeue: seconds("DELETE_REQUEUE_SECS", defaults.delete_requeue)?,
            reconcile_timeout: seconds("RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout)?,
            max_concurrent_reconciles,
            probe_bind_address,
            components_path: value("COMPONENTS_PATH").map(PathBuf::from),
            components_apply_interval: seconds("COMPONENTS_APPLY_INTERVAL_SECS", defaults.components_apply_interval)?,
            components_apply_timeout: seconds("COMPONENTS_APPLY_TIMEOUT_SECS", defaults.components_apply_timeout)?,
        })
    }

    /// Timing knobs consumed by the reconciler.
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            external_ready_wait: self.external_ready_wait,
            delete_requeue: self.delete_requeue,
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings, ControllerError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.external_ready_wait, Duration::from_secs(30));
        assert_eq!(settings.max_concurrent_reconciles, 10);
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("WATCH_NAMESPACE", "capi-system"),
            ("EXTERNAL_READY_WAIT_SECS", "5"),
            ("DELETE_REQUEUE_SECS", "2"),
            ("MAX_CONCURRENT_RECONCILES", "4"),
            ("PROBE_BIND_ADDRESS", "127.0.0.1:9440"),
            ("COMPONENTS_PATH", "/etc/components.yaml"),
        ])
        .unwrap();

        assert_eq!(settings.namespace.as_deref(), Some("capi-system"));
        assert_eq!(settings.external_ready_wait, Duration::from_secs(5));
        assert_eq!(settings.delete_requeue, Duration::from_secs(2));
        assert_eq!(settings.max_concurrent_reconciles, 4);
        assert_eq!(settings.probe_bind_address.port(), 9440);
        assert_eq!(settings.components_path, Some(PathBuf::from("/etc/components.yaml")));
        assert_eq!(settings.reconcile_settings().external_ready_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let settings = settings_from(&[("WATCH_NAMESPACE", "  "), ("EXTERNAL_READY_WAIT_SECS", "")]).unwrap();
        assert_eq!(settings.namespace, None);
        assert_eq!(settings.external_ready_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            settings_from(&[("EXTERNAL_READY_WAIT_SECS", "soon")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("MAX_CONCURRENT_RECONCILES", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("PROBE_BIND_ADDRESS", "not-an-address")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
