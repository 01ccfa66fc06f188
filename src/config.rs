use crate::error::OvsdbError;
use std::time::Duration;

/// Runtime configuration for a database instance.
#[derive(Debug, Clone)]
pub struct OvskvConfig {
    /// KV store endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    /// Deadline applied to every individual KV call.
    pub kv_call_timeout: Duration,
    /// Deadline for establishing the initial KV connection.
    pub dial_timeout: Duration,
    /// Largest request the KV client may send.
    pub max_send_bytes: usize,
    /// Largest response the KV client may receive; 0 means unlimited.
    pub max_recv_bytes: usize,
}

impl Default for OvskvConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            kv_call_timeout: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(30),
            max_send_bytes: 120 * 1024 * 1024,
            max_recv_bytes: 0,
        }
    }
}

impl OvskvConfig {
    pub fn validate(&self) -> Result<(), OvsdbError> {
        if self.endpoints.is_empty() {
            return Err(OvsdbError::Ovsdb("no KV endpoints configured".into()));
        }
        if self.kv_call_timeout.is_zero() {
            return Err(OvsdbError::Ovsdb("kv_call_timeout must be non-zero".into()));
        }
        if self.max_send_bytes == 0 {
            return Err(OvsdbError::Ovsdb("max_send_bytes must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::OvskvConfig;

    #[test]
    fn default_config_validates() {
        OvskvConfig::default().validate().expect("default config");
    }

    #[test]
    fn empty_endpoints_rejected() {
        let cfg = OvskvConfig {
            endpoints: vec![],
            ..OvskvConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
