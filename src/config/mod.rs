use std::collections::HashMap;
use std::env;

use crate::provisioning::ProvisioningSettings;

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub db_max_connections: u32,
    pub listen_addr: String,
    pub jwt_secret: String,
    pub broker_enabled: bool,
    pub broker_url: String,
    pub broker_connect_timeout_ms: u64,
    pub provisioning_subject: String,
    pub default_max_retries: i32,
    pub outbox_sweep_secs: u64,
    pub outbox_batch_size: i64,
    pub use_local_urls: bool,
    pub production_domain: String,
    pub local_base_port: u16,
    pub application_ports: HashMap<String, u16>,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            db_path: get_env("DB_PATH", "/data/orchestrator.db"),
            db_max_connections: get_env("DB_MAX_CONNECTIONS", "5").parse().unwrap_or(5),
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            jwt_secret: get_env("JWT_SECRET", ""),
            broker_enabled: parse_bool(&get_env("BROKER_ENABLED", "true")),
            broker_url: get_env("BROKER_URL", "redis://127.0.0.1:6379"),
            broker_connect_timeout_ms: get_env("BROKER_CONNECT_TIMEOUT_MS", "5000")
                .parse()
                .unwrap_or(5000),
            provisioning_subject: get_env("PROVISIONING_SUBJECT", "provisioning.tasks"),
            default_max_retries: parse_max_retries(&get_env("DEFAULT_MAX_RETRIES", "5")),
            outbox_sweep_secs: get_env("OUTBOX_SWEEP_SECS", "30").parse().unwrap_or(30),
            outbox_batch_size: get_env("OUTBOX_BATCH_SIZE", "50").parse().unwrap_or(50),
            use_local_urls: parse_bool(&get_env("PROVISIONING_USE_LOCAL_URLS", "false")),
            production_domain: get_env("PROVISIONING_PRODUCTION_DOMAIN", "farutech.app"),
            local_base_port: get_env("PROVISIONING_LOCAL_BASE_PORT", "5100")
                .parse()
                .unwrap_or(5100),
            application_ports: parse_ports(&get_env("PROVISIONING_APPLICATION_PORTS", "")),
        }
    }

    pub fn provisioning_settings(&self) -> ProvisioningSettings {
        ProvisioningSettings {
            subject: self.provisioning_subject.clone(),
            default_max_retries: self.default_max_retries,
            use_local_urls: self.use_local_urls,
            production_domain: self.production_domain.clone(),
            local_base_port: self.local_base_port,
            application_ports: self.application_ports.clone(),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// At least one attempt; unparsable values fall back to 5
fn parse_max_retries(value: &str) -> i32 {
    let retries = value.trim().parse().unwrap_or(5);
    if retries < 1 {
        tracing::warn!("DEFAULT_MAX_RETRIES={} raised to 1", retries);
        return 1;
    }
    retries
}

/// `ERP=5101,POS=5102`; malformed entries are skipped
fn parse_ports(value: &str) -> HashMap<String, u16> {
    value
        .split(',')
        .filter_map(|pair| {
            let (product, port) = pair.split_once('=')?;
            let product = product.trim();
            if product.is_empty() {
                return None;
            }
            match port.trim().parse() {
                Ok(port) => Some((product.to_string(), port)),
                Err(_) => {
                    tracing::warn!("Ignoring application port entry '{}'", pair.trim());
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ports() {
        let ports = parse_ports("ERP=5101, POS = 5102,bad,WMS=notaport,=5000");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports["ERP"], 5101);
        assert_eq!(ports["POS"], 5102);
        assert!(parse_ports("").is_empty());
    }

    #[test]
    fn test_max_retries_clamped_to_one() {
        assert_eq!(parse_max_retries("-3"), 1);
        assert_eq!(parse_max_retries("0"), 1);
        assert_eq!(parse_max_retries(" 8 "), 8);
        assert_eq!(parse_max_retries("many"), 5);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" 1 "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
