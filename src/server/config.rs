//! Runtime configuration.
//!
//! [`Settings`] and [`GatewayConfig`] mirror the singleton rows in the
//! store; [`Limits`] collects the tunables that bound concurrency and
//! timeouts, defaulting to the crate-level constants.

use std::time::Duration;

use crate::error::{Error, Result};

/// Proxy settings, persisted as the singleton `settings` row.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Ingress listen address.
    pub listen_host: String,
    /// Ingress listen port.
    pub listen_port: u16,
    /// Port reserved for the admin HTTP collaborator.
    pub web_port: u16,
    /// Path of the JSON source-rule import/export file.
    pub config_file: String,
    /// Tunnel mode: egresses are upstream relays instead of local IPs.
    pub tunnel_mode: bool,
    pub debug_mode: bool,
    pub quiet_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".into(),
            listen_port: 8080,
            web_port: 8090,
            config_file: "source_ip_rules.json".into(),
            tunnel_mode: false,
            debug_mode: false,
            quiet_mode: false,
        }
    }
}

impl Settings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::invalid("listen_host cannot be empty"));
        }
        if self.listen_port == 0 {
            return Err(Error::invalid("listen_port cannot be zero"));
        }
        Ok(())
    }
}

/// Gateway-mode configuration, persisted as the singleton `gateway` row.
///
/// Only `enabled` and `transparent_port` drive behavior in this crate (the
/// Linux transparent listener); the rest is carried for the gateway
/// scaffolding collaborator.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub gateway_ip: String,
    pub subnet_cidr: String,
    pub transparent_port: u16,
    pub dns_port: u16,
    pub nat_interface: String,
    pub auto_configure: bool,
    pub dhcp_range_start: String,
    pub dhcp_range_end: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_ip: "192.168.100.1".into(),
            subnet_cidr: "192.168.100.0/24".into(),
            transparent_port: 8888,
            dns_port: 5353,
            nat_interface: String::new(),
            auto_configure: true,
            dhcp_range_start: "192.168.100.10".into(),
            dhcp_range_end: "192.168.100.100".into(),
        }
    }
}

/// Concurrency caps and deadlines.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_connections: usize,
    pub max_tasks: usize,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub sample_interval: Duration,
    pub sync_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections: crate::MAX_CONNECTIONS,
            max_tasks: crate::MAX_TASKS,
            handshake_timeout: crate::HANDSHAKE_TIMEOUT,
            dial_timeout: crate::DIAL_TIMEOUT,
            idle_timeout: crate::IDLE_TIMEOUT,
            reap_interval: crate::REAP_INTERVAL,
            sample_interval: crate::SAMPLE_INTERVAL,
            sync_interval: crate::STORE_SYNC_INTERVAL,
            monitor_interval: crate::MONITOR_INTERVAL,
        }
    }
}
