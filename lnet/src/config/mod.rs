// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! LNet configuration.
//!
//! The configuration is a plain set of options, mostly strings handed in by whatever
//! loads them (module parameters, environment, YAML). The strings are parsed here
//! into network, route and partition descriptions.

pub mod ip2nets;
pub mod networks;
pub mod routes;

use crate::errors::ConfigError;
use derive_builder::Builder;
use std::fmt::Display;
use strum::{Display as StrumDisplay, EnumString};

pub use ip2nets::{ip2nets_to_networks, local_ipv4s};
pub use networks::{NetSpec, parse_networks};
pub use routes::{RouteSpec, parse_route_specs};

/// Which incoming connections the acceptor takes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, StrumDisplay)]
pub enum AcceptMode {
    /// No acceptor
    #[strum(serialize = "none")]
    Disabled,
    /// Only connections from privileged ports
    #[default]
    #[strum(serialize = "secure")]
    Secure,
    /// Any connection
    #[strum(serialize = "all")]
    All,
}

impl AcceptMode {
    /// Parse the textual mode
    ///
    /// # Errors
    ///
    /// Fails on anything but `none`, `secure` and `all`.
    pub fn parse(mode: &str) -> Result<Self, ConfigError> {
        mode.trim()
            .parse()
            .map_err(|_| ConfigError::AcceptMode(mode.to_string()))
    }
}

/// Default port of the acceptor
pub const ACCEPT_PORT: u16 = 988;

/// Options of an LNet instance. N.B. we derive a builder type `LNetConfigBuilder`;
/// every field not set on the builder takes its value from [`LNetConfig::default`].
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct LNetConfig {
    /// Networks to bring up, e.g. `"tcp0(eth0), o2ib"`
    #[builder(setter(into, strip_option))]
    pub networks: Option<String>,

    /// Network selection by local address, exclusive with `networks`
    #[builder(setter(into, strip_option))]
    pub ip2nets: Option<String>,

    /// Static routes, e.g. `"o2ib 2 192.168.0.1@tcp"`
    #[builder(setter(into, strip_option))]
    pub routes: Option<String>,

    /// Userspace server: the caller supplies the pid and must be root
    pub server_mode: bool,

    /// Number of CPU partitions
    #[builder(setter(strip_option))]
    pub cpu_npartitions: Option<usize>,

    /// Explicit partition layout, e.g. `"0[0,1] 1[2-3]"`
    #[builder(setter(into, strip_option))]
    pub cpu_pattern: Option<String>,

    pub accept: AcceptMode,
    pub accept_port: u16,
    pub accept_backlog: u32,

    /// Router buffer pools, per partition
    pub tiny_router_buffers: u32,
    pub small_router_buffers: u32,
    pub large_router_buffers: u32,

    /// Forward messages for other nodes even if no route names this node as gateway
    pub forwarding: bool,

    /// Seconds between gateway liveness checks, for live and dead gateways
    pub live_router_check_interval: u64,
    pub dead_router_check_interval: u64,
    /// Seconds after which a silent gateway is considered dead
    pub router_ping_timeout: u64,

    /// Report distance 0 for local nids
    pub local_nid_dist_zero: bool,

    /// Log levels applied at library init, e.g. `"default=info,ni=debug"`
    #[builder(setter(into, strip_option))]
    pub debug: Option<String>,
}

impl Default for LNetConfig {
    fn default() -> Self {
        Self {
            networks: None,
            ip2nets: None,
            routes: None,
            server_mode: false,
            cpu_npartitions: None,
            cpu_pattern: None,
            accept: AcceptMode::default(),
            accept_port: ACCEPT_PORT,
            accept_backlog: 127,
            tiny_router_buffers: 1024,
            small_router_buffers: 8192,
            large_router_buffers: 512,
            forwarding: false,
            live_router_check_interval: 60,
            dead_router_check_interval: 60,
            router_ping_timeout: 50,
            local_nid_dist_zero: true,
            debug: None,
        }
    }
}

impl LNetConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let (Some(Some(_)), Some(Some(_))) = (&self.networks, &self.ip2nets) {
            return Err(ConfigError::NetworksAndIp2Nets.to_string());
        }
        if let Some(Some(0)) = self.cpu_npartitions {
            return Err(ConfigError::Partitions("zero partitions".to_string()).to_string());
        }
        Ok(())
    }
}

impl LNetConfig {
    /// The networks to bring up, as a `networks` string.
    ///
    /// Without `networks` or `ip2nets`, every registered driver but loopback gets
    /// one network: `default_nets` is that list, comma-joined.
    ///
    /// # Errors
    ///
    /// Fails if both strings are set or if `ip2nets` matches no local address.
    pub fn resolve_networks(&self, default_nets: &str) -> Result<String, ConfigError> {
        match (&self.networks, &self.ip2nets) {
            (Some(_), Some(_)) => Err(ConfigError::NetworksAndIp2Nets),
            (Some(networks), None) => Ok(networks.clone()),
            (None, Some(ip2nets)) => ip2nets_to_networks(ip2nets, &local_ipv4s()),
            (None, None) => Ok(default_nets.to_string()),
        }
    }
}

impl Display for LNetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |opt: &Option<String>| opt.clone().unwrap_or_else(|| "-".to_string());
        writeln!(f, "networks: {}", show(&self.networks))?;
        writeln!(f, "ip2nets: {}", show(&self.ip2nets))?;
        writeln!(f, "routes: {}", show(&self.routes))?;
        writeln!(f, "server mode: {}", self.server_mode)?;
        writeln!(
            f,
            "partitions: {} pattern: {}",
            self.cpu_npartitions.map_or("-".to_string(), |n| n.to_string()),
            show(&self.cpu_pattern)
        )?;
        writeln!(
            f,
            "acceptor: {} port {} backlog {}",
            self.accept, self.accept_port, self.accept_backlog
        )?;
        writeln!(
            f,
            "router buffers: tiny {} small {} large {} forwarding {}",
            self.tiny_router_buffers,
            self.small_router_buffers,
            self.large_router_buffers,
            self.forwarding
        )?;
        write!(
            f,
            "router checker: live {}s dead {}s timeout {}s",
            self.live_router_check_interval,
            self.dead_router_check_interval,
            self.router_ping_timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = LNetConfigBuilder::default().build().unwrap();
        assert_eq!(cfg, LNetConfig::default());
        assert_eq!(cfg.accept_port, ACCEPT_PORT);
        assert!(cfg.local_nid_dist_zero);
        assert_eq!(cfg.resolve_networks("tcp").unwrap(), "tcp");
    }

    #[test]
    fn builder_rejects_both_network_strings() {
        let res = LNetConfigBuilder::default()
            .networks("tcp")
            .ip2nets("tcp 10.*.*.*")
            .build();
        assert!(res.is_err());
        let cfg = LNetConfigBuilder::default()
            .networks("tcp1(eth0)")
            .routes("o2ib 10.0.0.1@tcp1")
            .server_mode(true)
            .build()
            .unwrap();
        assert_eq!(cfg.resolve_networks("").unwrap(), "tcp1(eth0)");
        assert!(cfg.server_mode);
    }

    #[test]
    fn accept_modes() {
        assert_eq!(AcceptMode::parse("all").unwrap(), AcceptMode::All);
        assert_eq!(AcceptMode::parse(" none ").unwrap(), AcceptMode::Disabled);
        assert_eq!(AcceptMode::Secure.to_string(), "secure");
        assert!(AcceptMode::parse("some").is_err());
    }
}
