// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The `ip2nets` string: choose networks by matching local IPv4 addresses.
//!
//! ```text
//! ip2nets := rule [(';' | '\n') rule]...
//! rule    := net-entry ip-range [ip-range]...
//! ip-range:= octet '.' octet '.' octet '.' octet
//! octet   := '*' | n | a '-' b | '[' (n | a '-' b) [',' ...]... ']'
//! ```

use super::networks::{parse_networks, split_top_level, strip_comments};
use crate::errors::ConfigError;
use crate::nid::NetId;
use std::net::Ipv4Addr;
use tracing::debug;

tracectl::trace_target!("ip2nets", tracectl::LevelFilter::INFO, &["lnet"]);

#[derive(Debug, Clone, PartialEq, Eq)]
struct OctetRange(Vec<(u8, u8)>);

impl OctetRange {
    fn parse(text: &str) -> Option<Self> {
        if text == "*" {
            return Some(OctetRange(vec![(0, 255)]));
        }
        let list = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .unwrap_or(text);
        let mut ranges = vec![];
        for item in list.split(',') {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
                None => {
                    let n = item.parse().ok()?;
                    (n, n)
                }
            };
            if lo > hi {
                return None;
            }
            ranges.push((lo, hi));
        }
        Some(OctetRange(ranges))
    }

    fn contains(&self, octet: u8) -> bool {
        self.0.iter().any(|&(lo, hi)| (lo..=hi).contains(&octet))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IpRange([OctetRange; 4]);

impl IpRange {
    fn parse(text: &str) -> Option<Self> {
        let octets: Vec<_> = text.split('.').map(OctetRange::parse).collect::<Option<_>>()?;
        let octets: [OctetRange; 4] = octets.try_into().ok()?;
        Some(IpRange(octets))
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        self.0
            .iter()
            .zip(ip.octets())
            .all(|(range, octet)| range.contains(octet))
    }
}

struct Rule {
    entry: String,
    net: NetId,
    ranges: Vec<IpRange>,
}

fn parse_rule(rule: &str) -> Result<Rule, ConfigError> {
    let bad = || ConfigError::Ip2Nets(rule.trim().to_string());
    // the network entry may hold blanks inside its interface list
    let mut depth = 0i32;
    let split = rule
        .trim()
        .char_indices()
        .find(|&(_, c)| {
            match c {
                '(' | '[' => depth += 1,
                ')' | ']' => depth -= 1,
                _ => {}
            }
            depth == 0 && c.is_whitespace()
        })
        .map(|(i, _)| i)
        .ok_or_else(bad)?;
    let (entry, ranges) = rule.trim().split_at(split);
    let specs = parse_networks(entry).map_err(|_| bad())?;
    let [spec] = specs.as_slice() else {
        return Err(bad());
    };
    let ranges = ranges
        .split_whitespace()
        .map(IpRange::parse)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(bad)?;
    Ok(Rule {
        entry: entry.chars().filter(|c| !c.is_whitespace()).collect(),
        net: spec.net,
        ranges,
    })
}

/// Turn an `ip2nets` string into the `networks` string it selects for a host with the
/// given addresses. The first matching rule of each network wins.
///
/// # Errors
///
/// Fails on malformed rules, or if no rule matches.
pub fn ip2nets_to_networks(ip2nets: &str, local: &[Ipv4Addr]) -> Result<String, ConfigError> {
    let text = strip_comments(ip2nets);
    let mut chosen: Vec<Rule> = vec![];
    for rule in split_top_level(&text, &[';', '\n']) {
        if rule.trim().is_empty() {
            continue;
        }
        let rule = parse_rule(rule)?;
        if chosen.iter().any(|c| c.net == rule.net) {
            continue;
        }
        if let Some(ip) = local
            .iter()
            .find(|ip| rule.ranges.iter().any(|range| range.contains(**ip)))
        {
            debug!("ip2nets: {} selected by {ip}", rule.entry);
            chosen.push(rule);
        }
    }
    if chosen.is_empty() {
        return Err(ConfigError::Ip2NetsNoMatch);
    }
    Ok(chosen
        .into_iter()
        .map(|rule| rule.entry)
        .collect::<Vec<_>>()
        .join(","))
}

/// IPv4 addresses of the host interfaces that are up
#[must_use]
pub fn local_ipv4s() -> Vec<Ipv4Addr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(netdev::Interface::is_up)
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr()))
        .collect()
}
