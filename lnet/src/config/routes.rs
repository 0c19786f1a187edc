// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The `routes` string.
//!
//! ```text
//! routes := route [(';' | '\n') route]...
//! route  := net [hops] gateway [gateway]...
//! gateway:= nid [':' priority]
//! ```

use super::networks::{split_top_level, strip_comments};
use crate::errors::ConfigError;
use crate::nid::{NetId, Nid};
use std::str::FromStr;

/// Hop count when none is given
pub const DEFAULT_HOPS: u32 = 1;
/// Largest hop count accepted
pub const MAX_HOPS: u32 = 255;

/// One parsed route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub net: NetId,
    pub hops: u32,
    /// Gateways and their priorities
    pub gateways: Vec<(Nid, u32)>,
}

fn parse_route(route: &str) -> Result<RouteSpec, ConfigError> {
    let bad = || ConfigError::Route(route.trim().to_string());
    let mut words = route.split_whitespace();
    let net = NetId::from_str(words.next().ok_or_else(bad)?).map_err(|_| bad())?;
    let mut words = words.peekable();
    let hops = match words.peek() {
        Some(word) if word.chars().all(|c| c.is_ascii_digit()) => {
            let hops = word.parse::<u32>().map_err(|_| bad())?;
            words.next();
            hops
        }
        _ => DEFAULT_HOPS,
    };
    if !(1..=MAX_HOPS).contains(&hops) {
        return Err(bad());
    }
    let mut gateways = vec![];
    for word in words {
        let (nid, priority) = match word.rsplit_once(':') {
            Some((nid, prio)) => (nid, prio.parse::<u32>().map_err(|_| bad())?),
            None => (word, 0),
        };
        let nid = Nid::from_str(nid).map_err(|_| bad())?;
        if nid.is_any() || nid.net() == net {
            return Err(bad());
        }
        gateways.push((nid, priority));
    }
    if gateways.is_empty() {
        return Err(bad());
    }
    Ok(RouteSpec { net, hops, gateways })
}

/// Parse a `routes` string into route entries.
///
/// # Errors
///
/// Fails on the first malformed entry.
pub fn parse_route_specs(routes: &str) -> Result<Vec<RouteSpec>, ConfigError> {
    let text = strip_comments(routes);
    split_top_level(&text, &[';', '\n'])
        .into_iter()
        .filter(|route| !route.trim().is_empty())
        .map(parse_route)
        .collect()
}
