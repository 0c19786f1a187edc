// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Module that implements Display for network objects

use crate::net::NetState;
use crate::ni::{NI_STATUS_DOWN, NI_STATUS_UP, Ni, NiRegistry};
use crate::peer::Peer;
use crate::portal::Portal;
use crate::route::{Gateway, Route, RouteInfo, RouteTable};
use std::fmt::{Display, Formatter};

const LINE_WIDTH: usize = 81;

pub struct Heading(pub String);
impl Display for Heading {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let len = LINE_WIDTH.saturating_sub(self.0.len() + 2) / 2;
        write!(f, " {0:─<width$}", "─", width = len)?;
        write!(f, " {} ", self.0)?;
        writeln!(f, " {0:─<width$}", "─", width = len)
    }
}
pub fn line(f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, " {0:─<width$}", "─", width = LINE_WIDTH)
}

fn status_str(status: u32) -> &'static str {
    match status {
        NI_STATUS_UP => "up",
        NI_STATUS_DOWN => "down",
        _ => "?",
    }
}

impl Display for Ni {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<24} {:<4} refs {:<3} tx {}/{} rtr {}",
            self.nid.to_string(),
            status_str(self.status()),
            self.refs.big(),
            self.peertxcredits,
            self.maxtxcredits,
            self.peerrtrcredits
        )?;
        if let Some(timeout) = self.peertimeout {
            write!(f, " timeout {timeout}s")?;
        }
        if !self.interfaces.is_empty() {
            write!(f, " ifaces {}", self.interfaces.join(","))?;
        }
        if let Some(cpts) = &self.cpts {
            write!(f, " cpts {cpts:?}")?;
        }
        Ok(())
    }
}

impl Display for NiRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Heading(format!("Interfaces ({})", self.len())).fmt(f)?;
        for ni in self.iter() {
            writeln!(f, "  {ni}")?;
        }
        if self.nzombie > 0 {
            writeln!(f, "  {} interface(s) shutting down", self.nzombie)?;
        }
        Ok(())
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<24} {:<4} via {} txcr {} rtrcr {} sent {} recv {}",
            self.nid.to_string(),
            if self.alive { "up" } else { "down" },
            self.ni.nid,
            self.txcredits,
            self.rtrcredits,
            self.sent,
            self.received
        )?;
        if let Some(last) = self.last_alive {
            write!(f, " heard {}s ago", last.elapsed().as_secs())?;
        }
        Ok(())
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<8} hops {:<3} gw {} prio {}",
            self.net.to_string(),
            self.hops,
            self.gateway,
            self.priority
        )
    }
}

impl Display for RouteInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.route, if self.alive { "up" } else { "down" })
    }
}

impl Display for Gateway {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<24} {:<4} routes {}",
            self.nid.to_string(),
            if self.alive { "up" } else { "down" },
            self.routes
        )?;
        for (nid, status) in &self.nis {
            write!(f, " {nid}:{}", status_str(*status))?;
        }
        Ok(())
    }
}

impl Display for RouteTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Heading(format!("Routes ({}) version {}", self.len(), self.version())).fmt(f)?;
        for route in self.iter() {
            writeln!(f, "  {route}")?;
        }
        for gw in self.gateways() {
            writeln!(f, "  gateway {gw}")?;
        }
        Ok(())
    }
}

impl Display for Portal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "portal {:<3} {:?}", self.index(), self.options())?;
        let active = self.active();
        if !active.is_empty() {
            write!(f, " active {active:?}")?;
        }
        let delayed = self.delayed();
        if delayed > 0 {
            write!(f, " delayed {delayed}")?;
        }
        Ok(())
    }
}

/// Everything about a running instance, for diagnostics
pub struct NetSummary<'a>(pub &'a NetState);

impl Display for NetSummary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.0;
        writeln!(
            f,
            " pid {:#x} partitions {} routing {}",
            state.pid(),
            state.cpts(),
            state.get_routing()
        )?;
        // the default lock is taken after partition locks: render it first, alone
        let shared = {
            let shared = state.net.lock_default();
            format!("{}{}", shared.ni, shared.routes)
        };
        f.write_str(&shared)?;

        let mut peers = vec![];
        state.net.for_each(|cpt, part| {
            peers.extend(part.peers.iter().map(|peer| format!("  [{cpt}] {peer}")));
        });
        Heading(format!("Peers ({})", peers.len())).fmt(f)?;
        for peer in peers {
            writeln!(f, "{peer}")?;
        }

        Heading("Portals".to_string()).fmt(f)?;
        for ptl in state.portals.iter() {
            if !ptl.options().is_empty() || !ptl.active().is_empty() || ptl.delayed() > 0 {
                writeln!(f, "  {ptl}")?;
            }
        }
        Heading("Counters".to_string()).fmt(f)?;
        writeln!(f, "{}", state.counters())?;
        line(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tests::running_state;

    #[test]
    fn summary_lists_everything() {
        let (state, _, ni) = running_state(2);
        state.set_lazy_portal(5).unwrap();
        let text = NetSummary(&state).to_string();
        assert!(text.contains("Interfaces (2)"));
        assert!(text.contains(&ni.nid.to_string()));
        assert!(text.contains("0@lo"));
        assert!(text.contains("Routes (0)"));
        assert!(text.contains("portal 5"));
        assert!(text.contains("LAZY"));
    }

    #[test]
    fn interface_line() {
        let (_, _, ni) = running_state(1);
        let text = ni.to_string();
        assert!(text.starts_with("10.0.0.1@tcp"));
        assert!(text.contains(" up "));
        assert!(text.contains("tx 8/"));
    }
}
