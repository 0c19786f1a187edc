// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The `networks` string.
//!
//! ```text
//! networks := entry [(',' | '\n') entry]...
//! entry    := net ['(' iface [',' iface]... ')'] ['[' cpt [',' cpt]... ']']
//! net      := lnd-name [number]
//! ```
//!
//! Whitespace is ignored and `#` starts a comment running to the end of the line.

use crate::errors::ConfigError;
use crate::nid::NetId;
use std::str::FromStr;

/// One network to bring up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSpec {
    pub net: NetId,
    pub interfaces: Vec<String>,
    pub cpts: Option<Vec<usize>>,
}

pub(crate) fn strip_comments(input: &str) -> String {
    input
        .lines()
        .map(|line| line.split_once('#').map_or(line, |(keep, _)| keep))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split on `seps` outside of `()` and `[]`
pub(crate) fn split_top_level<'a>(input: &'a str, seps: &[char]) -> Vec<&'a str> {
    let mut out = vec![];
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if depth == 0 && seps.contains(&c) => {
                out.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&input[start..]);
    out
}

fn delimited<'a>(s: &'a str, open: char, close: char) -> Result<Option<(&'a str, &'a str)>, ()> {
    let Some(rest) = s.strip_prefix(open) else {
        return Ok(None);
    };
    let end = rest.find(close).ok_or(())?;
    Ok(Some((&rest[..end], &rest[end + close.len_utf8()..])))
}

fn parse_entry(entry: &str) -> Result<NetSpec, ConfigError> {
    let compact: String = entry.chars().filter(|c| !c.is_whitespace()).collect();
    let name_end = compact.find(['(', '[']).unwrap_or(compact.len());
    let net = NetId::from_str(&compact[..name_end])?;
    let mut rest = &compact[name_end..];

    let mut interfaces = vec![];
    if let Some((list, after)) =
        delimited(rest, '(', ')').map_err(|()| ConfigError::Interfaces(entry.to_string()))?
    {
        for iface in list.split(',') {
            if iface.is_empty() {
                return Err(ConfigError::Interfaces(entry.to_string()));
            }
            interfaces.push(iface.to_string());
        }
        rest = after;
    }

    let mut cpts = None;
    if let Some((list, after)) =
        delimited(rest, '[', ']').map_err(|()| ConfigError::CptList(entry.to_string()))?
    {
        let parsed = list
            .split(',')
            .map(str::parse::<usize>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::CptList(entry.to_string()))?;
        cpts = Some(parsed);
        rest = after;
    }

    if !rest.is_empty() {
        return Err(ConfigError::Network(entry.to_string()));
    }
    Ok(NetSpec {
        net,
        interfaces,
        cpts,
    })
}

/// Parse a `networks` string.
///
/// # Errors
///
/// Fails on unknown drivers, malformed lists and networks given more than once.
pub fn parse_networks(networks: &str) -> Result<Vec<NetSpec>, ConfigError> {
    let text = strip_comments(networks);
    let mut specs: Vec<NetSpec> = vec![];
    for entry in split_top_level(&text, &[',', '\n']) {
        if entry.trim().is_empty() {
            continue;
        }
        let spec = parse_entry(entry)?;
        if specs.iter().any(|s| s.net == spec.net) {
            return Err(ConfigError::DuplicateNetwork(spec.net.to_string()));
        }
        specs.push(spec);
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nid::LndType;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_grammar() {
        let specs = parse_networks("tcp0(eth0, eth1)[0,1], o2ib3 # infiniband\n lo").unwrap();
        assert_eq!(
            specs,
            vec![
                NetSpec {
                    net: NetId::new(LndType::Sock, 0),
                    interfaces: vec!["eth0".to_string(), "eth1".to_string()],
                    cpts: Some(vec![0, 1]),
                },
                NetSpec {
                    net: NetId::new(LndType::O2ib, 3),
                    interfaces: vec![],
                    cpts: None,
                },
                NetSpec {
                    net: NetId::LO,
                    interfaces: vec![],
                    cpts: None,
                },
            ]
        );
    }

    #[test]
    fn empty_is_fine() {
        assert_eq!(parse_networks(" ,\n# nothing").unwrap(), vec![]);
    }

    #[test]
    fn errors() {
        assert_eq!(
            parse_networks("tcp, tcp0"),
            Err(ConfigError::DuplicateNetwork("tcp".to_string()))
        );
        assert!(matches!(parse_networks("eth0"), Err(ConfigError::Network(_))));
        assert!(matches!(parse_networks("tcp(eth0"), Err(ConfigError::Interfaces(_))));
        assert!(matches!(parse_networks("tcp(,)"), Err(ConfigError::Interfaces(_))));
        assert!(matches!(parse_networks("tcp[a]"), Err(ConfigError::CptList(_))));
        assert!(matches!(parse_networks("tcp(eth0)x"), Err(ConfigError::Network(_))));
    }
}
