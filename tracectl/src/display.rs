// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tabular dumps of the logging configuration

use crate::control::{TargetCfg, TargetDb};
use std::fmt::{Display, Formatter, Result};

const WIDTH: usize = 40;

impl Display for TargetCfg {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{:>WIDTH$} | {:>6} | {}",
            self.target,
            self.level.to_string(),
            self.tags.join(",")
        )
    }
}

pub(crate) struct ByTarget<'a>(pub(crate) &'a TargetDb);

impl Display for ByTarget<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f)?;
        writeln!(f, "{:>WIDTH$} | {:>6} | TAGS", "TARGET", "LEVEL")?;
        for cfg in self.0.targets.values() {
            writeln!(f, "{cfg}")?;
        }
        write!(
            f,
            "{:>WIDTH$} | {:>6} | -",
            "(default)",
            self.0.default.to_string()
        )
    }
}

pub(crate) struct ByTag<'a>(pub(crate) &'a TargetDb);

impl Display for ByTag<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f)?;
        for (tag, members) in &self.0.tags {
            writeln!(f, "[{tag}]")?;
            for cfg in members.iter().filter_map(|t| self.0.targets.get(t)) {
                writeln!(f, "    {:<WIDTH$} {}", cfg.target, cfg.level)?;
            }
        }
        Ok(())
    }
}
