// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-wide logging control.

use ordermap::{OrderMap, OrderSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{info, warn};
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

use crate::targets::LNET_TRACE_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

/// Errors when applying a logging configuration string
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("malformed item '{0}': expected tag=level")]
    Syntax(String),
    #[error("invalid level '{0}'")]
    Level(String),
    #[error("unknown tag '{0}'")]
    UnknownTag(String),
}

/// Configuration of a single log target
#[derive(Debug, Clone)]
pub struct TargetCfg {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: Vec<&'static str>,
}

impl TargetCfg {
    /// The target as seen by `tracing` (usually a module path)
    #[must_use]
    pub fn target(&self) -> &'static str {
        self.target
    }
    /// The short name of the target
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// The current level
    #[must_use]
    pub fn level(&self) -> LevelFilter {
        self.level
    }
    /// The tags of this target, its name included
    #[must_use]
    pub fn tags(&self) -> &[&'static str] {
        &self.tags
    }
}

#[derive(Debug)]
pub(crate) struct TargetDb {
    pub(crate) default: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetCfg>,
    pub(crate) tags: OrderMap<&'static str, OrderSet<&'static str>>,
}

impl TargetDb {
    fn from_registry(default: LevelFilter) -> Self {
        let mut db = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for declared in LNET_TRACE_TARGETS {
            db.add(declared.target, declared.name, declared.level, declared.tags);
        }
        db
    }

    fn add(
        &mut self,
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) {
        let mut all_tags: Vec<&'static str> = tags.to_vec();
        if !all_tags.contains(&name) {
            all_tags.push(name);
        }
        for tag in &all_tags {
            self.tags.entry(*tag).or_default().insert(target);
        }
        let cfg = TargetCfg {
            target,
            name,
            level,
            tags: all_tags,
        };
        if self.targets.insert(target, cfg).is_some() {
            warn!("log target {target} declared more than once");
        }
    }

    /// Apply `level` to every target carrying `tag`; returns how many changed.
    fn set_tag(&mut self, tag: &str, level: LevelFilter) -> Option<usize> {
        let members = self.tags.get(tag)?;
        let mut changed = 0;
        for target in members {
            if let Some(cfg) = self.targets.get_mut(target)
                && cfg.level != level
            {
                cfg.level = level;
                changed += 1;
            }
        }
        Some(changed)
    }

    fn filter(&self) -> EnvFilter {
        self.targets
            .values()
            .filter_map(|cfg| format!("{}={}", cfg.target, cfg.level).parse::<Directive>().ok())
            .fold(EnvFilter::new(self.default.to_string()), EnvFilter::add_directive)
    }

    pub(crate) fn config_string(&self) -> String {
        let mut out = format!("default={}", self.default);
        for cfg in self.targets.values() {
            out.push_str(&format!(",{}={}", cfg.name, cfg.level));
        }
        out
    }
}

/// Runtime handle over the log filter of the process
#[derive(Debug)]
pub struct TracingControl {
    db: Mutex<TargetDb>,
    handle: reload::Handle<EnvFilter, Registry>,
}

static TRACE_CTL: OnceLock<TracingControl> = OnceLock::new();

/// The process-wide [`TracingControl`], installing the subscriber on first use.
///
/// If another global subscriber was installed first, the control still works on its
/// own filter but nothing it changes is visible in that subscriber.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACE_CTL.get_or_init(TracingControl::install)
}

impl TracingControl {
    fn install() -> Self {
        let db = TargetDb::from_registry(LevelFilter::INFO);
        let (filter, handle) = reload::Layer::new(db.filter());
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true);
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
            .is_ok();
        let ctl = Self {
            db: Mutex::new(db),
            handle,
        };
        if !installed {
            warn!("a global subscriber already exists: log levels are not controlled here");
        }
        ctl
    }

    fn db(&self) -> MutexGuard<'_, TargetDb> {
        self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reload(&self, db: &TargetDb) {
        // fails only when the subscriber has been dropped
        let _ = self.handle.reload(db.filter());
    }

    /// Make sure the control, and with it the subscriber, is set up.
    pub fn init() {
        get_trace_ctl();
    }

    /// Set the level of every target tagged `tag`. Returns how many targets changed.
    ///
    /// # Errors
    ///
    /// Fails if no target carries `tag`.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> Result<usize, TraceCtlError> {
        let mut db = self.db();
        let changed = db
            .set_tag(tag, level)
            .ok_or_else(|| TraceCtlError::UnknownTag(tag.to_string()))?;
        if changed > 0 {
            self.reload(&db);
            info!("log level of '{tag}' set to {level} ({changed} targets)");
        }
        Ok(changed)
    }

    /// Set the level used for targets that were not declared.
    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.db();
        if db.default != level {
            db.default = level;
            self.reload(&db);
        }
    }

    /// The level used for targets that were not declared
    pub fn default_level(&self) -> LevelFilter {
        self.db().default
    }

    /// Set the level of every declared target.
    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.db();
        for cfg in db.targets.values_mut() {
            cfg.level = level;
        }
        self.reload(&db);
    }

    fn parse(input: &str) -> Result<Vec<(String, LevelFilter)>, TraceCtlError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let (tag, level) = item
                    .split_once('=')
                    .ok_or_else(|| TraceCtlError::Syntax(item.to_string()))?;
                let level = LevelFilter::from_str(level.trim())
                    .map_err(|_| TraceCtlError::Level(level.trim().to_string()))?;
                Ok((tag.trim().to_string(), level))
            })
            .collect()
    }

    /// Apply a string of comma-separated `tag=level` items.
    ///
    /// `default=<level>` sets the fallback level and `all=<level>` every target; the
    /// remaining items are applied in order, so `all=warn,ni=debug` works as expected.
    /// Nothing is applied if the string does not parse.
    ///
    /// # Errors
    ///
    /// Fails on malformed items, unknown levels and unknown tags.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let items = Self::parse(input)?;
        for (tag, level) in &items {
            match tag.as_str() {
                "default" => self.set_default_level(*level),
                "all" => self.set_level_all(*level),
                _ => {}
            }
        }
        for (tag, level) in items {
            if tag != "default" && tag != "all" {
                self.set_tag_level(&tag, level)?;
            }
        }
        Ok(())
    }

    /// Configuration of a target, by target path
    pub fn target(&self, target: &str) -> Option<TargetCfg> {
        self.db().targets.get(target).cloned()
    }

    /// Configuration of every target carrying `tag`
    pub fn targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        let db = self.db();
        db.tags
            .get(tag)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|target| db.targets.get(target).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every known tag
    pub fn tags(&self) -> Vec<&'static str> {
        self.db().tags.keys().copied().collect()
    }

    /// A configuration string that reproduces the current levels
    pub fn as_config_string(&self) -> String {
        self.db().config_string()
    }

    /// Log the configuration, one line per target.
    pub fn dump(&self) {
        let db = self.db();
        info!("{}", crate::display::ByTarget(&db));
    }

    /// Log the configuration grouped by tag.
    pub fn dump_by_tag(&self) {
        let db = self.db();
        info!("{}", crate::display::ByTag(&db));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{custom_target, trace_target};
    use serial_test::serial;

    const GROUP: &str = "test-group";
    trace_target!("control-tests", LevelFilter::INFO, &[]);
    custom_target!("test-alpha", LevelFilter::DEBUG, &[GROUP]);
    custom_target!("test-beta", LevelFilter::WARN, &[GROUP]);
    custom_target!("test-gamma", LevelFilter::INFO, &[]);

    #[test]
    #[serial]
    fn link_time_targets_are_loaded() {
        let ctl = get_trace_ctl();
        assert!(ctl.target(module_path!()).is_some());
        assert!(ctl.target("lnet_tracectl::control").is_some());
        assert!(ctl.target("test-alpha").is_some());
        let gamma = ctl.target("test-gamma").unwrap();
        assert_eq!(gamma.tags(), &["test-gamma"]);
        assert!(ctl.tags().contains(&GROUP));
    }

    #[test]
    #[serial]
    fn tag_level_applies_to_members() {
        let ctl = get_trace_ctl();
        ctl.set_tag_level(GROUP, LevelFilter::TRACE).unwrap();
        ctl.set_tag_level(GROUP, LevelFilter::OFF).unwrap();
        let members = ctl.targets_by_tag(GROUP);
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|cfg| cfg.level() == LevelFilter::OFF));
        assert_eq!(ctl.set_tag_level(GROUP, LevelFilter::OFF), Ok(0));
        assert_eq!(
            ctl.set_tag_level("no-such-tag", LevelFilter::OFF),
            Err(TraceCtlError::UnknownTag("no-such-tag".to_string()))
        );
    }

    #[test]
    #[serial]
    fn config_string() {
        let ctl = get_trace_ctl();
        ctl.setup_from_string("default=error, all=warn, test-gamma=debug")
            .unwrap();
        assert_eq!(ctl.default_level(), LevelFilter::ERROR);
        assert_eq!(ctl.target("test-alpha").unwrap().level(), LevelFilter::WARN);
        assert_eq!(ctl.target("test-gamma").unwrap().level(), LevelFilter::DEBUG);
        assert!(ctl.as_config_string().starts_with("default=error"));

        assert!(matches!(
            ctl.setup_from_string("test-gamma=loud"),
            Err(TraceCtlError::Level(_))
        ));
        assert!(matches!(
            ctl.setup_from_string("test-gamma=info, verbose"),
            Err(TraceCtlError::Syntax(_))
        ));
        // nothing applied when parsing fails
        assert_eq!(ctl.target("test-gamma").unwrap().level(), LevelFilter::DEBUG);
        ctl.set_default_level(LevelFilter::INFO);
        ctl.dump();
        ctl.dump_by_tag();
    }
}
