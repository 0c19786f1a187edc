// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of log targets

use crate::LevelFilter;
use linkme::distributed_slice;

/// A log target declared somewhere in the linked crates
pub struct StaticTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl StaticTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[distributed_slice]
pub static LNET_TRACE_TARGETS: [StaticTarget];

#[doc(hidden)]
#[macro_export]
macro_rules! trace_target_imports {
    () => {
        use linkme::distributed_slice;
        use $crate::LevelFilter;
        use $crate::targets::{LNET_TRACE_TARGETS, StaticTarget};
    };
}

/// Declare the log target of the calling module, its short name, default level and tags.
///
/// The declaration lives in an anonymous const scope so that a crate may invoke the
/// macro once per module without the statics colliding.
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_imports!();

            #[distributed_slice(LNET_TRACE_TARGETS)]
            static TARGET: StaticTarget = StaticTarget::new(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a log target that is not a module path (`target: "..."` in the log macros).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_imports!();

            #[distributed_slice(LNET_TRACE_TARGETS)]
            static TARGET: StaticTarget = StaticTarget::new($target, $target, $level, $tags);
        };
    };
}
