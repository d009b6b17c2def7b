//! Feature flags, fixed at startup.

use std::collections::{BTreeMap, HashMap};

pub const MULTI_ORGANIZATION: &str = "multi_organization";
pub const SECURITY_GROUPS: &str = "security_groups";
pub const DEVICES: &str = "devices";

const DEFAULTS: &[(&str, bool)] = &[
    (MULTI_ORGANIZATION, false),
    (SECURITY_GROUPS, false),
    (DEVICES, true),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown feature flag: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlags {
    flags: BTreeMap<&'static str, bool>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            flags: DEFAULTS.iter().copied().collect(),
        }
    }
}

impl FeatureFlags {
    /// Built-in defaults overridden by `overrides`; unknown names are skipped.
    pub fn from_config(overrides: &HashMap<String, bool>) -> Self {
        let mut flags = Self::default();
        for (name, enabled) in overrides {
            match flags.flags.get_mut(name.as_str()) {
                Some(slot) => *slot = *enabled,
                None => tracing::warn!(flag = %name, "ignoring unknown feature flag"),
            }
        }
        flags
    }

    pub fn get(&self, name: &str) -> Result<bool, FlagError> {
        self.flags
            .get(name)
            .copied()
            .ok_or_else(|| FlagError::Unknown(name.to_string()))
    }

    /// `false` for unknown flags.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).unwrap_or(false)
    }

    pub fn list(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.flags.iter().map(|(name, enabled)| (*name, *enabled))
    }
}
