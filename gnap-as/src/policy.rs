//! Access policy: decides, per requested access descriptor, whether it is
//! pre-authorized for the requesting key, needs resource owner consent, or
//! is not grantable at all.

use crate::gnap::TokenAccess;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Policy configuration, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Catalog of pre-registered rights, keyed by reference string
    #[serde(default)]
    pub reference_rules: HashMap<String, AccessRule>,

    /// Handlers for object descriptors, keyed by `type` tag
    #[serde(default)]
    pub type_rules: HashMap<String, AccessRule>,

    /// Subject ID formats this server is willing to disclose
    #[serde(default)]
    pub sub_id_formats: Vec<String>,

    /// Subject assertion formats this server is willing to disclose
    #[serde(default)]
    pub assertion_formats: Vec<String>,
}

/// One configured right.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRule {
    /// Key fingerprints granted this right without interaction, e.g. a
    /// known resource server introspecting itself
    #[serde(default)]
    pub preauthorized_keys: HashSet<String>,
}

/// Three-way partition of a requested access set.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub authorized: Vec<TokenAccess>,
    pub pending: Vec<TokenAccess>,
    pub denied: Vec<TokenAccess>,
}

pub struct AccessPolicy {
    config: PolicyConfig,
}

impl AccessPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Partition `requested` for a client identified by `fingerprint`.
    /// Duplicate descriptors collapse; order within each bucket follows the
    /// request.
    pub fn partition(&self, requested: &[TokenAccess], fingerprint: Option<&str>) -> Partition {
        let mut partition = Partition::default();

        for access in requested {
            let bucket = match self.rule_for(access) {
                None => &mut partition.denied,
                Some(rule) => {
                    if fingerprint.is_some_and(|fp| rule.preauthorized_keys.contains(fp)) {
                        &mut partition.authorized
                    } else {
                        &mut partition.pending
                    }
                }
            };

            if !bucket.contains(access) {
                bucket.push(access.clone());
            }
        }

        partition
    }

    /// When a descriptor's key names both a catalog reference and an object
    /// type, the reference rule wins.
    fn rule_for(&self, access: &TokenAccess) -> Option<&AccessRule> {
        let key = access.rule_key();
        match self.config.reference_rules.get(key) {
            Some(rule) => Some(rule),
            None if !access.is_reference() => self.config.type_rules.get(key),
            None => None,
        }
    }

    pub fn sub_id_formats(&self) -> &[String] {
        &self.config.sub_id_formats
    }

    pub fn assertion_formats(&self) -> &[String] {
        &self.config.assertion_formats
    }
}
