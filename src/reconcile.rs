//! Configuration reconciliation between declared and daemon-observed maps.
//!
//! The daemon fills some configuration keys on the user's behalf. Which
//! keys those are depends on the resource class (and, for storage pools,
//! the driver); the tables below drive diff suppression, change detection
//! and merging so that such fills never show up as drift.

use crate::daemon::StringMap;

/// Key suffix used by the host to report a change in map length.
pub const MAP_LENGTH_SENTINEL: &str = "%";

/// Prefix under which instance limits live in the daemon configuration.
pub const LIMITS_PREFIX: &str = "limits.";

/// Configuration prefixes reflected back into an instance's `config`.
pub const INSTANCE_CONFIG_PREFIXES: [&str; 6] = [
    "boot.",
    "environment.",
    "raw.",
    "linux.",
    "security.",
    "user.",
];

const NO_KEYS: &[&str] = &[];
const NETWORK_KEYS: &[&str] = &["ipv4.address", "ipv4.nat", "ipv6.address", "ipv6.nat"];
const DIR_POOL_KEYS: &[&str] = &["source"];
const ZFS_POOL_KEYS: &[&str] = &["source", "size", "zfs.pool_name"];
const LVM_POOL_KEYS: &[&str] = &["source", "size", "lvm.vg_name", "lvm.thinpool_name"];
const PROJECT_KEYS: &[&str] = &[
    "features.images",
    "features.profiles",
    "features.storage.volumes",
    "features.storage.buckets",
];

/// Storage pool driver used to pick computed keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StorageDriver {
    /// Plain directory backend.
    Dir,
    /// ZFS backend.
    Zfs,
    /// LVM backend.
    Lvm,
    /// Ceph RBD backend.
    Ceph,
    /// CephFS backend.
    CephFs,
    /// Ceph object backend.
    CephObject,
    /// Any driver without a computed-key table.
    Other(String),
}

impl StorageDriver {
    /// Maps a daemon driver name onto a [`StorageDriver`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "dir" => Self::Dir,
            "zfs" => Self::Zfs,
            "lvm" => Self::Lvm,
            "ceph" => Self::Ceph,
            "cephfs" => Self::CephFs,
            "cephobject" => Self::CephObject,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Resource class whose computed keys apply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceClass {
    /// Instances rely on prefix filtering instead of computed keys.
    Instance,
    /// Managed networks.
    Network,
    /// Storage pools, keyed by driver.
    StoragePool(StorageDriver),
    /// Projects.
    Project,
}

impl ResourceClass {
    /// Keys the daemon may populate when the user leaves them empty.
    #[must_use]
    pub const fn computed_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Instance => NO_KEYS,
            Self::Network => NETWORK_KEYS,
            Self::StoragePool(driver) => match driver {
                StorageDriver::Dir => DIR_POOL_KEYS,
                StorageDriver::Zfs => ZFS_POOL_KEYS,
                StorageDriver::Lvm => LVM_POOL_KEYS,
                StorageDriver::Ceph
                | StorageDriver::CephFs
                | StorageDriver::CephObject
                | StorageDriver::Other(_) => NO_KEYS,
            },
            Self::Project => PROJECT_KEYS,
        }
    }

    /// Returns `true` when `key` is computed for this class.
    #[must_use]
    pub fn is_computed(&self, key: &str) -> bool {
        self.computed_keys().contains(&key)
    }
}

fn is_map_length_key(key: &str) -> bool {
    key == MAP_LENGTH_SENTINEL || key.ends_with(".%")
}

/// Decides whether a proposed change to `key` from `old` to `new` should be
/// hidden from the plan.
#[must_use]
pub fn suppress_diff(class: &ResourceClass, key: &str, old: &str, new: &str) -> bool {
    if is_map_length_key(key) {
        return true;
    }
    let leaf = key.strip_prefix("config.").unwrap_or(key);
    new.is_empty() && (old.is_empty() || class.is_computed(leaf))
}

/// Returns `true` when `declared` and `observed` disagree on anything the
/// user controls.
#[must_use]
pub fn has_changed(class: &ResourceClass, declared: &StringMap, observed: &StringMap) -> bool {
    let declared_differs = declared
        .iter()
        .any(|(key, value)| observed.get(key) != Some(value));
    let unexpected_observed = observed
        .keys()
        .any(|key| !declared.contains_key(key) && !class.is_computed(key));
    declared_differs || unexpected_observed
}

/// Produces the map to submit: declared values plus observed computed values
/// the user left unset.
#[must_use]
pub fn merge_for_apply(class: &ResourceClass, declared: &StringMap, observed: &StringMap) -> StringMap {
    let mut merged = declared.clone();
    for (key, value) in observed {
        if !declared.contains_key(key) && class.is_computed(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Observed instance configuration split into reflected buckets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionedConfig {
    /// Keys under a recognised prefix.
    pub config: StringMap,
    /// `limits.*` keys with the prefix stripped.
    pub limits: StringMap,
}

/// Splits daemon-reported instance configuration into `config` and
/// `limits`, dropping keys outside the recognised prefixes.
#[must_use]
pub fn partition_instance_config(observed: &StringMap) -> PartitionedConfig {
    let mut partitioned = PartitionedConfig::default();
    for (key, value) in observed {
        if let Some(limit) = key.strip_prefix(LIMITS_PREFIX) {
            partitioned.limits.insert(limit.to_owned(), value.clone());
        } else if INSTANCE_CONFIG_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
        {
            partitioned.config.insert(key.clone(), value.clone());
        }
    }
    partitioned
}

/// Joins declared `config` and `limits` into the daemon's flat form.
#[must_use]
pub fn expand_instance_config(config: &StringMap, limits: &StringMap) -> StringMap {
    let mut expanded = config.clone();
    for (key, value) in limits {
        expanded.insert(format!("{LIMITS_PREFIX}{key}"), value.clone());
    }
    expanded
}
