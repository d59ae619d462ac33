//! Declared and reflected instance attributes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use ortho_config::toml;
use serde::{Deserialize, Serialize};

use super::InstanceError;
use crate::config::read_utf8_file;
use crate::daemon::{InstanceType, StringMap};
use crate::files::FilePayload;
use crate::reconcile::{INSTANCE_CONFIG_PREFIXES, LIMITS_PREFIX, ResourceClass, has_changed};

/// Profile injected when a declaration names none.
pub const DEFAULT_PROFILE: &str = "default";

/// Config key written for a declaration with `privileged` set.
pub const PRIVILEGED_KEY: &str = "security.privileged";

/// Instance kind as declared.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum InstanceKind {
    /// System container.
    Container,
    /// Virtual machine.
    VirtualMachine,
    /// Let the daemon pick.
    #[default]
    Unspecified,
}

impl InstanceKind {
    /// Returns the declared spelling; empty for [`Self::Unspecified`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
            Self::Unspecified => "",
        }
    }

    /// Maps the declared kind onto the wire kind.
    #[must_use]
    pub const fn wire_type(self) -> InstanceType {
        match self {
            Self::Container => InstanceType::Container,
            Self::VirtualMachine => InstanceType::VirtualMachine,
            Self::Unspecified => InstanceType::Any,
        }
    }

    /// Reflects a daemon-reported kind; older daemons report nothing and
    /// only run containers.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] for kinds this provider does not
    /// know.
    pub fn from_observed(value: &str) -> Result<Self, InstanceError> {
        if value.is_empty() {
            return Ok(Self::Container);
        }
        value.parse()
    }
}

impl FromStr for InstanceKind {
    type Err = InstanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "container" => Ok(Self::Container),
            "virtual-machine" => Ok(Self::VirtualMachine),
            "" | "unspecified" => Ok(Self::Unspecified),
            other => Err(InstanceError::Validation(format!(
                "unknown instance type '{other}': expected container or virtual-machine"
            ))),
        }
    }
}

impl TryFrom<String> for InstanceKind {
    type Error = InstanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceKind> for String {
    fn from(value: InstanceKind) -> Self {
        value.as_str().to_owned()
    }
}

/// Device types accepted in declarations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceType {
    /// Disk or mount.
    Disk,
    /// Network interface.
    Nic,
    /// Character device node.
    UnixChar,
    /// Block device node.
    UnixBlock,
    /// USB passthrough.
    Usb,
    /// GPU passthrough.
    Gpu,
    /// Masks an inherited device.
    None,
}

impl DeviceType {
    /// Returns the daemon spelling of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Nic => "nic",
            Self::UnixChar => "unix-char",
            Self::UnixBlock => "unix-block",
            Self::Usb => "usb",
            Self::Gpu => "gpu",
            Self::None => "none",
        }
    }
}

impl FromStr for DeviceType {
    type Err = InstanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "disk" => Ok(Self::Disk),
            "nic" => Ok(Self::Nic),
            "unix-char" => Ok(Self::UnixChar),
            "unix-block" => Ok(Self::UnixBlock),
            "usb" => Ok(Self::Usb),
            "gpu" => Ok(Self::Gpu),
            "none" => Ok(Self::None),
            other => Err(InstanceError::Validation(format!(
                "unknown device type '{other}': expected disk, nic, unix-char, unix-block, usb, gpu or none"
            ))),
        }
    }
}

impl TryFrom<String> for DeviceType {
    type Error = InstanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceType> for String {
    fn from(value: DeviceType) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named device attached to an instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Device {
    /// Device name, unique per instance.
    pub name: String,
    /// Device type.
    #[serde(rename = "type")]
    pub kind: DeviceType,
    /// Type-specific properties.
    #[serde(default)]
    pub properties: StringMap,
}

impl Device {
    /// Renders the daemon form: properties with `type` lifted in.
    #[must_use]
    pub fn to_wire(&self) -> StringMap {
        let mut wire = self.properties.clone();
        wire.insert(String::from("type"), self.kind.as_str().to_owned());
        wire
    }

    /// Builds a device from its daemon form.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] when the type is missing or not
    /// one of the supported types.
    pub fn from_wire(name: &str, wire: &StringMap) -> Result<Self, InstanceError> {
        let mut properties = wire.clone();
        let kind = properties
            .remove("type")
            .ok_or_else(|| InstanceError::Validation(format!("device '{name}' has no type")))?
            .parse()?;
        Ok(Self {
            name: name.to_owned(),
            kind,
            properties,
        })
    }
}

const fn default_true() -> bool {
    true
}

/// Declared and computed attributes of one instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "declared lifecycle toggles are user-facing booleans in the resource schema"
)]
pub struct InstanceResource {
    /// Instance name; immutable.
    pub name: String,
    /// Image reference, optionally `<remote>:<alias>`; immutable.
    #[serde(default)]
    pub image: String,
    /// Instance kind; immutable.
    #[serde(rename = "type", default)]
    pub kind: InstanceKind,
    /// Remote name; empty selects the provider default.
    #[serde(default)]
    pub remote: String,
    /// Cluster member; immutable.
    #[serde(default)]
    pub target: String,
    /// Project; immutable.
    #[serde(default)]
    pub project: String,
    /// Ordered profile names.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Devices.
    #[serde(default, rename = "device")]
    pub devices: Vec<Device>,
    /// Configuration outside `limits.*`.
    #[serde(default)]
    pub config: StringMap,
    /// Limits with the `limits.` prefix stripped.
    #[serde(default)]
    pub limits: StringMap,
    /// Destroy on stop; immutable.
    #[serde(default)]
    pub ephemeral: bool,
    /// Deprecated; applied on create, always reflected as `false`.
    #[serde(default)]
    pub privileged: bool,
    /// Start the instance after creating it.
    #[serde(default = "default_true")]
    pub start_on_create: bool,
    /// Wait for an IPv4 address after starting.
    #[serde(default = "default_true")]
    pub wait_for_network: bool,
    /// Files uploaded into the instance.
    #[serde(default, rename = "file")]
    pub files: Vec<FilePayload>,
    /// Runtime status; computed.
    #[serde(default)]
    pub status: String,
    /// Legacy alias of `ipv4_address`; computed.
    #[serde(default)]
    pub ip_address: String,
    /// Representative IPv4 address; computed.
    #[serde(default)]
    pub ipv4_address: String,
    /// Representative IPv6 address; computed.
    #[serde(default)]
    pub ipv6_address: String,
    /// Hardware address of the interface carrying `ipv4_address`; computed.
    #[serde(default)]
    pub mac_address: String,
}

impl Default for InstanceResource {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            kind: InstanceKind::Unspecified,
            remote: String::new(),
            target: String::new(),
            project: String::new(),
            profiles: Vec::new(),
            devices: Vec::new(),
            config: StringMap::new(),
            limits: StringMap::new(),
            ephemeral: false,
            privileged: false,
            start_on_create: true,
            wait_for_network: true,
            files: Vec::new(),
            status: String::new(),
            ip_address: String::new(),
            ipv4_address: String::new(),
            ipv6_address: String::new(),
            mac_address: String::new(),
        }
    }
}

impl InstanceResource {
    /// Reads a declaration from a TOML document on disk.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] when the file cannot be read or
    /// does not describe an instance.
    pub fn from_toml_file(path: &Utf8Path) -> Result<Self, InstanceError> {
        let contents =
            read_utf8_file(path).map_err(|err| InstanceError::Validation(err.to_string()))?;
        Self::from_toml_str(&contents)
    }

    /// Parses a declaration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] for malformed documents.
    pub fn from_toml_str(contents: &str) -> Result<Self, InstanceError> {
        toml::from_str(contents)
            .map_err(|err| InstanceError::Validation(format!("invalid declaration: {err}")))
    }

    /// Checks the declaration before any daemon call.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Validation`] for an empty name, a malformed
    /// image reference, `config` keys outside the reflected prefixes
    /// (`limits.*` included), duplicate device names, or an invalid file
    /// payload.
    pub fn validate(&self) -> Result<(), InstanceError> {
        if self.name.trim().is_empty() {
            return Err(InstanceError::Validation(String::from(
                "instance name must not be empty",
            )));
        }
        validate_image_reference(&self.image)?;
        for key in self.config.keys() {
            if key.starts_with(LIMITS_PREFIX) {
                return Err(InstanceError::Validation(format!(
                    "config key '{key}' belongs under limits without the '{LIMITS_PREFIX}' prefix"
                )));
            }
            if !INSTANCE_CONFIG_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
            {
                return Err(InstanceError::Validation(format!(
                    "config key '{key}' must start with one of {}",
                    INSTANCE_CONFIG_PREFIXES.join(", ")
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if !seen.insert(device.name.as_str()) {
                return Err(InstanceError::Validation(format!(
                    "device '{}' is declared more than once",
                    device.name
                )));
            }
        }
        for file in &self.files {
            file.validate()?;
        }
        Ok(())
    }

    /// Profiles submitted to the daemon: the declared list, or the
    /// `default` profile when none is declared.
    #[must_use]
    pub fn effective_profiles(&self) -> Vec<String> {
        if self.profiles.is_empty() {
            vec![DEFAULT_PROFILE.to_owned()]
        } else {
            self.profiles.clone()
        }
    }

    /// Config as written to the daemon: the declared keys plus
    /// `security.privileged=true` when `privileged` is set and the key is
    /// not declared explicitly.
    #[must_use]
    pub fn effective_config(&self) -> StringMap {
        let mut config = self.config.clone();
        if self.privileged {
            config
                .entry(PRIVILEGED_KEY.to_owned())
                .or_insert_with(|| String::from("true"));
        }
        config
    }

    /// Returns `true` when applying `self` over the reflected `observed`
    /// state would mutate the daemon record.
    #[must_use]
    pub fn needs_update(&self, observed: &Self) -> bool {
        let class = ResourceClass::Instance;
        let mut declared_devices = self.devices.clone();
        declared_devices.sort_by(|left, right| left.name.cmp(&right.name));
        let mut observed_devices = observed.devices.clone();
        observed_devices.sort_by(|left, right| left.name.cmp(&right.name));

        has_changed(&class, &self.effective_config(), &observed.config)
            || has_changed(&class, &self.limits, &observed.limits)
            || self.effective_profiles() != observed.profiles
            || declared_devices != observed_devices
    }

    pub(crate) fn clear_computed(&mut self) {
        self.status.clear();
        self.ip_address.clear();
        self.ipv4_address.clear();
        self.ipv6_address.clear();
        self.mac_address.clear();
    }
}

/// An image is either `<alias-or-fingerprint>` or `<remote>:<alias>`; both
/// parts must be non-empty when the remote is given. An empty image is left
/// to the verbs that need one.
fn validate_image_reference(image: &str) -> Result<(), InstanceError> {
    let malformed = match image.split_once(':') {
        Some((remote, alias)) => remote.trim().is_empty() || alias.trim().is_empty(),
        None => false,
    };
    if malformed {
        return Err(InstanceError::Validation(format!(
            "image '{image}' must look like [<remote>:]<alias>"
        )));
    }
    Ok(())
}

/// State record handed back and forth with the host orchestrator.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceData {
    /// Resource identifier; empty until created and after deletion.
    pub id: String,
    /// Set while a create is only partially realised.
    pub partial: bool,
    /// Declared attributes plus reflected computed ones.
    pub state: InstanceResource,
}

impl ResourceData {
    /// Wraps a declaration that has not been created yet.
    #[must_use]
    pub fn new(state: InstanceResource) -> Self {
        Self {
            id: String::new(),
            partial: false,
            state,
        }
    }

    /// Returns `true` once the resource has an identifier.
    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn map(pairs: &[(&str, &str)]) -> StringMap {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn devices_round_trip_through_wire_form() {
        let device = Device {
            name: String::from("eth0"),
            kind: DeviceType::Nic,
            properties: map(&[("network", "lxdbr0")]),
        };
        let wire = device.to_wire();
        assert_eq!(wire.get("type").map(String::as_str), Some("nic"));
        assert_eq!(Device::from_wire("eth0", &wire).expect("device"), device);
    }

    #[test]
    fn unknown_device_type_is_a_validation_error() {
        let err = Device::from_wire("x", &map(&[("type", "infiniband")])).expect_err("unknown");
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[test]
    fn unknown_kind_is_rejected_when_decoding() {
        let result: Result<InstanceResource, _> =
            serde_json::from_str(r#"{"name":"c1","type":"pod"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn empty_observed_kind_reflects_container() {
        assert_eq!(
            InstanceKind::from_observed("").expect("kind"),
            InstanceKind::Container
        );
    }

    #[test]
    fn limits_in_config_are_rejected() {
        let declared = InstanceResource {
            name: String::from("c1"),
            config: map(&[("limits.cpu", "2")]),
            ..InstanceResource::default()
        };
        assert!(matches!(
            declared.validate(),
            Err(InstanceError::Validation(_))
        ));
    }

    #[rstest]
    #[case("cloud-init.user-data")]
    #[case("snapshots.schedule")]
    #[case("migration.stateful")]
    fn config_keys_outside_reflected_prefixes_are_rejected(#[case] key: &str) {
        let declared = InstanceResource {
            name: String::from("c1"),
            config: map(&[(key, "x")]),
            ..InstanceResource::default()
        };
        let Err(InstanceError::Validation(message)) = declared.validate() else {
            panic!("expected validation error for {key}");
        };
        assert!(message.contains(key), "unexpected message: {message}");
    }

    #[test]
    fn reflected_prefixes_pass_validation() {
        let declared = InstanceResource {
            name: String::from("c1"),
            config: map(&[
                ("boot.autostart", "true"),
                ("environment.FOO", "bar"),
                ("security.nesting", "true"),
                ("user.user-data", "#cloud-config"),
            ]),
            ..InstanceResource::default()
        };
        assert!(declared.validate().is_ok());
    }

    #[rstest]
    #[case("images:")]
    #[case(":alpine/3.18")]
    #[case("local: ")]
    fn malformed_image_references_are_rejected(#[case] image: &str) {
        let declared = InstanceResource {
            name: String::from("c1"),
            image: image.to_owned(),
            ..InstanceResource::default()
        };
        assert!(matches!(
            declared.validate(),
            Err(InstanceError::Validation(_))
        ));
    }

    #[rstest]
    #[case("images:alpine/3.18/amd64")]
    #[case("local:my-alias")]
    #[case("0123abcd")]
    fn well_formed_image_references_pass(#[case] image: &str) {
        let declared = InstanceResource {
            name: String::from("c1"),
            image: image.to_owned(),
            ..InstanceResource::default()
        };
        assert!(declared.validate().is_ok());
    }

    #[test]
    fn privileged_declaration_matches_its_own_reflection() {
        let declared = InstanceResource {
            name: String::from("c1"),
            privileged: true,
            ..InstanceResource::default()
        };
        let observed = InstanceResource {
            config: map(&[(PRIVILEGED_KEY, "true")]),
            privileged: false,
            profiles: vec![String::from(DEFAULT_PROFILE)],
            ..declared.clone()
        };
        assert!(!declared.needs_update(&observed));
        assert!(InstanceResource { privileged: false, ..declared }.needs_update(&observed));
    }

    #[test]
    fn duplicate_device_names_are_rejected() {
        let disk = Device {
            name: String::from("root"),
            kind: DeviceType::Disk,
            properties: StringMap::new(),
        };
        let declared = InstanceResource {
            name: String::from("c1"),
            devices: vec![disk.clone(), disk],
            ..InstanceResource::default()
        };
        assert!(declared.validate().is_err());
    }

    #[test]
    fn declaration_defaults_start_and_wait() {
        let declared: InstanceResource =
            serde_json::from_str(r#"{"name":"c1","image":"images:alpine/3.18"}"#).expect("decode");
        assert!(declared.start_on_create);
        assert!(declared.wait_for_network);
        assert_eq!(declared.effective_profiles(), vec![String::from("default")]);
    }

    #[test]
    fn matching_reflection_needs_no_update() {
        let declared = InstanceResource {
            name: String::from("c1"),
            config: map(&[("user.dummy", "5")]),
            limits: map(&[("cpu", "1")]),
            ..InstanceResource::default()
        };
        let mut observed = declared.clone();
        observed.profiles = vec![String::from("default")];
        observed.status = String::from("Running");
        assert!(!declared.needs_update(&observed));

        observed.config.insert(String::from("boot.autostart"), String::from("1"));
        assert!(declared.needs_update(&observed));
    }

    #[test]
    fn toml_declaration_lifts_devices_and_files() {
        let declared = InstanceResource::from_toml_str(
            r#"
name = "web"
image = "images:alpine/3.18"
type = "virtual-machine"
profiles = ["default", "net"]

[limits]
cpu = "2"

[[device]]
name = "shared"
type = "disk"
properties = { source = "/srv", path = "/mnt" }

[[file]]
target_file = "/etc/motd"
content = "hello"
"#,
        )
        .expect("decode");

        assert_eq!(declared.kind, InstanceKind::VirtualMachine);
        assert_eq!(declared.limits.get("cpu").map(String::as_str), Some("2"));
        assert_eq!(declared.devices.len(), 1);
        assert_eq!(
            declared.files.first().map(|file| file.mode.as_str()),
            Some("0755")
        );
        declared.validate().expect("valid");
    }

    #[test]
    fn malformed_toml_is_a_validation_error() {
        let err = InstanceResource::from_toml_str("name = [").expect_err("malformed");
        assert!(matches!(err, InstanceError::Validation(_)));
    }
}
