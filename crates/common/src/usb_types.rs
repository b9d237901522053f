//! USB device snapshot types, identities and filters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One alternate setting of an interface, as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub id: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoint_count: u8,
}

/// Snapshot of an attached device as enumerated by the platform
///
/// A descriptor is a plain value: holding one never keeps the physical
/// device (or any native resource) alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// OS node name, unique per attachment (e.g. `/dev/bus/usb/001/004`)
    pub name: String,
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Device release number (bcdDevice), formatted `x.yy`
    pub version: Option<String>,
    /// USB specification release (bcdUSB), formatted `x.yy`
    pub usb_version: Option<String>,
    pub num_configurations: u8,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    /// Conventional usbfs node name for a bus/address pair
    pub fn node_name(bus_number: u8, device_address: u8) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", bus_number, device_address)
    }

    /// Check that the descriptor references a physical device
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!(
                "device {:04x}:{:04x} has no node name",
                self.vendor_id, self.product_id
            ));
        }
        Ok(())
    }

    /// Find the interface descriptor for an interface number and alternate setting
    pub fn interface(&self, id: u8, alt_setting: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.id == id && i.alt_setting == alt_setting)
    }
}

/// Which optional fields take part in a [`DeviceIdentity`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    /// Vendor, product and class triple only. Units of one model collapse.
    Model,
    /// Also serial number, manufacturer, configuration count and version
    #[default]
    Extended,
}

/// Key identifying a device for caching and registry purposes
///
/// Two units of the same model and revision without a serial number produce
/// the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub num_configurations: Option<u8>,
    pub version: Option<String>,
}

impl DeviceIdentity {
    /// Build the identity of a device snapshot
    pub fn from_descriptor(device: &DeviceDescriptor, scope: IdentityScope) -> Self {
        let model = Self {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            class: device.class,
            subclass: device.subclass,
            protocol: device.protocol,
            serial: None,
            manufacturer: None,
            num_configurations: None,
            version: None,
        };

        match scope {
            IdentityScope::Model => model,
            IdentityScope::Extended => Self {
                serial: non_empty(device.serial_number.as_deref()),
                manufacturer: non_empty(device.manufacturer.as_deref()),
                num_configurations: Some(device.num_configurations),
                version: non_empty(device.version.as_deref()),
                ..model
            },
        }
    }

    /// Same identity with an explicitly known serial number
    pub fn with_serial(mut self, serial: Option<&str>) -> Self {
        if let Some(serial) = non_empty(serial) {
            self.serial = Some(serial);
        }
        self
    }

    /// Printable key, `vid#pid#class#subclass#protocol` plus optional parts
    pub fn key_name(&self) -> String {
        let mut key = format!(
            "{}#{}#{}#{}#{}",
            self.vendor_id, self.product_id, self.class, self.subclass, self.protocol
        );
        if let Some(serial) = &self.serial {
            key.push('#');
            key.push_str(serial);
        }
        if self.manufacturer.is_some()
            || self.num_configurations.is_some()
            || self.version.is_some()
        {
            key.push_str(&format!(
                "#{}#{}#{}",
                self.manufacturer.as_deref().unwrap_or(""),
                self.num_configurations
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                self.version.as_deref().unwrap_or("")
            ));
        }
        key
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_name())
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strings read from an opened device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub usb_version: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub serial: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "usb_version={},manufacturer={},product={},version={},serial={}",
            self.usb_version.as_deref().unwrap_or(""),
            self.manufacturer.as_deref().unwrap_or(""),
            self.product.as_deref().unwrap_or(""),
            self.version.as_deref().unwrap_or(""),
            self.serial.as_deref().unwrap_or("")
        )
    }
}

/// Match rule over vendor, product and class triple
///
/// `None` fields are wildcards. Class criteria match either the
/// device-level triple or any interface's triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub subclass: Option<u8>,
    #[serde(default)]
    pub protocol: Option<u8>,
    #[serde(default)]
    pub exclude: bool,
}

impl DeviceFilter {
    /// Filter matching every device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            ..Self::default()
        }
    }

    pub fn product(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    pub fn with_subclass(mut self, subclass: u8) -> Self {
        self.subclass = Some(subclass);
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Turn this rule into an exclusion rule
    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Whether the rule's criteria match the device (ignores `exclude`)
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if self.vendor_id.is_some_and(|vid| vid != device.vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|pid| pid != device.product_id) {
            return false;
        }

        if self.class.is_none() && self.subclass.is_none() && self.protocol.is_none() {
            return true;
        }

        if self.matches_class(device.class, device.subclass, device.protocol) {
            return true;
        }

        device
            .interfaces
            .iter()
            .any(|i| self.matches_class(i.class, i.subclass, i.protocol))
    }

    fn matches_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
    }
}

impl FromStr for DeviceFilter {
    type Err = crate::Error;

    /// Parse `[!]VID:PID`, where each side is `0x`-prefixed hex or `*`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (exclude, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '!0x1234:*')",
                s
            )));
        }

        Ok(Self {
            vendor_id: parse_hex_id(parts[0], "VID")?,
            product_id: parse_hex_id(parts[1], "PID")?,
            exclude,
            ..Self::default()
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclude {
            f.write_str("!")?;
        }
        match self.vendor_id {
            Some(vid) => write!(f, "{:#06x}", vid)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(pid) => write!(f, "{:#06x}", pid)?,
            None => f.write_str("*")?,
        }
        if let Some(class) = self.class {
            write!(f, " class={:#04x}", class)?;
        }
        Ok(())
    }
}

fn parse_hex_id(id: &str, name: &str) -> crate::Result<Option<u16>> {
    if id == "*" {
        return Ok(None);
    }

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            crate::Error::Config(format!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name, id
            ))
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(crate::Error::Config(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| crate::Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id)))
}
