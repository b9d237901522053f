//! Device metadata read from an opened device

use std::time::Duration;

use common::{DeviceDescriptor, DeviceInfo, UsbConnection};
use tracing::{debug, trace};

const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
const LANGID_EN_US: u16 = 0x0409;
const STRING_TIMEOUT: Duration = Duration::from_millis(500);

/// Collect manufacturer, product, version and serial strings
///
/// Snapshot strings win. Missing ones are filled from the raw device
/// descriptor and string descriptors read over control transfers; a missing
/// manufacturer or product finally falls back to the hex vendor/product id.
pub fn read_device_info(
    device: &DeviceDescriptor,
    connection: Option<&dyn UsbConnection>,
) -> DeviceInfo {
    let mut info = DeviceInfo {
        usb_version: non_empty(device.usb_version.clone()),
        manufacturer: non_empty(device.manufacturer.clone()),
        product: non_empty(device.product.clone()),
        version: non_empty(device.version.clone()),
        serial: non_empty(device.serial_number.clone()),
    };

    if let Some(connection) = connection {
        if info.serial.is_none() {
            info.serial = non_empty(connection.serial());
        }

        let raw = connection.raw_descriptors();
        if raw.len() >= 18 && raw[1] == 0x01 {
            if info.usb_version.is_none() {
                info.usb_version = Some(bcd_version(raw[3], raw[2]));
            }
            if info.version.is_none() {
                info.version = Some(bcd_version(raw[13], raw[12]));
            }

            let wanted = [
                (&mut info.manufacturer, raw[14]),
                (&mut info.product, raw[15]),
                (&mut info.serial, raw[16]),
            ];
            if wanted.iter().any(|(field, index)| field.is_none() && *index != 0) {
                let languages = read_languages(connection);
                for (field, index) in wanted {
                    if field.is_none() && index != 0 {
                        *field = read_string(connection, index, &languages);
                    }
                }
            }
        } else {
            debug!("Short device descriptor for {} ({} bytes)", device.name, raw.len());
        }
    }

    if info.manufacturer.is_none() {
        info.manufacturer = Some(format!("{:04x}", device.vendor_id));
    }
    if info.product.is_none() {
        info.product = Some(format!("{:04x}", device.product_id));
    }

    info
}

/// Format a BCD release number as `major.minor`
fn bcd_version(major: u8, minor: u8) -> String {
    format!("{:x}.{:02x}", major, minor)
}

/// Supported language ids from string descriptor zero
fn read_languages(connection: &dyn UsbConnection) -> Vec<u16> {
    let mut buf = [0u8; 256];
    let languages = match connection.control_transfer(
        REQUEST_TYPE_STANDARD_IN,
        REQUEST_GET_DESCRIPTOR,
        (DESCRIPTOR_TYPE_STRING as u16) << 8,
        0,
        &mut buf,
        STRING_TIMEOUT,
    ) {
        Ok(n) if n >= 4 && buf[1] == DESCRIPTOR_TYPE_STRING => buf[2..n]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
        Ok(n) => {
            trace!("Unexpected language table ({} bytes)", n);
            Vec::new()
        }
        Err(e) => {
            trace!("Failed to read language table: {}", e);
            Vec::new()
        }
    };

    if languages.is_empty() {
        vec![LANGID_EN_US]
    } else {
        languages
    }
}

/// Read one string descriptor, trying each language in turn
fn read_string(connection: &dyn UsbConnection, index: u8, languages: &[u16]) -> Option<String> {
    let mut buf = [0u8; 256];
    for &language in languages {
        let n = match connection.control_transfer(
            REQUEST_TYPE_STANDARD_IN,
            REQUEST_GET_DESCRIPTOR,
            ((DESCRIPTOR_TYPE_STRING as u16) << 8) | index as u16,
            language,
            &mut buf,
            STRING_TIMEOUT,
        ) {
            Ok(n) => n,
            Err(e) => {
                trace!("String {} (lang {:#06x}) unreadable: {}", index, language, e);
                continue;
            }
        };

        if n <= 2 || buf[0] as usize != n || buf[1] != DESCRIPTOR_TYPE_STRING {
            continue;
        }

        let units: Vec<u16> = buf[2..n]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let Ok(value) = String::from_utf16(&units) else {
            continue;
        };

        // A language table misread as a string decodes to U+0409
        if value.contains('\u{0409}') {
            continue;
        }
        if let Some(value) = non_empty(Some(value)) {
            return Some(value);
        }
    }
    None
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
