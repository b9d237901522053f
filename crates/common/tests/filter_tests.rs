//! Integration tests for device filters and identities
//!
//! Tests:
//! - Filter string parsing and printing
//! - Class matching against device and interface triples
//! - Identity stability across scopes

use common::test_utils::{
    create_mock_camera_device, create_mock_device, create_mock_hid_device,
};
use common::{DeviceFilter, DeviceIdentity, IdentityScope};
use proptest::prelude::*;

mod parsing {
    use super::*;

    #[test]
    fn test_parse_uppercase_prefix() {
        let filter: DeviceFilter = "0X1D50:0X6089".parse().unwrap();
        assert_eq!(filter.vendor_id, Some(0x1d50));
        assert_eq!(filter.product_id, Some(0x6089));
        assert!(!filter.exclude);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let filter: DeviceFilter = "  !0x046d:*  ".parse().unwrap();
        assert!(filter.exclude);
        assert_eq!(filter.vendor_id, Some(0x046d));
        assert_eq!(filter.product_id, None);
    }

    #[test]
    fn test_parse_error_mentions_input() {
        let err = "abcd:0x0001".parse::<DeviceFilter>().unwrap_err();
        assert!(err.to_string().contains("abcd"));
    }

    #[test]
    fn test_empty_hex_rejected() {
        assert!("0x:0x0001".parse::<DeviceFilter>().is_err());
    }
}

mod matching {
    use super::*;

    #[test]
    fn test_camera_matches_video_class_through_interface() {
        let camera = create_mock_camera_device(3);
        let video = DeviceFilter::class(0x0E);
        let streaming = DeviceFilter::class(0x0E).with_subclass(0x02);

        assert!(video.matches(&camera));
        assert!(streaming.matches(&camera));
        assert!(!video.matches(&create_mock_hid_device(4)));
    }

    #[test]
    fn test_exclude_flag_does_not_affect_matches() {
        let device = create_mock_device(1, 0x1234, 0x0001);
        let include = DeviceFilter::vendor(0x1234);
        let exclude = DeviceFilter::vendor(0x1234).excluding();

        assert_eq!(include.matches(&device), exclude.matches(&device));
    }

    #[test]
    fn test_class_and_vendor_combine() {
        let hid = create_mock_hid_device(2);
        let filter = DeviceFilter {
            vendor_id: Some(0x046d),
            class: Some(0x03),
            ..DeviceFilter::default()
        };
        assert!(filter.matches(&hid));

        let wrong_vendor = DeviceFilter {
            vendor_id: Some(0x1234),
            ..filter
        };
        assert!(!wrong_vendor.matches(&hid));
    }
}

mod identity {
    use super::*;

    #[test]
    fn test_identity_independent_of_node_name() {
        let a = create_mock_device(1, 0x1234, 0x0001);
        let mut b = a.clone();
        b.name = "/dev/bus/usb/002/017".to_string();
        b.bus_number = 2;
        b.device_address = 17;

        assert_eq!(
            DeviceIdentity::from_descriptor(&a, IdentityScope::Extended),
            DeviceIdentity::from_descriptor(&b, IdentityScope::Extended)
        );
    }

    #[test]
    fn test_empty_serial_treated_as_missing() {
        let mut a = create_mock_device(1, 0x1234, 0x0001);
        let mut b = a.clone();
        a.serial_number = Some(String::new());
        b.serial_number = None;

        assert_eq!(
            DeviceIdentity::from_descriptor(&a, IdentityScope::Extended),
            DeviceIdentity::from_descriptor(&b, IdentityScope::Extended)
        );
    }
}

/// Strategy for an optional id printed the way filters print
fn id_strategy() -> impl Strategy<Value = Option<u16>> {
    proptest::option::of(any::<u16>())
}

proptest! {
    /// Property: printing a vendor/product filter and parsing it back is lossless
    #[test]
    fn prop_filter_display_parse(
        vendor_id in id_strategy(),
        product_id in id_strategy(),
        exclude in any::<bool>(),
    ) {
        let filter = DeviceFilter { vendor_id, product_id, exclude, ..DeviceFilter::default() };
        let parsed: DeviceFilter = filter.to_string().parse().unwrap();
        prop_assert_eq!(parsed, filter);
    }

    /// Property: a filter built from a device's own ids always matches it
    #[test]
    fn prop_own_ids_match(id in 1u32..127, vid in any::<u16>(), pid in any::<u16>()) {
        let device = create_mock_device(id, vid, pid);
        prop_assert!(DeviceFilter::product(vid, pid).matches(&device));
        prop_assert!(DeviceFilter::vendor(vid).matches(&device));
    }

    /// Property: model-scope identities ignore everything but ids and class
    #[test]
    fn prop_model_identity_ignores_strings(
        serial in "[A-Z0-9]{0,12}",
        manufacturer in "[a-zA-Z ]{0,16}",
    ) {
        let base = create_mock_device(1, 0x1234, 0x5678);
        let mut other = base.clone();
        other.serial_number = Some(serial);
        other.manufacturer = Some(manufacturer);

        prop_assert_eq!(
            DeviceIdentity::from_descriptor(&base, IdentityScope::Model),
            DeviceIdentity::from_descriptor(&other, IdentityScope::Model)
        );
    }
}
