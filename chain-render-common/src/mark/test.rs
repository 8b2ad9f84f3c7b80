#![cfg(test)]

use std::collections::BTreeSet;

use strum::{EnumCount, IntoEnumIterator};

use crate::{MarkBitConfig, MarkError, MarkField, MarkRequirement};

fn layout() -> MarkBitConfig {
    MarkBitConfig {
        accept: 0x8,
        pass: 0x10,
        scratch0: 0x20,
        scratch1: 0x40,
        drop: 0x80,
        egress: 0x4,
        endpoint: 0xff00,
        non_cali_endpoint: 0x0100,
        dns_policy: 0x1,
        skip_dns_policy_nfqueue: 0x400000,
        ..Default::default()
    }
}

fn requirement(field: MarkField) -> MarkRequirement {
    match field {
        MarkField::NonCaliEndpoint | MarkField::Proxy => MarkRequirement::Ignored,
        MarkField::Ipsec | MarkField::Egress => MarkRequirement::Optional,
        _ => MarkRequirement::Required,
    }
}

#[test]
fn field_list_covers_every_config_field() {
    let json = serde_json::to_value(MarkBitConfig::default()).unwrap();
    let config_fields: BTreeSet<String> = json.as_object().unwrap().keys().cloned().collect();
    let listed: BTreeSet<String> = MarkField::iter().map(|f| f.as_ref().to_string()).collect();
    assert_eq!(config_fields, listed);
    assert_eq!(MarkField::COUNT, config_fields.len());
}

#[test]
fn disjoint_layout_is_accepted() {
    let used = layout().validate(requirement).unwrap();
    assert_eq!(used, 0x8 | 0x10 | 0x20 | 0x40 | 0x80 | 0x4 | 0xff00 | 0x1 | 0x400000);
}

#[test]
fn unset_required_field_is_rejected() {
    let marks = MarkBitConfig {
        scratch1: 0,
        ..layout()
    };
    assert_eq!(
        marks.validate(requirement),
        Err(MarkError::Unset(MarkField::Scratch1))
    );
}

#[test]
fn overlapping_fields_are_rejected() {
    let marks = MarkBitConfig {
        drop: 0x18,
        ..layout()
    };
    assert_eq!(
        marks.validate(requirement),
        Err(MarkError::Overlap {
            field: MarkField::Drop,
            bits: 0x18,
            used: 0x8 | 0x10,
        })
    );
}

#[test]
fn optional_field_still_checked_for_overlap() {
    let marks = MarkBitConfig {
        ipsec: 0x20,
        ..layout()
    };
    assert!(matches!(
        marks.validate(requirement),
        Err(MarkError::Overlap {
            field: MarkField::Scratch0,
            ..
        })
    ));
}

#[test]
fn ignored_field_may_overlap() {
    let marks = MarkBitConfig {
        proxy: 0x8,
        ..layout()
    };
    assert!(marks.validate(requirement).is_ok());
}
