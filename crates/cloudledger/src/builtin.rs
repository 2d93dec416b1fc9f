//! Built-in descriptors for common compute resources

use crate::descriptor::{ChildKey, ChildSpec, FieldKind, FieldSpec, OpaqueSpec, ResourceDescriptor};

/// Names accepted by [`by_name`]
pub const BUILTIN_NAMES: &[&str] = &["instance", "disk"];

pub fn by_name(name: &str) -> Option<ResourceDescriptor> {
    match name {
        "instance" => Some(instance()),
        "disk" => Some(disk()),
        _ => None,
    }
}

fn labels() -> ChildSpec {
    ChildSpec::new("labels", ChildKey::MapKey, vec![FieldSpec::text("value")])
}

fn licenses() -> ChildSpec {
    ChildSpec::new("licenses", ChildKey::None, vec![FieldSpec::text("license")])
}

/// Virtual machine instance
pub fn instance() -> ResourceDescriptor {
    ResourceDescriptor::new("instance")
        .with_scalar(FieldSpec::text("name"))
        .with_scalar(FieldSpec::text("status"))
        .with_scalar(FieldSpec::text("machine_type").from_source("machineType"))
        .with_scalar(FieldSpec::text("zone"))
        .with_scalar(FieldSpec::text("creation_timestamp").from_source("creationTimestamp"))
        .with_scalar(FieldSpec::text("cpu_platform").from_source("cpuPlatform"))
        .with_scalar(
            FieldSpec::new("deletion_protection", FieldKind::Boolean)
                .from_source("deletionProtection"),
        )
        .with_opaque(OpaqueSpec::new("metadata"))
        .with_opaque(OpaqueSpec::new("scheduling"))
        .with_child(labels())
        .with_child(licenses())
        .with_child(
            ChildSpec::new(
                "disks",
                ChildKey::Field("device_name".into()),
                vec![
                    FieldSpec::text("device_name").from_source("deviceName"),
                    FieldSpec::text("source"),
                    FieldSpec::text("mode"),
                    FieldSpec::new("boot", FieldKind::Boolean),
                    FieldSpec::new("auto_delete", FieldKind::Boolean).from_source("autoDelete"),
                    FieldSpec::new("disk_size_gb", FieldKind::Integer).from_source("diskSizeGb"),
                ],
            ),
        )
        .with_child(
            ChildSpec::new(
                "network_interfaces",
                ChildKey::Field("name".into()),
                vec![
                    FieldSpec::text("name"),
                    FieldSpec::text("network"),
                    FieldSpec::text("subnetwork"),
                    FieldSpec::text("network_ip").from_source("networkIP"),
                ],
            )
            .from_source("networkInterfaces"),
        )
        .with_child(
            ChildSpec::new("tags", ChildKey::None, vec![FieldSpec::text("tag")])
                .from_source("tags.items"),
        )
}

/// Persistent disk
pub fn disk() -> ResourceDescriptor {
    ResourceDescriptor::new("disk")
        .with_scalar(FieldSpec::text("name"))
        .with_scalar(FieldSpec::text("status"))
        .with_scalar(FieldSpec::new("size_gb", FieldKind::Integer).from_source("sizeGb"))
        .with_scalar(FieldSpec::text("disk_type").from_source("type"))
        .with_scalar(FieldSpec::text("zone"))
        .with_opaque(OpaqueSpec::new("guest_os_features").from_source("guestOsFeatures"))
        .with_child(labels())
        .with_child(licenses())
        .with_child(ChildSpec::new(
            "users",
            ChildKey::None,
            vec![FieldSpec::text("user")],
        ))
}
