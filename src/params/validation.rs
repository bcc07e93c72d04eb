//! Parameter Validation
//!
//! Per-value checks against the schema and whole-resource checks that
//! collect every problem in one pass, so a caller can show all of them at
//! once instead of stopping at the first.

use super::resolver::{check_resync_after, parse_bool, split_unit, to_kib, ParamResolver, ScopeChain};
use super::schema::{ParamKind, UnitSpec, RESYNC_AFTER_NONE};
use crate::config::render::LEGACY_NEGATED_FLAG;
use crate::domain::ports::{DrbdSyntax, ParameterSchema};
use crate::error::{Error, Result, ValidationErrors};
use crate::model::block_device::{MetaDisk, MetaDiskIndex};
use crate::model::cluster::Cluster;
use crate::model::volume::minor_of;
use regex::Regex;
use std::sync::OnceLock;

// =============================================================================
// Block-device Level Parameters
// =============================================================================

/// DRBD device path of a volume
pub const DRBD_DEVICE: &str = "DrbdDevice";
/// Meta-data device: `internal` or a device path
pub const DRBD_META_DISK: &str = "DrbdMetaDisk";
/// Index on an external meta-data device
pub const DRBD_META_DISK_INDEX: &str = "DrbdMetaDiskIndex";
/// Replication port
pub const DRBD_NET_INTERFACE_PORT: &str = "DrbdNetInterfacePort";
pub const DRBD_PROXY_INSIDE_PORT: &str = "DrbdProxyInsidePort";
pub const DRBD_PROXY_OUTSIDE_PORT: &str = "DrbdProxyOutsidePort";

fn resource_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid resource name regex"))
}

fn invalid(param: &str, value: &str, reason: impl Into<String>) -> Error {
    Error::InvalidParameter {
        param: param.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Parse a port value in `0..=65535`
pub fn parse_port(param: &str, value: &str) -> Result<u16> {
    let number: u64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(param, value, "must be a number"))?;
    u16::try_from(number).map_err(|_| invalid(param, value, "must be between 0 and 65535"))
}

/// Parse a meta-disk index: a number or `Flexible`
pub fn parse_meta_disk_index(value: &str) -> Result<MetaDiskIndex> {
    if value.eq_ignore_ascii_case("flexible") {
        return Ok(MetaDiskIndex::Flexible);
    }
    value
        .trim()
        .parse()
        .map(MetaDiskIndex::Fixed)
        .map_err(|_| invalid(DRBD_META_DISK_INDEX, value, "must be a number or Flexible"))
}

fn check_block_device_param(name: &str, value: &str) -> Option<Result<()>> {
    let result = match name {
        DRBD_DEVICE => match minor_of(value) {
            Some(_) => Ok(()),
            None => Err(invalid(name, value, "must be /dev/drbd<minor>")),
        },
        DRBD_META_DISK => {
            if value == "internal" || value.starts_with('/') {
                Ok(())
            } else {
                Err(invalid(name, value, "must be internal or a device path"))
            }
        }
        DRBD_META_DISK_INDEX => parse_meta_disk_index(value).map(|_| ()),
        DRBD_NET_INTERFACE_PORT | DRBD_PROXY_INSIDE_PORT | DRBD_PROXY_OUTSIDE_PORT => {
            parse_port(name, value).map(|_| ())
        }
        _ => return None,
    };
    Some(result)
}

// =============================================================================
// Single Values
// =============================================================================

/// Check one proposed value. An empty value means "nothing selected" and is
/// accepted unless the parameter is required.
pub fn check_param(schema: &dyn ParameterSchema, name: &str, value: &str) -> Result<()> {
    if let Some(result) = check_block_device_param(name, value) {
        return result;
    }

    let info = schema.param(name).ok_or_else(|| Error::ParameterNotFound {
        name: name.to_string(),
    })?;

    if value.is_empty() {
        return if info.required {
            Err(invalid(name, value, "is required"))
        } else {
            Ok(())
        };
    }

    match &info.kind {
        ParamKind::Boolean => parse_bool(value)
            .map(|_| ())
            .ok_or_else(|| invalid(name, value, "must be yes or no")),
        ParamKind::Numeric { min, max, unit } => {
            let number = match unit {
                Some(unit) => {
                    let (_, suffix) = split_unit(value)
                        .ok_or_else(|| invalid(name, value, "must be a number"))?;
                    let kib = to_kib(unit, value).ok_or_else(|| {
                        invalid(
                            name,
                            value,
                            format!("unit {} is not allowed", suffix.unwrap_or(unit.default_suffix)),
                        )
                    })?;
                    let per_unit = UnitSpec::multiplier(unit.default_suffix).unwrap_or(1);
                    kib / per_unit
                }
                None => value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid(name, value, "must be a number"))?,
            };
            if number < *min || number > *max {
                return Err(invalid(
                    name,
                    value,
                    format!("must be between {} and {}", min, max),
                ));
            }
            Ok(())
        }
        ParamKind::Enum(values) => {
            if values.iter().any(|v| v == value) {
                Ok(())
            } else {
                Err(invalid(name, value, format!("must be one of {}", values.join(", "))))
            }
        }
        ParamKind::Text { pattern } => match pattern {
            Some(re) if !re.is_match(value) => {
                Err(invalid(name, value, format!("must match {}", re.as_str())))
            }
            _ => Ok(()),
        },
        ParamKind::Handler => Ok(()),
        ParamKind::ResyncAfter => {
            if value == RESYNC_AFTER_NONE || resource_name_pattern().is_match(value) {
                Ok(())
            } else {
                Err(invalid(name, value, "must be a resource name or none"))
            }
        }
    }
}

// =============================================================================
// Whole Resource
// =============================================================================

fn record(errors: &mut ValidationErrors, scope: &str, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(Error::InvalidParameter { param, value, reason }) => {
            errors.push(scope, param, value, reason)
        }
        Err(Error::ParameterNotFound { name }) => {
            errors.push(scope, name, "", "unknown parameter")
        }
        Err(Error::Validation(inner)) => errors.extend(inner),
        Err(other) => errors.push(scope, "", "", other.to_string()),
    }
}

/// Check a resource with its pending edits folded in
pub fn check_resource(schema: &dyn ParameterSchema, cluster: &Cluster, name: &str) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    let Some(stored) = cluster.resources.get(name) else {
        errors.push(name, "", "", "resource does not exist");
        return errors;
    };
    let resource = stored.with_pending_applied();

    if !resource_name_pattern().is_match(name) {
        errors.push(name, "name", name, "may contain only letters, digits, '_', '-' and '.'");
    }

    // parameters
    for (param, value) in resource.params.iter().chain(resource.defaults.iter()) {
        record(&mut errors, name, check_param(schema, param, value));
    }
    for info in schema.sections().iter().flat_map(|s| schema.section_params(&s.name)) {
        if info.required && info.default.is_none() && !resource.params.contains_key(&info.name) {
            errors.push(name, info.name.clone(), "", "is required");
        }
    }

    if schema.syntax() == DrbdSyntax::Legacy {
        let resolver = ParamResolver::new(schema);
        let inherited = ScopeChain::for_common(cluster);
        for (param, value) in &resource.params {
            let is_flag = schema.param(param).is_some_and(|info| info.is_checkbox());
            if !is_flag || parse_bool(value) != Some(false) {
                continue;
            }
            let set_above = resolver
                .resolve(param, &inherited)
                .is_ok_and(|r| parse_bool(&r.value) == Some(true));
            if set_above {
                errors.push(name, param.clone(), value.clone(), LEGACY_NEGATED_FLAG);
            }
        }
    }

    let after_param = schema.syntax().resync_after_param();
    if let Some(target) = resource.resync_after(after_param) {
        if !cluster.resources.contains_key(target) {
            errors.push(name, after_param, target, "resource does not exist");
        } else {
            record(&mut errors, name, check_resync_after(cluster, name, target));
        }
    }

    if schema.syntax() == DrbdSyntax::Legacy && resource.volumes.len() > 1 {
        errors.push(name, "volume", resource.volumes.len().to_string(), "legacy syntax allows one volume");
    }

    // volumes
    for volume in resource.volumes.values() {
        let scope = format!("{}/{}", name, volume.number);
        match &volume.device {
            None => errors.push(&scope, DRBD_DEVICE, "", "is not set"),
            Some(device) => {
                record(&mut errors, &scope, check_param(schema, DRBD_DEVICE, device));
                if let Some(owner) = cluster.volume_for_device(device) {
                    if owner.resource != name || owner.volume != volume.number {
                        errors.push(&scope, DRBD_DEVICE, device.clone(), format!("already used by {}", owner));
                    }
                }
            }
        }
        for (param, value) in &volume.params {
            record(&mut errors, &scope, check_param(schema, param, value));
        }
        for (host, path) in &volume.devices {
            let bd_scope = format!("{}:{}", host, path);
            match cluster.block_device(host, path) {
                Err(e) => errors.push(&bd_scope, "", "", e.to_string()),
                Ok(bd) => {
                    if let MetaDisk::External { device, .. } = &bd.meta_disk {
                        record(&mut errors, &bd_scope, check_param(schema, DRBD_META_DISK, device));
                        if device == path {
                            errors.push(&bd_scope, DRBD_META_DISK, device.clone(), "cannot be the data device");
                        }
                    }
                }
            }
        }
    }

    // network
    match resource.port {
        None => errors.push(name, DRBD_NET_INTERFACE_PORT, "", "is not set"),
        Some(port) if !resource.committed => {
            for host in resource.hosts() {
                if cluster.hosts.get(&host).is_some_and(|h| h.is_port_used(port)) {
                    errors.push(
                        format!("{}@{}", name, host),
                        DRBD_NET_INTERFACE_PORT,
                        port.to_string(),
                        format!("already used on host {}", host),
                    );
                }
            }
        }
        Some(_) => {}
    }
    for host in resource.hosts() {
        let scope = format!("{}@{}", name, host);
        match resource.addresses.get(&host) {
            None => errors.push(&scope, "address", "", "is not set"),
            Some(ip) => {
                let known = cluster.hosts.get(&host);
                if known.is_some_and(|h| !h.facts.interfaces.is_empty() && !h.has_address(ip)) {
                    errors.push(&scope, "address", ip.clone(), "no interface on the host has this address");
                }
            }
        }
    }

    for (host, link) in &resource.proxy_links {
        let scope = format!("{}@{}", name, host);
        if !cluster.hosts.contains_key(&link.proxy_host) {
            errors.push(&scope, "proxy", link.proxy_host.clone(), "unknown proxy host");
        }
        if link.outside.port as u32 + 1 >= link.inside.port as u32 {
            errors.push(
                &scope,
                DRBD_PROXY_OUTSIDE_PORT,
                link.outside.port.to_string(),
                format!("must be lower than inside port {} minus one", link.inside.port),
            );
        }
        if !resource.committed {
            if let Some(proxy) = cluster.hosts.get(&link.proxy_host) {
                for (param, port) in [
                    (DRBD_PROXY_INSIDE_PORT, link.inside.port),
                    (DRBD_PROXY_OUTSIDE_PORT, link.outside.port),
                ] {
                    if proxy.is_proxy_port_used(port) {
                        errors.push(&scope, param, port.to_string(), format!("already used on host {}", proxy.name));
                    }
                }
            }
        }
    }

    errors
}

/// Check the `global` and `common` values of a cluster
pub fn check_common(schema: &dyn ParameterSchema, cluster: &Cluster) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    for (param, value) in &cluster.global {
        record(&mut errors, "global", check_param(schema, param, value));
    }
    for (param, value) in &cluster.common {
        record(&mut errors, "common", check_param(schema, param, value));
    }
    errors
}
