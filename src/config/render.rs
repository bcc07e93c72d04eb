//! Config Text Generator
//!
//! Walks the model and resolved parameters and emits DRBD configuration
//! text. Only values deviating from what would be inherited anyway are
//! written, so an untouched resource renders as bare structure.

use super::escape::escape_config;
use super::writer::{ConfigWriter, Line};
use crate::domain::ports::{DrbdSyntax, ParameterSchema};
use crate::error::{Error, Result};
use crate::model::block_device::{MetaDisk, MetaDiskIndex};
use crate::model::cluster::Cluster;
use crate::model::proxy::format_address;
use crate::model::resource::Resource;
use crate::model::volume::Volume;
use crate::params::resolver::{parse_bool, LayerKind, ParamResolver, ScopeChain};
use crate::params::schema::{
    ParamInfo, ParamKind, Section, GLOBAL_SECTION, RESOURCE_SECTION, RESYNC_AFTER_NONE,
};
use tracing::debug;

/// Reason given when legacy syntax would have to negate an inherited flag
pub const LEGACY_NEGATED_FLAG: &str = "legacy syntax cannot switch off an inherited flag";

/// Renders resource files and the global/common file for a cluster
pub struct ConfigRenderer<'a> {
    schema: &'a dyn ParameterSchema,
    cluster: &'a Cluster,
    resolver: ParamResolver<'a>,
}

impl<'a> ConfigRenderer<'a> {
    pub fn new(schema: &'a dyn ParameterSchema, cluster: &'a Cluster) -> Self {
        Self {
            schema,
            cluster,
            resolver: ParamResolver::new(schema),
        }
    }

    fn syntax(&self) -> DrbdSyntax {
        self.schema.syntax()
    }

    // =========================================================================
    // Parameter Lines
    // =========================================================================

    /// The line for one deviating value, or `None` when nothing is written.
    /// Legacy syntax has no negated flag, so switching off a flag that is
    /// inherited as set through `baseline` cannot be expressed.
    fn param_line(
        &self,
        info: &ParamInfo,
        value: &str,
        baseline: &ScopeChain<'_>,
    ) -> Result<Option<Line>> {
        Ok(match &info.kind {
            ParamKind::Boolean => {
                let on = parse_bool(value).unwrap_or(false);
                match self.syntax() {
                    DrbdSyntax::Modern => Some(Line::Statement(
                        info.name.clone(),
                        if on { "yes" } else { "no" }.to_string(),
                    )),
                    DrbdSyntax::Legacy if on => Some(Line::Flag(info.name.clone())),
                    DrbdSyntax::Legacy => {
                        let inherited = self.resolver.resolve(&info.name, baseline)?;
                        if parse_bool(&inherited.value) == Some(true) {
                            return Err(Error::InvalidParameter {
                                param: info.name.clone(),
                                value: value.to_string(),
                                reason: LEGACY_NEGATED_FLAG.to_string(),
                            });
                        }
                        None
                    }
                }
            }
            ParamKind::ResyncAfter => {
                // dangling targets are treated as none
                if value == RESYNC_AFTER_NONE || !self.cluster.resources.contains_key(value) {
                    None
                } else {
                    Some(Line::Statement(info.name.clone(), value.to_string()))
                }
            }
            _ => Some(Line::Statement(info.name.clone(), value.to_string())),
        })
    }

    /// Plugin parameters fold into one `plugin { }` group. Booleans become
    /// bare flags; any other value is a compression or debug level and is
    /// written in the proxy's `<name> level <value>;` form.
    fn plugin_line(&self, info: &ParamInfo, value: &str) -> Option<Line> {
        let name = info.plugin_name()?.to_string();
        match &info.kind {
            ParamKind::Boolean => parse_bool(value)
                .unwrap_or(false)
                .then_some(Line::Flag(name)),
            _ => Some(Line::Raw(format!("{} level {}", name, escape_config(value)))),
        }
    }

    /// Deviating lines of one section
    fn section_lines(
        &self,
        section: &Section,
        chain: &ScopeChain<'_>,
        baseline: &ScopeChain<'_>,
        only: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<Line>> {
        let mut lines = Vec::new();
        let mut plugins = Vec::new();
        for info in self.schema.section_params(&section.name) {
            if let Some(filter) = only {
                if !filter(&info.name) {
                    continue;
                }
            }
            let Some(value) = self.resolver.deviation(&info.name, chain, baseline)? else {
                continue;
            };
            if info.is_plugin() {
                plugins.extend(self.plugin_line(info, &value));
            } else {
                lines.extend(self.param_line(info, &value, baseline)?);
            }
        }
        if !plugins.is_empty() {
            lines.push(Line::Block("plugin".into(), plugins));
        }
        Ok(lines)
    }

    /// Sections rendered as nested blocks
    fn block_sections(&self) -> impl Iterator<Item = &Section> {
        self.schema.sections().iter().filter(|s| !s.is_synthetic())
    }

    // =========================================================================
    // Resource File
    // =========================================================================

    /// Render `resource <name> { ... }` as seen from `target_host`
    pub fn render_resource(&self, resource: &Resource, target_host: &str) -> Result<String> {
        if !resource.involved_hosts().contains(target_host) {
            return Err(Error::HostNotInResource {
                resource: resource.name.clone(),
                host: target_host.to_string(),
            });
        }
        if self.syntax() == DrbdSyntax::Legacy && resource.volumes.len() > 1 {
            return Err(Error::Configuration(format!(
                "resource {} has {} volumes; legacy syntax allows one",
                resource.name,
                resource.volumes.len()
            )));
        }

        let chain = ScopeChain::for_resource(self.cluster, resource);
        let baseline = ScopeChain::for_common(self.cluster);

        let mut w = ConfigWriter::new();
        w.begin_block(&format!("resource {}", resource.name));

        // resource-level values
        for info in self.schema.section_params(RESOURCE_SECTION) {
            if let Some(value) = self.resolver.deviation(&info.name, &chain, &baseline)? {
                if let Some(line) = self.param_line(info, &value, &baseline)? {
                    w.line(&line);
                }
            }
        }

        for section in self.block_sections() {
            if section.is_proxy() && !resource.has_proxy() {
                continue;
            }
            let lines = self.section_lines(section, &chain, &baseline, None)?;
            w.block_of(section.display_name(), &lines);
        }

        let port = resource.port.ok_or_else(|| Error::ConfigurationIncomplete {
            resource: resource.name.clone(),
            host: target_host.to_string(),
            missing: "port".into(),
        })?;

        for host in resource.hosts() {
            w.begin_block(&format!("on {}", host));
            for volume in resource.volumes.values() {
                if volume.block_device_on(&host).is_none() {
                    continue;
                }
                self.render_volume(&mut w, resource, volume, &host)?;
            }

            let ip = resource
                .addresses
                .get(&host)
                .ok_or_else(|| Error::ConfigurationIncomplete {
                    resource: resource.name.clone(),
                    host: host.clone(),
                    missing: "address".into(),
                })?;
            w.raw(&format!("address {}", format_address(ip, port)));

            if let Some(link) = resource.proxy_links.get(&host) {
                w.begin_block(&format!("proxy on {}", link.proxy_host));
                w.raw(&format!("inside {}", link.inside));
                w.raw(&format!("outside {}", link.outside));
                w.end_block();
            }
            w.end_block();
        }

        w.end_block();
        debug!("Rendered resource {} for host {}", resource.name, target_host);
        Ok(w.finish())
    }

    fn render_volume(
        &self,
        w: &mut ConfigWriter,
        resource: &Resource,
        volume: &Volume,
        host: &str,
    ) -> Result<()> {
        let incomplete = |missing: &str| Error::ConfigurationIncomplete {
            resource: resource.name.clone(),
            host: host.to_string(),
            missing: missing.to_string(),
        };
        let device = volume.device.as_deref().ok_or_else(|| incomplete("device"))?;
        let disk = volume.block_device_on(host).ok_or_else(|| incomplete("disk"))?;
        let bd = self.cluster.block_device(host, disk)?;

        let wrapped = self.syntax().has_volumes();
        if wrapped {
            w.begin_block(&format!("volume {}", volume.number));
        }
        w.statement("device", device);
        w.statement("disk", disk);
        match &bd.meta_disk {
            MetaDisk::Internal => w.statement("meta-disk", "internal"),
            MetaDisk::External {
                device,
                index: MetaDiskIndex::Flexible,
            } => w.statement("flexible-meta-disk", device),
            MetaDisk::External {
                device,
                index: MetaDiskIndex::Fixed(index),
            } => w.raw(&format!("meta-disk {}[{}]", escape_config(device), index)),
        }

        if wrapped && !volume.params.is_empty() {
            let chain = ScopeChain::for_volume(self.cluster, resource, volume.number);
            let baseline = ScopeChain::for_resource(self.cluster, resource);
            let own = |name: &str| volume.params.contains_key(name);
            for section in self.block_sections() {
                let lines = self.section_lines(section, &chain, &baseline, Some(&own))?;
                w.block_of(section.display_name(), &lines);
            }
        }

        if wrapped {
            w.end_block();
        }
        Ok(())
    }

    // =========================================================================
    // Global and Common
    // =========================================================================

    /// Render the `global { }` and `common { }` blocks
    pub fn render_global_and_common(&self) -> Result<String> {
        let builtin = ScopeChain::builtin();
        let mut w = ConfigWriter::new();

        w.begin_block(GLOBAL_SECTION);
        let global = ScopeChain::for_global(self.cluster);
        for info in self.schema.section_params(GLOBAL_SECTION) {
            if let Some(value) = self.resolver.deviation(&info.name, &global, &builtin)? {
                if let Some(line) = self.param_line(info, &value, &builtin)? {
                    w.line(&line);
                }
            }
        }
        w.end_block();

        w.begin_block("common");
        let common = ScopeChain::builtin().with(LayerKind::Common, &self.cluster.common);
        for info in self.schema.section_params(RESOURCE_SECTION) {
            if let Some(value) = self.resolver.deviation(&info.name, &common, &builtin)? {
                if let Some(line) = self.param_line(info, &value, &builtin)? {
                    w.line(&line);
                }
            }
        }
        for section in self.block_sections() {
            let lines = self.section_lines(section, &common, &builtin, None)?;
            w.block_of(section.display_name(), &lines);
        }
        w.end_block();

        Ok(w.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::block_device::BlockDevice;
    use crate::model::cluster::BindVolume;
    use crate::model::host::Host;
    use crate::model::proxy::{Endpoint, ProxyLink};
    use crate::params::schema::DrbdSchema;
    use assert_matches::assert_matches;

    fn cluster(syntax: DrbdSyntax) -> Cluster {
        let mut cluster = Cluster::new("test", syntax);
        for name in ["alpha", "beta"] {
            let mut host = Host::new(name);
            host.block_devices.insert("/dev/sdb".into(), BlockDevice::new("/dev/sdb"));
            host.block_devices.insert("/dev/sdc".into(), BlockDevice::new("/dev/sdc"));
            cluster.add_host(host).unwrap();
        }
        cluster
            .bind_volume(BindVolume {
                resource: "r0".into(),
                volume: None,
                device: None,
                members: vec![("alpha".into(), "/dev/sdb".into()), ("beta".into(), "/dev/sdb".into())],
            })
            .unwrap();
        let resource = cluster.resource_mut("r0").unwrap();
        resource.port = Some(7788);
        resource.addresses.insert("alpha".into(), "10.0.0.1".into());
        resource.addresses.insert("beta".into(), "10.0.0.2".into());
        cluster
    }

    #[test]
    fn test_default_resource_is_skeletal() {
        let schema = DrbdSchema::modern();
        let cluster = cluster(DrbdSyntax::Modern);
        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "alpha")
            .unwrap();

        let expected = "\
resource r0 {
\ton alpha {
\t\tvolume 0 {
\t\t\tdevice /dev/drbd0;
\t\t\tdisk /dev/sdb;
\t\t\tmeta-disk internal;
\t\t}
\t\taddress 10.0.0.1:7788;
\t}
\ton beta {
\t\tvolume 0 {
\t\t\tdevice /dev/drbd0;
\t\t\tdisk /dev/sdb;
\t\t\tmeta-disk internal;
\t\t}
\t\taddress 10.0.0.2:7788;
\t}
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_deviations_and_booleans() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        let resource = cluster.resource_mut("r0").unwrap();
        resource.params.insert("protocol".into(), "A".into());
        resource.params.insert("allow-two-primaries".into(), "yes".into());
        resource.params.insert("timeout".into(), "60".into());
        resource.params.insert("split-brain".into(), "/usr/lib/drbd/notify.sh root".into());

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "beta")
            .unwrap();
        assert!(text.contains("\tnet {\n\t\tprotocol A;\n\t\tallow-two-primaries yes;\n\t}\n"));
        assert!(!text.contains("timeout"));
        assert!(text.contains("split-brain \"/usr/lib/drbd/notify.sh root\";"));
    }

    #[test]
    fn test_common_value_suppresses_equal_resource_value() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        cluster.common.insert("protocol".into(), "B".into());
        cluster
            .resource_mut("r0")
            .unwrap()
            .params
            .insert("protocol".into(), "B".into());

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "alpha")
            .unwrap();
        assert!(!text.contains("protocol"));

        let common = renderer.render_global_and_common().unwrap();
        assert_eq!(common, "global {\n}\ncommon {\n\tnet {\n\t\tprotocol B;\n\t}\n}\n");
    }

    #[test]
    fn test_resync_after_reference() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        cluster
            .bind_volume(BindVolume {
                resource: "r1".into(),
                volume: None,
                device: None,
                members: vec![("alpha".into(), "/dev/sdc".into()), ("beta".into(), "/dev/sdc".into())],
            })
            .unwrap();
        let addresses = cluster.resource("r0").unwrap().addresses.clone();
        let r1 = cluster.resource_mut("r1").unwrap();
        r1.port = Some(7789);
        r1.addresses = addresses;
        cluster.set_resync_after("r1", "r0").unwrap();

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r1").unwrap(), "alpha")
            .unwrap();
        assert!(text.contains("\tdisk {\n\t\tresync-after r0;\n\t}\n"));

        // a dangling name renders as nothing
        cluster
            .resource_mut("r1")
            .unwrap()
            .params
            .insert("resync-after".into(), "gone".into());
        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r1").unwrap(), "alpha")
            .unwrap();
        assert!(!text.contains("resync-after"));
    }

    #[test]
    fn test_proxy_block_and_plugins() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        cluster.add_host(Host::new("relay")).unwrap();
        let link = ProxyLink::new(
            "relay",
            Endpoint::new("127.0.0.1", 7790),
            Endpoint::new("fd00::9", 7788),
        );
        cluster.set_proxy_link("r0", "alpha", link).unwrap();
        let resource = cluster.resource_mut("r0").unwrap();
        resource.params.insert("memlimit".into(), "32M".into());
        resource.params.insert("plugin-zlib".into(), "9".into());
        resource.params.insert("plugin-debug".into(), "yes".into());

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "relay")
            .unwrap();
        assert!(text.contains(
            "\tproxy {\n\t\tmemlimit 32M;\n\t\tplugin {\n\t\t\tzlib level 9;\n\t\t\tdebug;\n\t\t}\n\t}\n"
        ));
        assert!(text.contains(
            "\t\tproxy on relay {\n\t\t\tinside 127.0.0.1:7790;\n\t\t\toutside ipv6 [fd00::9]:7788;\n\t\t}\n"
        ));
        assert_eq!(text.matches("proxy on").count(), 1);
    }

    #[test]
    fn test_plugin_values_are_escaped() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        cluster.add_host(Host::new("relay")).unwrap();
        let link = ProxyLink::new(
            "relay",
            Endpoint::new("127.0.0.1", 7790),
            Endpoint::new("10.0.0.9", 7788),
        );
        cluster.set_proxy_link("r0", "alpha", link).unwrap();
        cluster
            .resource_mut("r0")
            .unwrap()
            .params
            .insert("plugin-zlib".into(), "9 x".into());

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "alpha")
            .unwrap();
        assert!(text.contains("\t\t\tzlib level \"9 x\";\n"));
    }

    #[test]
    fn test_legacy_cannot_negate_common_flag() {
        let schema = DrbdSchema::legacy();
        let mut cluster = cluster(DrbdSyntax::Legacy);
        cluster.common.insert("allow-two-primaries".into(), "yes".into());
        cluster
            .resource_mut("r0")
            .unwrap()
            .params
            .insert("allow-two-primaries".into(), "no".into());

        let renderer = ConfigRenderer::new(&schema, &cluster);
        assert_matches!(
            renderer.render_resource(cluster.resource("r0").unwrap(), "alpha"),
            Err(Error::InvalidParameter { ref param, .. }) if param == "allow-two-primaries"
        );

        // the common file still carries the flag
        let common = renderer.render_global_and_common().unwrap();
        assert!(common.contains("\t\tallow-two-primaries;\n"));

        // switching it on in the resource only is fine
        cluster.common.clear();
        cluster
            .resource_mut("r0")
            .unwrap()
            .params
            .insert("allow-two-primaries".into(), "yes".into());
        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "alpha")
            .unwrap();
        assert!(text.contains("\tnet {\n\t\tallow-two-primaries;\n\t}\n"));
    }

    #[test]
    fn test_missing_address_is_incomplete() {
        let schema = DrbdSchema::modern();
        let mut cluster = cluster(DrbdSyntax::Modern);
        cluster.resource_mut("r0").unwrap().addresses.remove("beta");
        let renderer = ConfigRenderer::new(&schema, &cluster);
        let result = renderer.render_resource(cluster.resource("r0").unwrap(), "alpha");
        assert_matches!(
            result,
            Err(Error::ConfigurationIncomplete { ref host, .. }) if host == "beta"
        );
    }

    #[test]
    fn test_legacy_layout() {
        let schema = DrbdSchema::legacy();
        let mut cluster = cluster(DrbdSyntax::Legacy);
        let resource = cluster.resource_mut("r0").unwrap();
        resource.params.insert("protocol".into(), "A".into());
        resource.params.insert("no-disk-flushes".into(), "yes".into());
        resource.params.insert("no-md-flushes".into(), "no".into());
        cluster.host_mut("alpha").unwrap().block_devices.insert(
            "/dev/sdb".into(),
            BlockDevice::new("/dev/sdb").with_meta_disk(MetaDisk::External {
                device: "/dev/sdd".into(),
                index: MetaDiskIndex::Fixed(2),
            }),
        );
        cluster.rebuild_index().unwrap();

        let renderer = ConfigRenderer::new(&schema, &cluster);
        let text = renderer
            .render_resource(cluster.resource("r0").unwrap(), "alpha")
            .unwrap();
        assert!(text.starts_with("resource r0 {\n\tprotocol A;\n"));
        assert!(text.contains("\tdisk {\n\t\tno-disk-flushes;\n\t}\n"));
        assert!(!text.contains("no-md-flushes"));
        assert!(!text.contains("volume"));
        assert!(text.contains("\ton alpha {\n\t\tdevice /dev/drbd0;\n\t\tdisk /dev/sdb;\n\t\tmeta-disk /dev/sdd[2];\n"));
    }
}
