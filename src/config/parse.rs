//! Config Parser
//!
//! Reads the brace-delimited DRBD grammar back into a syntax tree and
//! folds `common`/`resource` blocks into parameter maps, so rendered text
//! can be reloaded into the model.

use crate::domain::ports::ParameterSchema;
use crate::error::{Error, Result};
use crate::model::block_device::{MetaDisk, MetaDiskIndex};
use crate::model::proxy::{Endpoint, ProxyLink};
use crate::params::schema::{ParamKind, PLUGIN_PREFIX, RESOURCE_SECTION};
use indexmap::IndexMap;
use std::collections::BTreeMap;

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semi,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                tokens.push((Token::Open, line));
                chars.next();
            }
            '}' => {
                tokens.push((Token::Close, line));
                chars.next();
            }
            ';' => {
                tokens.push((Token::Semi, line));
                chars.next();
            }
            '"' => {
                let start = line;
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(Error::ConfigParse {
                                line: start,
                                reason: "unterminated quoted string".into(),
                            })
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => word.push(escaped),
                            None => {
                                return Err(Error::ConfigParse {
                                    line: start,
                                    reason: "unterminated quoted string".into(),
                                })
                            }
                        },
                        Some(c) => {
                            if c == '\n' {
                                line += 1;
                            }
                            word.push(c);
                        }
                    }
                }
                tokens.push((Token::Word(word), start));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '"' | '#') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((Token::Word(word), line));
            }
        }
    }
    Ok(tokens)
}

// =============================================================================
// Syntax Tree
// =============================================================================

/// `keyword args... { items }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    pub keyword: String,
    pub args: Vec<String>,
    pub items: Vec<ConfigItem>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigItem {
    /// `keyword args...;`
    Statement {
        keyword: String,
        args: Vec<String>,
        line: usize,
    },
    Block(ConfigBlock),
}

impl ConfigBlock {
    /// Nested blocks with a keyword
    pub fn blocks<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a ConfigBlock> + 'a {
        self.items.iter().filter_map(move |item| match item {
            ConfigItem::Block(b) if b.keyword == keyword => Some(b),
            _ => None,
        })
    }

    pub fn block<'a>(&'a self, keyword: &'a str) -> Option<&'a ConfigBlock> {
        self.blocks(keyword).next()
    }

    /// Arguments of the first statement with a keyword
    pub fn statement(&self, keyword: &str) -> Option<&[String]> {
        self.items.iter().find_map(|item| match item {
            ConfigItem::Statement { keyword: k, args, .. } if k == keyword => Some(args.as_slice()),
            _ => None,
        })
    }

    /// First argument, e.g. the resource name of `resource r0 { }`
    pub fn name(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// A parsed configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    pub items: Vec<ConfigItem>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut pos = 0;
        let items = parse_items(&tokens, &mut pos, None)?;
        Ok(Self { items })
    }

    pub fn blocks<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a ConfigBlock> + 'a {
        self.items.iter().filter_map(move |item| match item {
            ConfigItem::Block(b) if b.keyword == keyword => Some(b),
            _ => None,
        })
    }

    pub fn global(&self) -> Option<&ConfigBlock> {
        self.blocks("global").next()
    }

    pub fn common(&self) -> Option<&ConfigBlock> {
        self.blocks("common").next()
    }

    pub fn resource(&self, name: &str) -> Option<&ConfigBlock> {
        self.blocks("resource").find(|b| b.name() == Some(name))
    }
}

/// Parse items until the matching close brace (or end of input at top level)
fn parse_items(
    tokens: &[(Token, usize)],
    pos: &mut usize,
    opened_at: Option<usize>,
) -> Result<Vec<ConfigItem>> {
    let mut items = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut start_line = 0;

    while let Some((token, line)) = tokens.get(*pos) {
        *pos += 1;
        match token {
            Token::Word(w) => {
                if words.is_empty() {
                    start_line = *line;
                }
                words.push(w.clone());
            }
            Token::Semi => {
                let mut it = std::mem::take(&mut words).into_iter();
                let Some(keyword) = it.next() else {
                    return Err(Error::ConfigParse {
                        line: *line,
                        reason: "empty statement".into(),
                    });
                };
                items.push(ConfigItem::Statement {
                    keyword,
                    args: it.collect(),
                    line: start_line,
                });
            }
            Token::Open => {
                let mut it = std::mem::take(&mut words).into_iter();
                let Some(keyword) = it.next() else {
                    return Err(Error::ConfigParse {
                        line: *line,
                        reason: "block without a keyword".into(),
                    });
                };
                let block_line = start_line;
                let inner = parse_items(tokens, pos, Some(*line))?;
                items.push(ConfigItem::Block(ConfigBlock {
                    keyword,
                    args: it.collect(),
                    items: inner,
                    line: block_line,
                }));
            }
            Token::Close => {
                if !words.is_empty() {
                    return Err(Error::ConfigParse {
                        line: *line,
                        reason: format!("missing ';' after {}", words.join(" ")),
                    });
                }
                return match opened_at {
                    Some(_) => Ok(items),
                    None => Err(Error::ConfigParse {
                        line: *line,
                        reason: "unexpected '}'".into(),
                    }),
                };
            }
        }
    }

    if !words.is_empty() {
        return Err(Error::ConfigParse {
            line: start_line,
            reason: format!("missing ';' after {}", words.join(" ")),
        });
    }
    match opened_at {
        Some(line) => Err(Error::ConfigParse {
            line,
            reason: "block is not closed".into(),
        }),
        None => Ok(items),
    }
}

// =============================================================================
// Import
// =============================================================================

/// Split `10.0.0.1:7788` or `ipv6 [fd00::1]:7788` into address and port
pub fn parse_address(args: &[String]) -> Option<(String, u16)> {
    let text = match args {
        [family, addr] if family == "ipv6" || family == "ipv4" => addr.as_str(),
        [addr] => addr.as_str(),
        _ => return None,
    };
    let (ip, port) = text.rsplit_once(':')?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    Some((ip.to_string(), port.parse().ok()?))
}

fn parse_endpoint(args: Option<&[String]>) -> Option<Endpoint> {
    let (ip, port) = parse_address(args?)?;
    Some(Endpoint::new(ip, port))
}

/// One volume as found in `on` blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedVolume {
    pub device: Option<String>,
    /// Backing disk per host
    pub disks: BTreeMap<String, String>,
    /// Meta-data placement per host
    pub meta_disks: BTreeMap<String, MetaDisk>,
    /// Volume-level section parameters
    pub params: IndexMap<String, String>,
}

/// Everything recovered from a `resource` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedResource {
    pub name: String,
    pub params: IndexMap<String, String>,
    pub port: Option<u16>,
    pub addresses: BTreeMap<String, String>,
    pub volumes: BTreeMap<u32, ImportedVolume>,
    pub proxy_links: BTreeMap<String, ProxyLink>,
}

fn statement_value(schema: &dyn ParameterSchema, name: &str, args: &[String]) -> String {
    match args.first() {
        Some(value) => value.clone(),
        // a bare flag is a set boolean
        None => match schema.param(name).map(|p| &p.kind) {
            Some(ParamKind::Boolean) => "yes".to_string(),
            _ => String::new(),
        },
    }
}

fn import_plugin_block(schema: &dyn ParameterSchema, block: &ConfigBlock, params: &mut IndexMap<String, String>) {
    for item in &block.items {
        if let ConfigItem::Statement { keyword, args, .. } = item {
            let name = format!("{}{}", PLUGIN_PREFIX, keyword);
            let value = match args.as_slice() {
                [level, n] if level == "level" => n.clone(),
                _ => statement_value(schema, &name, args),
            };
            params.insert(name, value);
        }
    }
}

/// Fold the parameter statements of a `common` or `resource` block into a
/// flat name -> value map. Unknown names are kept so validation can report
/// them.
pub fn import_parameters(schema: &dyn ParameterSchema, block: &ConfigBlock) -> IndexMap<String, String> {
    let mut params = IndexMap::new();
    for item in &block.items {
        match item {
            ConfigItem::Statement { keyword, args, .. } => {
                let is_resource_level = schema
                    .param(keyword)
                    .is_some_and(|p| p.section == RESOURCE_SECTION);
                if is_resource_level {
                    params.insert(keyword.clone(), statement_value(schema, keyword, args));
                }
            }
            ConfigItem::Block(section) => {
                let Some(known) = schema
                    .sections()
                    .iter()
                    .find(|s| !s.is_synthetic() && s.display_name() == section.keyword)
                else {
                    continue;
                };
                for inner in &section.items {
                    match inner {
                        ConfigItem::Statement { keyword, args, .. } => {
                            params.insert(keyword.clone(), statement_value(schema, keyword, args));
                        }
                        ConfigItem::Block(plugin) if known.is_proxy() && plugin.keyword == "plugin" => {
                            import_plugin_block(schema, plugin, &mut params);
                        }
                        ConfigItem::Block(_) => {}
                    }
                }
            }
        }
    }
    params
}

/// `internal`, `/dev/sdd`, `/dev/sdd[2]` or `/dev/sdd [2]`
fn parse_meta_disk(args: &[String], line: usize) -> Result<MetaDisk> {
    let bad = || Error::ConfigParse {
        line,
        reason: format!("bad meta-disk {}", args.join(" ")),
    };
    let (device, index) = match args {
        [internal] if internal == "internal" => return Ok(MetaDisk::Internal),
        [path] => match path.split_once('[') {
            Some(split) => split,
            // an external device without an index is flexible
            None => {
                return Ok(MetaDisk::External {
                    device: path.clone(),
                    index: MetaDiskIndex::Flexible,
                })
            }
        },
        [device, index] => (device.as_str(), index.trim_start_matches('[')),
        _ => return Err(bad()),
    };
    let index = index
        .strip_suffix(']')
        .and_then(|n| n.parse().ok())
        .ok_or_else(bad)?;
    Ok(MetaDisk::External {
        device: device.to_string(),
        index: MetaDiskIndex::Fixed(index),
    })
}

fn import_volume(block: &ConfigBlock, host: &str, volume: &mut ImportedVolume) -> Result<()> {
    if let Some(device) = block.statement("device").and_then(|a| a.first()) {
        volume.device = Some(device.clone());
    }
    if let Some(disk) = block.statement("disk").and_then(|a| a.first()) {
        volume.disks.insert(host.to_string(), disk.clone());
    }
    for item in &block.items {
        let ConfigItem::Statement { keyword, args, line } = item else {
            continue;
        };
        let meta_disk = match keyword.as_str() {
            "meta-disk" => parse_meta_disk(args, *line)?,
            "flexible-meta-disk" => match args.as_slice() {
                [device] => MetaDisk::External {
                    device: device.clone(),
                    index: MetaDiskIndex::Flexible,
                },
                _ => {
                    return Err(Error::ConfigParse {
                        line: *line,
                        reason: "flexible-meta-disk takes one device".into(),
                    })
                }
            },
            _ => continue,
        };
        volume.meta_disks.insert(host.to_string(), meta_disk);
    }
    Ok(())
}

/// Recover a resource: parameters, port, addresses, volumes and proxy links
pub fn import_resource(schema: &dyn ParameterSchema, block: &ConfigBlock) -> Result<ImportedResource> {
    let name = block.name().ok_or_else(|| Error::ConfigParse {
        line: block.line,
        reason: "resource without a name".into(),
    })?;
    let mut imported = ImportedResource {
        name: name.to_string(),
        params: import_parameters(schema, block),
        ..Default::default()
    };

    for on in block.blocks("on") {
        let host = on.name().ok_or_else(|| Error::ConfigParse {
            line: on.line,
            reason: "on block without a host".into(),
        })?;

        let volumes: Vec<&ConfigBlock> = on.blocks("volume").collect();
        if volumes.is_empty() {
            import_volume(on, host, imported.volumes.entry(0).or_default())?;
        }
        for vol in volumes {
            let number = vol
                .name()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| Error::ConfigParse {
                    line: vol.line,
                    reason: "volume number must be an integer".into(),
                })?;
            let volume = imported.volumes.entry(number).or_default();
            import_volume(vol, host, volume)?;
            volume.params.extend(import_parameters(schema, vol));
        }

        if let Some((ip, port)) = on.statement("address").and_then(parse_address) {
            imported.addresses.insert(host.to_string(), ip);
            imported.port.get_or_insert(port);
        }

        if let Some(proxy) = on.block("proxy") {
            let relay = proxy.args.iter().find(|a| a.as_str() != "on");
            if let (Some(relay), Some(inside), Some(outside)) = (
                relay,
                parse_endpoint(proxy.statement("inside")),
                parse_endpoint(proxy.statement("outside")),
            ) {
                imported
                    .proxy_links
                    .insert(host.to_string(), ProxyLink::new(relay.clone(), inside, outside));
            }
        }
    }
    Ok(imported)
}
