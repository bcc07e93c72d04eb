//! DRBD Parameter Schema
//!
//! Static metadata for every configurable DRBD parameter: the section it
//! lives in, its value kind, default, unit and access gate. The built-in
//! [`DrbdSchema`] covers both the 8.3 (legacy) and 8.4 (modern) grammars.

use crate::domain::ports::{DrbdSyntax, ParameterSchema};
use indexmap::IndexMap;
use regex::Regex;

// =============================================================================
// Constants
// =============================================================================

/// Prefix marking proxy plugin parameters
pub const PLUGIN_PREFIX: &str = "plugin-";

/// Sentinel meaning "no resync-after dependency"
pub const RESYNC_AFTER_NONE: &str = "none";

/// Section holding resource-level parameters; never rendered as a block
pub const RESOURCE_SECTION: &str = "resource";

/// Section holding `global { }` parameters
pub const GLOBAL_SECTION: &str = "global";

/// Section holding proxy options
pub const PROXY_SECTION: &str = "proxy-options";

// =============================================================================
// Access Level
// =============================================================================

/// Operator privilege needed to see/edit a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    ReadOnly,
    Operator,
    #[default]
    Admin,
    God,
}

// =============================================================================
// Units
// =============================================================================

/// Size unit handling for numeric parameters. Values are compared in KiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// Unit assumed when a value carries no suffix
    pub default_suffix: char,
    /// Accepted suffixes (upper case)
    pub allowed: Vec<char>,
}

impl UnitSpec {
    fn sizes(default_suffix: char) -> Self {
        Self {
            default_suffix,
            allowed: vec!['K', 'M', 'G'],
        }
    }

    /// Multiplier of a suffix relative to KiB
    pub fn multiplier(suffix: char) -> Option<i64> {
        match suffix.to_ascii_uppercase() {
            'K' => Some(1),
            'M' => Some(1024),
            'G' => Some(1024 * 1024),
            _ => None,
        }
    }
}

// =============================================================================
// Parameter Kind
// =============================================================================

/// The value domain of a parameter
#[derive(Debug, Clone)]
pub enum ParamKind {
    /// yes/no; rendered as a flag or `yes`/`no` depending on syntax
    Boolean,
    /// Integer in `[min, max]`, optionally with a unit suffix
    Numeric {
        min: i64,
        max: i64,
        unit: Option<UnitSpec>,
    },
    /// One of a fixed set of words
    Enum(Vec<String>),
    /// Free text, optionally constrained by a regex
    Text { pattern: Option<Regex> },
    /// Shell command run by the daemon on an event
    Handler,
    /// Name of another resource, or `none`
    ResyncAfter,
}

// =============================================================================
// Parameter Info
// =============================================================================

/// Metadata for a single parameter
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub section: String,
    pub kind: ParamKind,
    pub default: Option<String>,
    pub required: bool,
    pub advanced: bool,
    pub access: AccessLevel,
    pub description: String,
}

impl ParamInfo {
    pub fn is_checkbox(&self) -> bool {
        matches!(self.kind, ParamKind::Boolean)
    }

    pub fn is_plugin(&self) -> bool {
        self.name.starts_with(PLUGIN_PREFIX)
    }

    /// Plugin name without the prefix, e.g. `zlib` for `plugin-zlib`
    pub fn plugin_name(&self) -> Option<&str> {
        self.name.strip_prefix(PLUGIN_PREFIX)
    }

    pub fn is_resync_after(&self) -> bool {
        matches!(self.kind, ParamKind::ResyncAfter)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, ParamKind::Numeric { .. })
    }

    pub fn unit(&self) -> Option<&UnitSpec> {
        match &self.kind {
            ParamKind::Numeric { unit, .. } => unit.as_ref(),
            _ => None,
        }
    }

    /// Whether an operator with `level` may see and edit this parameter
    pub fn is_enabled_for(&self, level: AccessLevel) -> bool {
        level >= self.access
    }
}

// =============================================================================
// Section
// =============================================================================

/// A configuration section, e.g. `net-options`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Name used in the configuration file (`net-options` -> `net`)
    pub fn display_name(&self) -> &str {
        self.name.strip_suffix("-options").unwrap_or(&self.name)
    }

    /// `resource` and `global` hold parameters but are not rendered as
    /// nested section blocks
    pub fn is_synthetic(&self) -> bool {
        self.name == RESOURCE_SECTION || self.name == GLOBAL_SECTION
    }

    pub fn is_proxy(&self) -> bool {
        self.name == PROXY_SECTION
    }
}

// =============================================================================
// Built-in Table
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Availability {
    Both,
    Legacy,
    Modern,
}

impl Availability {
    fn includes(self, syntax: DrbdSyntax) -> bool {
        match self {
            Availability::Both => true,
            Availability::Legacy => syntax == DrbdSyntax::Legacy,
            Availability::Modern => syntax == DrbdSyntax::Modern,
        }
    }
}

struct Entry {
    avail: Availability,
    info: ParamInfo,
}

struct TableBuilder {
    entries: Vec<Entry>,
    section: &'static str,
}

impl TableBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            section: GLOBAL_SECTION,
        }
    }

    fn section(&mut self, name: &'static str) -> &mut Self {
        self.section = name;
        self
    }

    fn push(
        &mut self,
        avail: Availability,
        name: &str,
        kind: ParamKind,
        default: Option<&str>,
        access: AccessLevel,
        advanced: bool,
        description: &str,
    ) -> &mut Self {
        self.entries.push(Entry {
            avail,
            info: ParamInfo {
                name: name.to_string(),
                section: self.section.to_string(),
                kind,
                default: default.map(str::to_string),
                required: false,
                advanced,
                access,
                description: description.to_string(),
            },
        });
        self
    }

    fn boolean(&mut self, avail: Availability, name: &str, default: &str, advanced: bool, description: &str) -> &mut Self {
        self.push(avail, name, ParamKind::Boolean, Some(default), AccessLevel::Admin, advanced, description)
    }

    fn numeric(
        &mut self,
        avail: Availability,
        name: &str,
        min: i64,
        max: i64,
        default: Option<&str>,
        advanced: bool,
        description: &str,
    ) -> &mut Self {
        self.push(
            avail,
            name,
            ParamKind::Numeric { min, max, unit: None },
            default,
            AccessLevel::Admin,
            advanced,
            description,
        )
    }

    fn sized(
        &mut self,
        avail: Availability,
        name: &str,
        max: i64,
        default: Option<&str>,
        default_suffix: char,
        description: &str,
    ) -> &mut Self {
        self.push(
            avail,
            name,
            ParamKind::Numeric {
                min: 0,
                max,
                unit: Some(UnitSpec::sizes(default_suffix)),
            },
            default,
            AccessLevel::Admin,
            true,
            description,
        )
    }

    fn choice(
        &mut self,
        avail: Availability,
        name: &str,
        values: &[&str],
        default: Option<&str>,
        advanced: bool,
        description: &str,
    ) -> &mut Self {
        self.push(
            avail,
            name,
            ParamKind::Enum(values.iter().map(|v| v.to_string()).collect()),
            default,
            AccessLevel::Admin,
            advanced,
            description,
        )
    }

    fn text(&mut self, avail: Availability, name: &str, pattern: Option<&str>, description: &str) -> &mut Self {
        let pattern = pattern.and_then(|p| Regex::new(p).ok());
        self.push(avail, name, ParamKind::Text { pattern }, None, AccessLevel::Admin, true, description)
    }

    fn handler(&mut self, name: &str, description: &str) -> &mut Self {
        self.push(Availability::Both, name, ParamKind::Handler, None, AccessLevel::God, true, description)
    }

    /// Mark the most recently pushed entry as required
    fn required(&mut self) -> &mut Self {
        if let Some(last) = self.entries.last_mut() {
            last.info.required = true;
        }
        self
    }

    /// Override the access level of the most recently pushed entry
    fn access(&mut self, level: AccessLevel) -> &mut Self {
        if let Some(last) = self.entries.last_mut() {
            last.info.access = level;
        }
        self
    }
}

const AFTER_SB_0PRI: &[&str] = &[
    "disconnect",
    "discard-younger-primary",
    "discard-older-primary",
    "discard-zero-changes",
    "discard-least-changes",
    "discard-local",
    "discard-remote",
];
const AFTER_SB_1PRI: &[&str] = &[
    "disconnect",
    "consensus",
    "violently-as0p",
    "discard-secondary",
    "call-pri-lost-after-sb",
];
const AFTER_SB_2PRI: &[&str] = &["disconnect", "violently-as0p", "call-pri-lost-after-sb"];
const DIGESTS: &[&str] = &["sha1", "md5", "crc32c"];

fn builtin_table() -> Vec<Entry> {
    use Availability::*;

    let mut t = TableBuilder::new();

    t.section(GLOBAL_SECTION)
        .choice(Both, "usage-count", &["yes", "no", "ask"], Some("ask"), false, "Participate in the online usage counter")
        .boolean(Both, "disable-ip-verification", "no", true, "Skip the check that the local address exists")
        .numeric(Both, "minor-count", 1, 1_048_576, None, true, "Number of minors to preallocate")
        .numeric(Both, "dialog-refresh", 0, 600, Some("1"), true, "Refresh interval of the startup dialog");

    t.section(RESOURCE_SECTION)
        .choice(Legacy, "protocol", &["A", "B", "C"], Some("C"), false, "Replication protocol")
        .required()
        .access(AccessLevel::Operator);

    t.section("options")
        .text(Modern, "cpu-mask", Some(r"^[0-9a-fA-F,]*$"), "CPU affinity mask of the kernel threads")
        .choice(Modern, "on-no-data-accessible", &["io-error", "suspend-io"], Some("io-error"), true, "Behaviour when no up-to-date data is reachable");

    t.section("net-options")
        .choice(Modern, "protocol", &["A", "B", "C"], Some("C"), false, "Replication protocol")
        .required()
        .access(AccessLevel::Operator)
        .boolean(Both, "allow-two-primaries", "no", false, "Allow both nodes to be primary")
        .choice(Both, "cram-hmac-alg", DIGESTS, None, true, "Peer authentication digest")
        .text(Both, "shared-secret", Some(r"^\S{0,64}$"), "Peer authentication secret")
        .choice(Both, "after-sb-0pri", AFTER_SB_0PRI, Some("disconnect"), false, "Split-brain policy with no primaries")
        .choice(Both, "after-sb-1pri", AFTER_SB_1PRI, Some("disconnect"), false, "Split-brain policy with one primary")
        .choice(Both, "after-sb-2pri", AFTER_SB_2PRI, Some("disconnect"), false, "Split-brain policy with two primaries")
        .boolean(Both, "always-asbp", "no", true, "Apply split-brain policies even with unrelated generations")
        .choice(Both, "rr-conflict", &["disconnect", "call-pri-lost", "violently"], Some("disconnect"), true, "Resync-role conflict policy")
        .numeric(Both, "max-buffers", 32, 131_072, Some("2048"), true, "Receive buffers per device")
        .numeric(Both, "max-epoch-size", 1, 20_000, Some("2048"), true, "Write requests per barrier")
        .sized(Both, "sndbuf-size", 10_240, Some("0"), 'K', "TCP send buffer size")
        .numeric(Both, "timeout", 1, 600, Some("60"), true, "Peer response timeout in tenths of a second")
        .numeric(Both, "connect-int", 1, 120, Some("10"), true, "Seconds between connection attempts")
        .numeric(Both, "ping-int", 1, 120, Some("10"), true, "Seconds between keep-alive pings")
        .numeric(Both, "ko-count", 0, 200, Some("7"), true, "Timeouts before the peer is expelled")
        .choice(Both, "data-integrity-alg", DIGESTS, None, true, "End-to-end data digest")
        .choice(Modern, "verify-alg", DIGESTS, None, true, "Online verify digest")
        .choice(Modern, "csums-alg", DIGESTS, None, true, "Checksum-based resync digest");

    t.section("disk-options")
        .choice(Both, "on-io-error", &["pass_on", "call-local-io-error", "detach"], Some("detach"), false, "Lower-level I/O error policy")
        .choice(Both, "fencing", &["dont-care", "resource-only", "resource-and-stonith"], Some("dont-care"), false, "Fencing policy")
        .push(Modern, "resync-after", ParamKind::ResyncAfter, Some(RESYNC_AFTER_NONE), AccessLevel::Admin, false, "Resource that must finish syncing first")
        .sized(Modern, "resync-rate", 4_194_304, Some("250K"), 'K', "Resync bandwidth limit")
        .numeric(Modern, "al-extents", 7, 6433, Some("1237"), true, "Activity log size")
        .numeric(Modern, "c-plan-ahead", 0, 300, Some("20"), true, "Dynamic resync controller planning horizon")
        .sized(Modern, "c-max-rate", 4_194_304, Some("102400K"), 'K', "Dynamic resync controller rate cap")
        .boolean(Modern, "disk-barrier", "no", true, "Use barriers for write ordering")
        .boolean(Modern, "disk-flushes", "yes", true, "Use disk flushes for write ordering")
        .boolean(Modern, "md-flushes", "yes", true, "Flush meta-data writes")
        .boolean(Legacy, "no-disk-barrier", "no", true, "Do not use barriers")
        .boolean(Legacy, "no-disk-flushes", "no", true, "Do not use disk flushes")
        .boolean(Legacy, "no-md-flushes", "no", true, "Do not flush meta-data writes");

    t.section("syncer")
        .sized(Legacy, "rate", 4_194_304, Some("250K"), 'K', "Resync bandwidth limit")
        .push(Legacy, "after", ParamKind::ResyncAfter, Some(RESYNC_AFTER_NONE), AccessLevel::Admin, false, "Resource that must finish syncing first")
        .numeric(Legacy, "al-extents", 7, 3843, Some("127"), true, "Activity log size")
        .choice(Legacy, "verify-alg", DIGESTS, None, true, "Online verify digest")
        .choice(Legacy, "csums-alg", DIGESTS, None, true, "Checksum-based resync digest");

    t.section("startup")
        .numeric(Both, "wfc-timeout", 0, 300, Some("0"), false, "Seconds to wait for the peer at boot")
        .numeric(Both, "degr-wfc-timeout", 0, 300, Some("0"), false, "Wait time when the cluster was degraded")
        .numeric(Both, "outdated-wfc-timeout", 0, 300, Some("0"), true, "Wait time when the peer was outdated")
        .boolean(Both, "wait-after-sb", "no", true, "Keep waiting after a split-brain")
        .text(Both, "become-primary-on", Some(r"^[A-Za-z0-9_.\- ]*$"), "Hosts promoted automatically at startup");

    t.section("handlers")
        .handler("pri-on-incon-degr", "Run when a degraded primary has inconsistent data")
        .handler("pri-lost-after-sb", "Run when a primary loses after split-brain")
        .handler("local-io-error", "Run on a lower-level I/O error")
        .handler("split-brain", "Run when split-brain is detected")
        .handler("fence-peer", "Run to fence the peer")
        .handler("before-resync-target", "Run before becoming sync target")
        .handler("after-resync-target", "Run after a resync as target");

    t.section(PROXY_SECTION)
        .sized(Both, "memlimit", 1_048_576, Some("16M"), 'M', "Proxy buffer memory")
        .numeric(Both, "read-loops", 0, 64, None, true, "Socket reads per event loop iteration")
        .numeric(Both, "plugin-zlib", 1, 9, None, true, "zlib compression level")
        .numeric(Both, "plugin-lz4", 1, 16, None, true, "lz4 compression level")
        .boolean(Both, "plugin-debug", "no", true, "Log every relayed packet")
        .boolean(Both, "plugin-noop", "no", true, "Pass-through plugin");

    t.entries
}

// =============================================================================
// Drbd Schema
// =============================================================================

/// The built-in DRBD parameter catalogue for one grammar generation
#[derive(Debug, Clone)]
pub struct DrbdSchema {
    syntax: DrbdSyntax,
    sections: Vec<Section>,
    params: IndexMap<String, ParamInfo>,
}

impl DrbdSchema {
    /// Build the catalogue for a syntax
    pub fn builtin(syntax: DrbdSyntax) -> Self {
        let mut sections: Vec<Section> = Vec::new();
        let mut params = IndexMap::new();

        for entry in builtin_table() {
            if !entry.avail.includes(syntax) {
                continue;
            }
            if !sections.iter().any(|s| s.name == entry.info.section) {
                sections.push(Section::new(entry.info.section.clone()));
            }
            params.insert(entry.info.name.clone(), entry.info);
        }

        Self {
            syntax,
            sections,
            params,
        }
    }

    pub fn modern() -> Self {
        Self::builtin(DrbdSyntax::Modern)
    }

    pub fn legacy() -> Self {
        Self::builtin(DrbdSyntax::Legacy)
    }

    /// Every parameter in declaration order
    pub fn params(&self) -> impl Iterator<Item = &ParamInfo> {
        self.params.values()
    }
}

impl ParameterSchema for DrbdSchema {
    fn syntax(&self) -> DrbdSyntax {
        self.syntax
    }

    fn param(&self, name: &str) -> Option<&ParamInfo> {
        self.params.get(name)
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn section_params(&self, section: &str) -> Vec<&ParamInfo> {
        self.params.values().filter(|p| p.section == section).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_display_name() {
        assert_eq!(Section::new("net-options").display_name(), "net");
        assert_eq!(Section::new("proxy-options").display_name(), "proxy");
        assert_eq!(Section::new("startup").display_name(), "startup");
        assert!(Section::new("resource").is_synthetic());
        assert!(Section::new("global").is_synthetic());
        assert!(!Section::new("handlers").is_synthetic());
    }

    #[test]
    fn test_modern_schema_layout() {
        let schema = DrbdSchema::modern();
        assert_eq!(schema.syntax(), DrbdSyntax::Modern);

        let protocol = schema.param("protocol").unwrap();
        assert_eq!(protocol.section, "net-options");
        assert!(protocol.required);

        assert!(schema.param("resync-after").unwrap().is_resync_after());
        assert!(schema.param("after").is_none());
        assert!(schema.param("no-disk-barrier").is_none());
        assert!(!schema.sections().iter().any(|s| s.name == "syncer"));
    }

    #[test]
    fn test_legacy_schema_layout() {
        let schema = DrbdSchema::legacy();
        assert_eq!(schema.param("protocol").unwrap().section, RESOURCE_SECTION);
        assert_eq!(schema.param("after").unwrap().section, "syncer");
        assert!(schema.param("resync-after").is_none());
        assert!(schema.param("no-disk-barrier").unwrap().is_checkbox());
    }

    #[test]
    fn test_section_order_is_declaration_order() {
        let schema = DrbdSchema::modern();
        let names: Vec<&str> = schema.sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"global"));
        let net = names.iter().position(|n| *n == "net-options").unwrap();
        let disk = names.iter().position(|n| *n == "disk-options").unwrap();
        assert!(net < disk);
        assert_eq!(names.last(), Some(&"proxy-options"));
    }

    #[test]
    fn test_plugin_params() {
        let schema = DrbdSchema::modern();
        let zlib = schema.param("plugin-zlib").unwrap();
        assert!(zlib.is_plugin());
        assert_eq!(zlib.plugin_name(), Some("zlib"));
        assert!(!schema.param("memlimit").unwrap().is_plugin());
    }

    #[test]
    fn test_access_gate() {
        let schema = DrbdSchema::modern();
        let handler = schema.param("split-brain").unwrap();
        assert!(!handler.is_enabled_for(AccessLevel::Admin));
        assert!(handler.is_enabled_for(AccessLevel::God));
        assert!(schema.param("protocol").unwrap().is_enabled_for(AccessLevel::Operator));
    }
}
