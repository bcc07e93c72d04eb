//! Parameter Resolution
//!
//! A parameter's effective value is looked up through an explicit, ordered
//! list of layers, most specific first:
//!
//! ```text
//! VolumeSaved -> ResourceSaved -> ResourceDefault -> Common -> Global -> BuiltinDefault
//! ```
//!
//! The first layer holding a non-empty value wins. The built-in default is
//! taken from the [`ParameterSchema`].
//!
//! This module also owns the resync-after reference walk: candidate lists,
//! cycle checks and detection of cycles already present in saved data.

use super::schema::{AccessLevel, ParamInfo, ParamKind, UnitSpec, RESYNC_AFTER_NONE};
use crate::domain::ports::ParameterSchema;
use crate::error::{Error, Result};
use crate::model::cluster::Cluster;
use crate::model::resource::Resource;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

// =============================================================================
// Scope Chain
// =============================================================================

/// Which configuration layer produced a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    VolumeSaved,
    ResourceSaved,
    ResourceDefault,
    Common,
    Global,
    BuiltinDefault,
}

/// One key -> value mapping in the chain
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a> {
    pub kind: LayerKind,
    pub values: &'a IndexMap<String, String>,
}

/// Ordered lookup layers, most specific first
#[derive(Debug, Clone, Default)]
pub struct ScopeChain<'a> {
    layers: Vec<Layer<'a>>,
}

impl<'a> ScopeChain<'a> {
    /// Chain holding only the built-in defaults
    pub fn builtin() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn for_global(cluster: &'a Cluster) -> Self {
        Self::builtin().with(LayerKind::Global, &cluster.global)
    }

    /// Values inherited by every resource: common, then global
    pub fn for_common(cluster: &'a Cluster) -> Self {
        Self::builtin()
            .with(LayerKind::Common, &cluster.common)
            .with(LayerKind::Global, &cluster.global)
    }

    pub fn for_resource(cluster: &'a Cluster, resource: &'a Resource) -> Self {
        Self::builtin()
            .with(LayerKind::ResourceSaved, &resource.params)
            .with(LayerKind::ResourceDefault, &resource.defaults)
            .with(LayerKind::Common, &cluster.common)
            .with(LayerKind::Global, &cluster.global)
    }

    /// Chain for a volume; unknown volume numbers fall back to the
    /// resource chain
    pub fn for_volume(cluster: &'a Cluster, resource: &'a Resource, volume: u32) -> Self {
        let chain = Self::for_resource(cluster, resource);
        match resource.volumes.get(&volume) {
            Some(vol) => chain.with_front(LayerKind::VolumeSaved, &vol.params),
            None => chain,
        }
    }

    /// Append a less specific layer
    pub fn with(mut self, kind: LayerKind, values: &'a IndexMap<String, String>) -> Self {
        self.layers.push(Layer { kind, values });
        self
    }

    /// Prepend a more specific layer
    pub fn with_front(mut self, kind: LayerKind, values: &'a IndexMap<String, String>) -> Self {
        self.layers.insert(0, Layer { kind, values });
        self
    }

    pub fn layers(&self) -> &[Layer<'a>] {
        &self.layers
    }

    fn lookup(&self, name: &str) -> Option<(&'a str, LayerKind)> {
        self.layers.iter().find_map(|layer| {
            layer
                .values
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| (v.as_str(), layer.kind))
        })
    }
}

/// Effective value and the layer it came from. An empty value means no
/// layer, not even the schema, provides one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub source: LayerKind,
}

impl Resolved {
    pub fn is_set(&self) -> bool {
        !self.value.is_empty()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves values against a schema
pub struct ParamResolver<'s> {
    schema: &'s dyn ParameterSchema,
}

impl<'s> ParamResolver<'s> {
    pub fn new(schema: &'s dyn ParameterSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &'s dyn ParameterSchema {
        self.schema
    }

    pub fn info(&self, name: &str) -> Result<&'s ParamInfo> {
        self.schema.param(name).ok_or_else(|| Error::ParameterNotFound {
            name: name.to_string(),
        })
    }

    /// Effective value of `name` through `chain`
    pub fn resolve(&self, name: &str, chain: &ScopeChain<'_>) -> Result<Resolved> {
        let info = self.info(name)?;
        Ok(match chain.lookup(name) {
            Some((value, source)) => Resolved {
                value: value.to_string(),
                source,
            },
            None => Resolved {
                value: info.default.clone().unwrap_or_default(),
                source: LayerKind::BuiltinDefault,
            },
        })
    }

    /// Value to emit when the effective value through `chain` differs from
    /// the one inherited through `baseline`; `None` otherwise
    pub fn deviation(
        &self,
        name: &str,
        chain: &ScopeChain<'_>,
        baseline: &ScopeChain<'_>,
    ) -> Result<Option<String>> {
        let info = self.info(name)?;
        let effective = self.resolve(name, chain)?;
        if !effective.is_set() {
            return Ok(None);
        }
        let inherited = self.resolve(name, baseline)?;
        if values_equal(info, &effective.value, &inherited.value) {
            Ok(None)
        } else {
            Ok(Some(effective.value))
        }
    }

    /// A parameter counts as advanced when the schema marks it so and its
    /// effective value is unchanged from the built-in default
    pub fn is_advanced(&self, name: &str, chain: &ScopeChain<'_>) -> Result<bool> {
        let info = self.info(name)?;
        if !info.advanced {
            return Ok(false);
        }
        let effective = self.resolve(name, chain)?;
        let default = info.default.as_deref().unwrap_or_default();
        Ok(values_equal(info, &effective.value, default))
    }

    pub fn is_checkbox(&self, name: &str) -> Result<bool> {
        Ok(self.info(name)?.is_checkbox())
    }

    pub fn unit_of(&self, name: &str) -> Result<Option<&'s UnitSpec>> {
        Ok(self.info(name)?.unit())
    }

    pub fn is_enabled_for(&self, name: &str, level: AccessLevel) -> Result<bool> {
        Ok(self.info(name)?.is_enabled_for(level))
    }
}

// =============================================================================
// Value Comparison
// =============================================================================

/// Split a sized value into number and optional suffix, e.g. `250K`
pub fn split_unit(value: &str) -> Option<(i64, Option<char>)> {
    let value = value.trim();
    let last = value.chars().last()?;
    if last.is_ascii_alphabetic() {
        let number = value[..value.len() - last.len_utf8()].trim().parse().ok()?;
        Some((number, Some(last.to_ascii_uppercase())))
    } else {
        Some((value.parse().ok()?, None))
    }
}

/// Sized value in KiB; a missing suffix means the unit's default suffix
pub fn to_kib(unit: &UnitSpec, value: &str) -> Option<i64> {
    let (number, suffix) = split_unit(value)?;
    let suffix = suffix.unwrap_or(unit.default_suffix);
    if !unit.allowed.contains(&suffix) {
        return None;
    }
    number.checked_mul(UnitSpec::multiplier(suffix)?)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" => Some(true),
        "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Compare two values the way the daemon would: sized numbers by their KiB
/// value, booleans by truth, everything else textually
pub fn values_equal(info: &ParamInfo, a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match &info.kind {
        ParamKind::Numeric { unit: Some(unit), .. } => {
            matches!((to_kib(unit, a), to_kib(unit, b)), (Some(x), Some(y)) if x == y)
        }
        ParamKind::Numeric { unit: None, .. } => {
            matches!((a.trim().parse::<i64>(), b.trim().parse::<i64>()), (Ok(x), Ok(y)) if x == y)
        }
        ParamKind::Boolean => {
            // an unset boolean reads as "no"
            let a = if a.is_empty() { Some(false) } else { parse_bool(a) };
            let b = if b.is_empty() { Some(false) } else { parse_bool(b) };
            a.is_some() && a == b
        }
        ParamKind::ResyncAfter => {
            let norm = |v: &str| if v.is_empty() { RESYNC_AFTER_NONE.to_string() } else { v.to_string() };
            norm(a) == norm(b)
        }
        _ => false,
    }
}

// =============================================================================
// Resync-after References
// =============================================================================

/// Follow the resync-after chain starting at `start`. Dangling names end
/// the walk. Returns the visited names in order and whether the walk came
/// back to a name already visited.
fn walk_resync_chain<'c>(cluster: &'c Cluster, start: &'c str) -> (Vec<&'c str>, bool) {
    let param = cluster.syntax.resync_after_param();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut order = Vec::new();
    let mut current = start;
    loop {
        if !visited.insert(current) {
            order.push(current);
            return (order, true);
        }
        order.push(current);
        let Some(next) = cluster
            .resources
            .get(current)
            .and_then(|r| r.resync_after(param))
        else {
            return (order, false);
        };
        if !cluster.resources.contains_key(next) {
            return (order, false);
        }
        current = next;
    }
}

/// Whether the chain starting at `from` reaches `target`
pub fn chain_reaches(cluster: &Cluster, from: &str, target: &str) -> bool {
    walk_resync_chain(cluster, from).0.contains(&target)
}

/// Refuse `target` as resync-after of `resource` when it would close a cycle
pub fn check_resync_after(cluster: &Cluster, resource: &str, target: &str) -> Result<()> {
    if target == RESYNC_AFTER_NONE || target.is_empty() {
        return Ok(());
    }
    if target == resource || chain_reaches(cluster, target, resource) {
        return Err(Error::CyclicResyncAfter {
            resource: resource.to_string(),
            target: target.to_string(),
        });
    }
    Ok(())
}

/// Selectable resync-after values for `resource`: `none` followed by every
/// other resource whose chain does not reach back to `resource`
pub fn resync_after_candidates(cluster: &Cluster, resource: &str) -> Vec<String> {
    let mut candidates = vec![RESYNC_AFTER_NONE.to_string()];
    candidates.extend(
        cluster
            .resources
            .keys()
            .filter(|name| name.as_str() != resource)
            .filter(|name| !chain_reaches(cluster, name, resource))
            .cloned(),
    );
    candidates
}

/// Cycles already present in saved data. Each cycle is listed once,
/// starting at its alphabetically first member.
pub fn persisted_resync_cycles(cluster: &Cluster) -> Vec<Vec<String>> {
    let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();
    for name in cluster.resources.keys() {
        let (order, cyclic) = walk_resync_chain(cluster, name);
        if !cyclic {
            continue;
        }
        let Some(&repeat) = order.last() else { continue };
        let Some(start) = order.iter().position(|n| *n == repeat) else {
            continue;
        };
        let mut cycle: Vec<String> = order[start..order.len() - 1]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(min) = cycle
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i)
        {
            cycle.rotate_left(min);
        }
        if seen.insert(cycle.clone()) {
            warn!("Persisted resync-after cycle: {}", cycle.join(" -> "));
        }
    }
    seen.into_iter().collect()
}

impl Cluster {
    /// Data-integrity warnings for saved resync-after cycles
    pub fn persisted_resync_cycles(&self) -> Vec<Vec<String>> {
        persisted_resync_cycles(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DrbdSyntax;
    use crate::params::schema::DrbdSchema;

    fn cluster_with(resources: &[(&str, &str)]) -> Cluster {
        let mut cluster = Cluster::new("test", DrbdSyntax::Modern);
        for (name, after) in resources {
            let mut resource = Resource::new(*name);
            resource.params.insert("resync-after".into(), after.to_string());
            cluster.resources.insert(name.to_string(), resource);
        }
        cluster
    }

    #[test]
    fn test_resolve_precedence() {
        let schema = DrbdSchema::modern();
        let resolver = ParamResolver::new(&schema);
        let mut cluster = cluster_with(&[("r0", "none")]);
        cluster.global.insert("timeout".into(), "70".into());

        let resource = cluster.resources.get("r0").unwrap().clone();
        let chain = ScopeChain::for_resource(&cluster, &resource);
        let resolved = resolver.resolve("timeout", &chain).unwrap();
        assert_eq!(resolved.value, "70");
        assert_eq!(resolved.source, LayerKind::Global);

        cluster.common.insert("timeout".into(), "80".into());
        let mut resource = resource;
        resource.defaults.insert("timeout".into(), "85".into());
        let chain = ScopeChain::for_resource(&cluster, &resource);
        assert_eq!(resolver.resolve("timeout", &chain).unwrap().value, "85");

        resource.params.insert("timeout".into(), "90".into());
        let chain = ScopeChain::for_resource(&cluster, &resource);
        let resolved = resolver.resolve("timeout", &chain).unwrap();
        assert_eq!(resolved.value, "90");
        assert_eq!(resolved.source, LayerKind::ResourceSaved);
    }

    #[test]
    fn test_empty_value_means_nothing_selected() {
        let schema = DrbdSchema::modern();
        let resolver = ParamResolver::new(&schema);
        let mut cluster = cluster_with(&[]);
        cluster.common.insert("timeout".into(), String::new());
        let chain = ScopeChain::for_common(&cluster);
        let resolved = resolver.resolve("timeout", &chain).unwrap();
        assert_eq!(resolved.value, "60");
        assert_eq!(resolved.source, LayerKind::BuiltinDefault);
    }

    #[test]
    fn test_unknown_param_is_not_found() {
        let schema = DrbdSchema::modern();
        let resolver = ParamResolver::new(&schema);
        let result = resolver.resolve("no-such-thing", &ScopeChain::builtin());
        assert!(matches!(result, Err(Error::ParameterNotFound { .. })));
    }

    #[test]
    fn test_unit_aware_equality() {
        let schema = DrbdSchema::modern();
        let rate = schema.param("resync-rate").unwrap();
        assert!(values_equal(rate, "250", "250K"));
        assert!(values_equal(rate, "1M", "1024K"));
        assert!(!values_equal(rate, "1M", "1000K"));

        let flag = schema.param("disk-barrier").unwrap();
        assert!(values_equal(flag, "no", ""));
        assert!(values_equal(flag, "yes", "true"));
    }

    #[test]
    fn test_deviation_against_baseline() {
        let schema = DrbdSchema::modern();
        let resolver = ParamResolver::new(&schema);
        let mut cluster = cluster_with(&[("r0", "none")]);
        cluster.common.insert("timeout".into(), "90".into());
        let mut resource = cluster.resources.get("r0").unwrap().clone();
        resource.params.insert("timeout".into(), "90".into());
        resource.params.insert("resync-rate".into(), "250".into());

        let chain = ScopeChain::for_resource(&cluster, &resource);
        let baseline = ScopeChain::for_common(&cluster);
        assert_eq!(resolver.deviation("timeout", &chain, &baseline).unwrap(), None);
        assert_eq!(resolver.deviation("resync-rate", &chain, &baseline).unwrap(), None);

        resource.params.insert("timeout".into(), "100".into());
        let chain = ScopeChain::for_resource(&cluster, &resource);
        assert_eq!(
            resolver.deviation("timeout", &chain, &baseline).unwrap(),
            Some("100".to_string())
        );
    }

    #[test]
    fn test_is_advanced_tracks_default() {
        let schema = DrbdSchema::modern();
        let resolver = ParamResolver::new(&schema);
        let mut cluster = cluster_with(&[]);
        assert!(resolver.is_advanced("timeout", &ScopeChain::for_common(&cluster)).unwrap());
        cluster.common.insert("timeout".into(), "99".into());
        assert!(!resolver.is_advanced("timeout", &ScopeChain::for_common(&cluster)).unwrap());
        assert!(!resolver.is_advanced("protocol", &ScopeChain::builtin()).unwrap());
    }

    #[test]
    fn test_candidates_exclude_self_and_back_references() {
        // r2 -> r1 -> r0, r3 independent
        let cluster = cluster_with(&[("r0", "none"), ("r1", "r0"), ("r2", "r1"), ("r3", "none")]);
        let candidates = resync_after_candidates(&cluster, "r0");
        assert_eq!(candidates, vec!["none", "r3"]);

        let candidates = resync_after_candidates(&cluster, "r2");
        assert_eq!(candidates, vec!["none", "r0", "r1", "r3"]);
    }

    #[test]
    fn test_dangling_reference_is_none() {
        let cluster = cluster_with(&[("r0", "gone"), ("r1", "r0")]);
        assert!(check_resync_after(&cluster, "r0", "r1").is_err());
        assert!(check_resync_after(&cluster, "r1", "none").is_ok());
        assert!(!chain_reaches(&cluster, "r0", "gone"));
    }

    #[test]
    fn test_persisted_cycles_reported_once() {
        let cluster = cluster_with(&[("a", "b"), ("b", "c"), ("c", "a"), ("d", "a")]);
        let cycles = cluster.persisted_resync_cycles();
        assert_eq!(cycles, vec![vec!["a".to_string(), "b".into(), "c".into()]]);

        let clean = cluster_with(&[("a", "none"), ("b", "a")]);
        assert!(clean.persisted_resync_cycles().is_empty());
    }
}
