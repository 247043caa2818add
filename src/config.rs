use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metric::ProcessorType;

/// Longest accepted node, group, or filter name.
pub const MAX_NAME_LEN: usize = 30;
/// Largest number of items a single filter range may expand to.
pub const MAX_RANGE_ITEMS: u32 = 100;
/// Filter used by nodes that do not name one.
pub const DEFAULT_FILTER_ITEM: &str = "AIR_BASE";

const RANGE_SEPARATOR: &str = "...";

/// Top-level configuration for the AIR engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine-wide defaults, inherited by groups and nodes.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Node groups with optional per-group overrides.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Named filter item lists.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Instrumentation points.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Snapshot output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Engine-wide defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Compile-in switch for the whole engine. Default: true.
    #[serde(default = "default_true")]
    pub air_build: bool,

    /// Whether nodes allocate slots. Default: true.
    #[serde(default = "default_true")]
    pub node_build: bool,

    /// Whether nodes record at startup. Default: true.
    #[serde(default = "default_true")]
    pub node_run: bool,

    /// Queue sampling rate: one sample per N calls. Default: 1000.
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: u32,

    /// App ids tracked per node and thread. Default: 10.
    #[serde(default = "default_index_size")]
    pub index_size: usize,

    /// Analysis period, whole seconds in 1..=30. Default: 1s.
    #[serde(default = "default_streaming_interval", with = "humantime_serde")]
    pub streaming_interval: Duration,

    /// App ids kept in latency statistics per node. Default: 32.
    #[serde(default = "default_aid_size")]
    pub aid_size: usize,
}

/// Node group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    #[serde(default)]
    pub node_build: Option<bool>,

    #[serde(default)]
    pub node_run: Option<bool>,

    #[serde(default)]
    pub sampling_ratio: Option<u32>,

    #[serde(default)]
    pub index_size: Option<usize>,
}

/// Named filter. Items may be plain names or ranges such as
/// `"AIR_0 ... AIR_3"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    pub items: Vec<String>,
}

/// One instrumentation point.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub ptype: ProcessorType,

    /// Filter name. Default: a single `AIR_BASE` item.
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub build: Option<bool>,

    #[serde(default)]
    pub run: Option<bool>,

    #[serde(default)]
    pub sampling_ratio: Option<u32>,

    #[serde(default)]
    pub index_size: Option<usize>,
}

/// Snapshot output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Write every snapshot to this file (pretty JSON, replaced atomically).
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /snapshot. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Node settings after group and default fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub name: String,
    pub ptype: ProcessorType,
    pub filter_name: String,
    pub filter_items: Vec<String>,
    pub group: Option<String>,
    pub build: bool,
    pub run: bool,
    pub sampling_ratio: u32,
    pub index_size: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sampling_ratio() -> u32 {
    1000
}

fn default_index_size() -> usize {
    10
}

fn default_streaming_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_aid_size() -> usize {
    32
}

fn default_health_addr() -> String {
    ":9091".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            defaults: DefaultsConfig::default(),
            groups: Vec::new(),
            filters: Vec::new(),
            nodes: Vec::new(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            air_build: true,
            node_build: true,
            node_run: true,
            sampling_ratio: default_sampling_ratio(),
            index_size: default_index_size(),
            streaming_interval: default_streaming_interval(),
            aid_size: default_aid_size(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("loading config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let defaults = &self.defaults;
        validate_sampling_ratio("defaults.sampling_ratio", defaults.sampling_ratio)?;
        validate_index_size("defaults.index_size", defaults.index_size)?;

        let interval = defaults.streaming_interval;
        if interval.subsec_nanos() != 0 {
            bail!(
                "defaults.streaming_interval {:?} must be whole seconds",
                interval
            );
        }
        if !(1..=30).contains(&interval.as_secs()) {
            bail!(
                "defaults.streaming_interval {:?} must be between 1s and 30s",
                interval
            );
        }

        if defaults.aid_size == 0 {
            bail!("defaults.aid_size must be positive");
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            validate_name("group", &group.name)?;
            if !group_names.insert(group.name.as_str()) {
                bail!("duplicate group name {:?}", group.name);
            }
            if let Some(ratio) = group.sampling_ratio {
                validate_sampling_ratio(&format!("group {:?} sampling_ratio", group.name), ratio)?;
            }
            if let Some(size) = group.index_size {
                validate_index_size(&format!("group {:?} index_size", group.name), size)?;
            }
        }

        let mut filter_names = HashSet::new();
        for filter in &self.filters {
            validate_name("filter", &filter.name)?;
            if !filter_names.insert(filter.name.as_str()) {
                bail!("duplicate filter name {:?}", filter.name);
            }
            let items = expand_filter_items(&filter.items)
                .with_context(|| format!("filter {:?}", filter.name))?;
            if items.is_empty() {
                bail!("filter {:?} has no items", filter.name);
            }
            let mut seen = HashSet::new();
            for item in &items {
                if !seen.insert(item.as_str()) {
                    bail!("filter {:?} repeats item {:?}", filter.name, item);
                }
            }
        }

        if self.nodes.len() > usize::from(u16::MAX) {
            bail!(
                "{} nodes configured, at most {} supported",
                self.nodes.len(),
                u16::MAX
            );
        }

        let mut node_names = HashSet::new();
        for node in &self.nodes {
            validate_name("node", &node.name)?;
            if !node_names.insert(node.name.as_str()) {
                bail!("duplicate node name {:?}", node.name);
            }
            if let Some(filter) = &node.filter {
                if !filter_names.contains(filter.as_str()) {
                    bail!("node {:?} references unknown filter {:?}", node.name, filter);
                }
            }
            if let Some(group) = &node.group {
                if !group_names.contains(group.as_str()) {
                    bail!("node {:?} references unknown group {:?}", node.name, group);
                }
            }
            if let Some(ratio) = node.sampling_ratio {
                validate_sampling_ratio(&format!("node {:?} sampling_ratio", node.name), ratio)?;
            }
            if let Some(size) = node.index_size {
                validate_index_size(&format!("node {:?} index_size", node.name), size)?;
            }
        }

        for node in self.resolved_nodes()? {
            if node.ptype == ProcessorType::Latency && node.filter_items.len() < 2 {
                bail!(
                    "latency node {:?} needs a filter with at least two stages",
                    node.name
                );
            }
        }

        Ok(())
    }

    /// Streaming interval in whole seconds.
    pub fn streaming_interval_secs(&self) -> u32 {
        self.defaults.streaming_interval.as_secs() as u32
    }

    /// Expanded items of filter `name`.
    pub fn filter_items(&self, name: &str) -> Result<Vec<String>> {
        let filter = self
            .filters
            .iter()
            .find(|f| f.name == name)
            .with_context(|| format!("unknown filter {name:?}"))?;
        expand_filter_items(&filter.items)
    }

    /// Nodes in declaration order with node, then group, then default
    /// settings applied.
    pub fn resolved_nodes(&self) -> Result<Vec<ResolvedNode>> {
        self.nodes
            .iter()
            .map(|node| -> Result<ResolvedNode> {
                let group = match &node.group {
                    Some(name) => Some(
                        self.groups
                            .iter()
                            .find(|g| &g.name == name)
                            .with_context(|| format!("unknown group {name:?}"))?,
                    ),
                    None => None,
                };

                let (filter_name, filter_items) = match &node.filter {
                    Some(name) => (name.clone(), self.filter_items(name)?),
                    None => (
                        DEFAULT_FILTER_ITEM.to_string(),
                        vec![DEFAULT_FILTER_ITEM.to_string()],
                    ),
                };

                let defaults = &self.defaults;
                Ok(ResolvedNode {
                    name: node.name.clone(),
                    ptype: node.ptype,
                    filter_name,
                    filter_items,
                    group: node.group.clone(),
                    build: node
                        .build
                        .or(group.and_then(|g| g.node_build))
                        .unwrap_or(defaults.node_build),
                    run: node
                        .run
                        .or(group.and_then(|g| g.node_run))
                        .unwrap_or(defaults.node_run),
                    sampling_ratio: node
                        .sampling_ratio
                        .or(group.and_then(|g| g.sampling_ratio))
                        .unwrap_or(defaults.sampling_ratio),
                    index_size: node
                        .index_size
                        .or(group.and_then(|g| g.index_size))
                        .unwrap_or(defaults.index_size),
                })
            })
            .collect()
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("{kind} name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("{kind} name {name:?} longer than {MAX_NAME_LEN} characters");
    }
    Ok(())
}

fn validate_sampling_ratio(field: &str, ratio: u32) -> Result<()> {
    if !(1..=10_000).contains(&ratio) {
        bail!("{field} {ratio} must be between 1 and 10000");
    }
    Ok(())
}

fn validate_index_size(field: &str, size: usize) -> Result<()> {
    if !(1..=999).contains(&size) {
        bail!("{field} {size} must be between 1 and 999");
    }
    Ok(())
}

/// Expands `PREFIX_a ... PREFIX_b` ranges into individual items.
pub fn expand_filter_items(items: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for item in items {
        let Some((first, last)) = item.split_once(RANGE_SEPARATOR) else {
            let item = item.trim();
            validate_name("filter item", item)?;
            out.push(item.to_string());
            continue;
        };

        let (prefix, start) = split_range_bound(first.trim())?;
        let (end_prefix, end) = split_range_bound(last.trim())?;
        if prefix != end_prefix {
            bail!("range {item:?} mixes prefixes {prefix:?} and {end_prefix:?}");
        }
        if start >= end {
            bail!("range {item:?} must start below its end");
        }
        if end - start + 1 > MAX_RANGE_ITEMS {
            bail!("range {item:?} expands to more than {MAX_RANGE_ITEMS} items");
        }
        for n in start..=end {
            let name = format!("{prefix}_{n}");
            validate_name("filter item", &name)?;
            out.push(name);
        }
    }
    Ok(out)
}

fn split_range_bound(bound: &str) -> Result<(&str, u32)> {
    let (prefix, number) = bound
        .rsplit_once('_')
        .with_context(|| format!("range bound {bound:?} is not PREFIX_N"))?;
    if prefix.is_empty() {
        bail!("range bound {bound:?} has an empty prefix");
    }
    let number = number
        .parse()
        .with_context(|| format!("range bound {bound:?} does not end in a number"))?;
    Ok((prefix, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ptype: ProcessorType) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            ptype,
            filter: None,
            group: None,
            build: None,
            run: None,
            sampling_ratio: None,
            index_size: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            groups: vec![GroupConfig {
                name: "IO".to_string(),
                node_run: Some(false),
                sampling_ratio: Some(50),
                ..Default::default()
            }],
            filters: vec![FilterConfig {
                name: "STAGE".to_string(),
                items: vec!["AIR_0 ... AIR_2".to_string()],
            }],
            nodes: vec![node("PERF_READ", ProcessorType::Performance), {
                let mut lat = node("LAT_SUBMIT", ProcessorType::Latency);
                lat.filter = Some("STAGE".to_string());
                lat.group = Some("IO".to_string());
                lat
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.defaults.air_build);
        assert_eq!(cfg.defaults.sampling_ratio, 1000);
        assert_eq!(cfg.defaults.index_size, 10);
        assert_eq!(cfg.defaults.streaming_interval, Duration::from_secs(1));
        assert_eq!(cfg.health.addr, ":9091");
        assert!(!cfg.health.enabled);
        assert!(cfg.output.file.is_none());
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
defaults:
  streaming_interval: 3s
  index_size: 4
groups:
  - name: BACKEND
    node_build: false
filters:
  - name: RW
    items: [READ, WRITE]
nodes:
  - name: PERF_VOLUME
    type: PERFORMANCE
    filter: RW
  - name: Q_SUBMIT
    type: queue
    group: BACKEND
    sampling_ratio: 9
output:
  file: /tmp/air.json
health:
  enabled: true
  addr: "127.0.0.1:0"
"#;
        let cfg = Config::from_yaml(yaml).expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.streaming_interval_secs(), 3);
        assert_eq!(cfg.output.file, Some(PathBuf::from("/tmp/air.json")));
        assert!(cfg.health.enabled);

        let nodes = cfg.resolved_nodes().expect("resolve");
        assert_eq!(nodes[0].ptype, ProcessorType::Performance);
        assert_eq!(nodes[0].filter_items, vec!["READ", "WRITE"]);
        assert_eq!(nodes[0].index_size, 4);
        assert!(nodes[0].build);
        assert!(!nodes[1].build);
        assert_eq!(nodes[1].sampling_ratio, 9);
        assert_eq!(nodes[1].filter_items, vec![DEFAULT_FILTER_ITEM]);
    }

    #[test]
    fn test_resolution_precedence() {
        let mut cfg = valid_config();
        cfg.nodes[1].sampling_ratio = Some(7);
        let nodes = cfg.resolved_nodes().expect("resolve");

        // Defaults apply to ungrouped nodes.
        assert!(nodes[0].run);
        assert_eq!(nodes[0].sampling_ratio, 1000);
        // Group overrides defaults, node overrides group.
        assert!(!nodes[1].run);
        assert_eq!(nodes[1].sampling_ratio, 7);
        assert_eq!(nodes[1].filter_items, vec!["AIR_0", "AIR_1", "AIR_2"]);
        assert_eq!(nodes[1].group.as_deref(), Some("IO"));
    }

    #[test]
    fn test_filter_range_expansion() {
        let items = expand_filter_items(&[
            "BEGIN".to_string(),
            "Q_3 ... Q_5".to_string(),
        ])
        .expect("expand");
        assert_eq!(items, vec!["BEGIN", "Q_3", "Q_4", "Q_5"]);
    }

    #[test]
    fn test_filter_range_errors() {
        let cases = [
            ("A_1 ... B_2", "mixes prefixes"),
            ("A_3 ... A_3", "start below"),
            ("A_5 ... A_1", "start below"),
            ("A_0 ... A_100", "more than 100"),
            ("A ... A_2", "PREFIX_N"),
            ("A_x ... A_2", "number"),
        ];
        for (range, want) in cases {
            let err = expand_filter_items(&[range.to_string()]).expect_err(range);
            assert!(
                format!("{err:#}").contains(want),
                "{range}: {err:#} should mention {want}"
            );
        }
        // 100 items is the limit, inclusive.
        assert_eq!(
            expand_filter_items(&["A_0 ... A_99".to_string()])
                .expect("expand")
                .len(),
            100
        );
    }

    #[test]
    fn test_validate_sampling_ratio_bounds() {
        let mut cfg = valid_config();
        cfg.defaults.sampling_ratio = 0;
        assert!(cfg.validate().is_err());
        cfg.defaults.sampling_ratio = 10_001;
        assert!(cfg.validate().is_err());
        cfg.defaults.sampling_ratio = 10_000;
        cfg.validate().expect("upper bound is valid");

        cfg.nodes[0].sampling_ratio = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_index_size_bounds() {
        let mut cfg = valid_config();
        cfg.nodes[0].index_size = Some(1000);
        assert!(cfg.validate().is_err());
        cfg.nodes[0].index_size = Some(999);
        cfg.validate().expect("999 is valid");
    }

    #[test]
    fn test_validate_streaming_interval() {
        let mut cfg = valid_config();
        cfg.defaults.streaming_interval = Duration::from_secs(31);
        assert!(cfg.validate().is_err());
        cfg.defaults.streaming_interval = Duration::from_millis(1500);
        assert!(cfg.validate().is_err());
        cfg.defaults.streaming_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
        cfg.defaults.streaming_interval = Duration::from_secs(30);
        cfg.validate().expect("30s is valid");
    }

    #[test]
    fn test_validate_names() {
        let mut cfg = valid_config();
        cfg.nodes[1].name = "PERF_READ".to_string();
        assert!(cfg
            .validate()
            .expect_err("duplicate")
            .to_string()
            .contains("duplicate node name"));

        let mut cfg = valid_config();
        cfg.nodes[0].name = "N".repeat(31);
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.nodes[0].filter = Some("MISSING".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.nodes[0].group = Some("MISSING".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_latency_needs_two_stages() {
        let mut cfg = valid_config();
        cfg.nodes.push(node("LAT_SINGLE", ProcessorType::Latency));
        let err = cfg.validate().expect_err("single stage latency");
        assert!(err.to_string().contains("at least two stages"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("air.yaml");
        std::fs::write(
            &path,
            "nodes:\n  - name: UTIL_CPU\n    type: utilization\n",
        )
        .expect("write");
        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.nodes.len(), 1);

        let missing = Config::load(&dir.path().join("missing.yaml"));
        assert!(missing.is_err());
    }
}
