//! Tube Name Mapping
//!
//! Turns raw beanstalkd tube names into structured Prometheus labels.
//!
//! The mapping file is a sequence of blocks separated by blank lines. The
//! first line of a block is a regular expression matched against the whole
//! tube name, the following lines are `label="template"` pairs where the
//! template may reference capture groups (`$1`, `${1}`, `${name}`):
//!
//! ```text
//! some-tube-(\d*)-(\w*)
//! name="some-tube"
//! identifier="$1"
//! action="$2"
//! ```
//!
//! Compiled rules live in an immutable [`RuleSet`]. [`TubeMapper`] holds the
//! active set behind an [`ArcSwap`] so a reload replaces it in one step while
//! scrape workers keep reading whichever snapshot they already loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ConfigError;
use crate::metrics::{ExporterMetrics, Outcome};

/// Label that receives the mapped tube name (or the raw one when unmapped).
pub const TUBE_LABEL: &str = "tube";
/// Label carrying the beanstalkd server address.
pub const INSTANCE_LABEL: &str = "instance";
/// Label every rule must define; renamed to [`TUBE_LABEL`] on output.
pub const NAME_LABEL: &str = "name";

const TUBE_NAME_PATTERN: &str = "^[a-zA-Z_-][a-zA-Z0-9_-]+$";

static LABEL_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^([a-zA-Z_-][a-zA-Z0-9_-]+)\s*=\s*"(.*)"$"#).expect("label line regex")
});

static PROMETHEUS_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").expect("prometheus label regex"));

static TUBE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(TUBE_NAME_PATTERN).expect("tube name regex"));

/// One compiled `pattern -> labels` block.
#[derive(Debug, Clone)]
pub struct MappingRule {
    pattern: Regex,
    labels: BTreeMap<String, String>,
}

impl MappingRule {
    /// The anchored pattern this rule matches with.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Label name to template string.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    fn expand(&self, tube: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.pattern.captures(tube)?;
        let labels = self
            .labels
            .iter()
            .map(|(label, template)| {
                let mut value = String::new();
                captures.expand(template, &mut value);
                (label.clone(), value)
            })
            .collect();
        Some(labels)
    }
}

/// Labels resolved for a single tube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TubeLabels {
    /// Whether a mapping rule matched the tube.
    pub matched: bool,
    /// Complete label set, including `tube`, `instance` and every label
    /// declared anywhere in the rule set.
    pub labels: BTreeMap<String, String>,
}

/// Immutable, compiled form of a mapping configuration.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<MappingRule>,
    label_names: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            label_names: vec![TUBE_LABEL.to_string()],
        }
    }
}

struct PendingRule {
    pattern: Regex,
    labels: BTreeMap<String, String>,
}

impl PendingRule {
    fn close(self, line: usize) -> Result<MappingRule, ConfigError> {
        if self.labels.is_empty() {
            return Err(ConfigError::NoLabels { line });
        }
        if !self.labels.contains_key(NAME_LABEL) {
            return Err(ConfigError::MissingName { line });
        }
        Ok(MappingRule {
            pattern: self.pattern,
            labels: self.labels,
        })
    }
}

impl RuleSet {
    /// Compile a mapping configuration.
    ///
    /// Either every block compiles or nothing is returned.
    pub fn compile(text: &str) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        let mut pending: Option<PendingRule> = None;
        let mut last_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            last_line = line_no;
            let line = raw.trim();

            let Some(mut rule) = pending.take() else {
                if line.is_empty() {
                    continue;
                }
                let pattern = Regex::new(&format!("^(?:{line})$"))
                    .map_err(|source| ConfigError::InvalidRegex { line: line_no, source })?;
                pending = Some(PendingRule {
                    pattern,
                    labels: BTreeMap::new(),
                });
                continue;
            };

            if line.is_empty() {
                rules.push(rule.close(line_no)?);
                continue;
            }

            let captures = LABEL_LINE_RE
                .captures(line)
                .ok_or_else(|| ConfigError::BadLabelLine {
                    line: line_no,
                    text: line.to_string(),
                })?;
            let (label, value) = (&captures[1], &captures[2]);
            if label == NAME_LABEL && !has_group_reference(value) && !TUBE_NAME_RE.is_match(value) {
                return Err(ConfigError::InvalidTubeName {
                    line: line_no,
                    name: value.to_string(),
                    pattern: TUBE_NAME_PATTERN,
                });
            }
            if label != NAME_LABEL && !is_prometheus_label_name(label) {
                tracing::warn!(
                    line = line_no,
                    label,
                    "label is not a valid Prometheus label name, tube metrics will not be exported"
                );
            }
            rule.labels.insert(label.to_string(), value.to_string());
            pending = Some(rule);
        }

        if let Some(rule) = pending {
            rules.push(rule.close(last_line)?);
        }

        let mut names: BTreeSet<String> = rules
            .iter()
            .flat_map(|rule| rule.labels.keys().cloned())
            .collect();
        names.remove(NAME_LABEL);
        names.insert(TUBE_LABEL.to_string());

        Ok(Self {
            rules,
            label_names: names.into_iter().collect(),
        })
    }

    /// Label keys Prometheus would refuse, such as `queue-name`.
    pub fn invalid_label_names(&self) -> Vec<&str> {
        self.label_names
            .iter()
            .map(String::as_str)
            .filter(|name| !is_prometheus_label_name(name))
            .collect()
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every label name used by the rules except `name`, plus `tube`. Sorted.
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Label schema of a per-tube metric: [`Self::label_names`] plus `instance`.
    pub fn schema(&self) -> Vec<String> {
        let mut schema = self.label_names.clone();
        if let Err(pos) = schema.binary_search_by(|name| name.as_str().cmp(INSTANCE_LABEL)) {
            schema.insert(pos, INSTANCE_LABEL.to_string());
        }
        schema
    }

    /// Expand the labels of the first rule matching `tube`.
    ///
    /// The returned map still uses the rule's own keys, `name` included.
    pub fn lookup(&self, tube: &str) -> Option<BTreeMap<String, String>> {
        self.rules.iter().find_map(|rule| rule.expand(tube))
    }

    /// Resolve the full label set emitted for `tube` on server `instance`.
    pub fn resolve(&self, tube: &str, instance: &str) -> TubeLabels {
        let (matched, mut labels) = match self.lookup(tube) {
            Some(mut labels) => {
                let name = labels.remove(NAME_LABEL).unwrap_or_default();
                labels.insert(TUBE_LABEL.to_string(), name);
                (true, labels)
            }
            None => (
                false,
                BTreeMap::from([(TUBE_LABEL.to_string(), tube.to_string())]),
            ),
        };
        labels.insert(INSTANCE_LABEL.to_string(), instance.to_string());
        for name in &self.label_names {
            labels.entry(name.clone()).or_default();
        }
        TubeLabels { matched, labels }
    }
}

impl std::str::FromStr for RuleSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

/// Whether `template` contains a capture group reference, using the same
/// rules as [`regex::Captures::expand`]: `$$` is an escaped dollar,
/// `${...}` and `$` followed by a name character are references.
fn has_group_reference(template: &str) -> bool {
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        let after = &rest[pos + 1..];
        match after.chars().next() {
            Some('$') => rest = &after[1..],
            Some(c) if c == '{' || c == '_' || c.is_ascii_alphanumeric() => return true,
            _ => rest = after,
        }
    }
    false
}

fn is_prometheus_label_name(name: &str) -> bool {
    PROMETHEUS_LABEL_RE.is_match(name)
}

/// Holder of the active [`RuleSet`], swapped as a whole on reload.
pub struct TubeMapper {
    current: ArcSwap<RuleSet>,
    metrics: Option<Arc<ExporterMetrics>>,
}

impl Default for TubeMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl TubeMapper {
    /// Mapper with an empty rule set and no metrics attached.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
            metrics: None,
        }
    }

    /// Mapper that reports reloads and the loaded rule count.
    pub fn with_metrics(metrics: Arc<ExporterMetrics>) -> Self {
        metrics.set_loaded_mappings(0);
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
            metrics: Some(metrics),
        }
    }

    /// The rule set active right now. Hold on to it for a consistent view.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Install a compiled rule set.
    pub fn swap(&self, rules: RuleSet) -> Arc<RuleSet> {
        let count = rules.len();
        let previous = self.current.swap(Arc::new(rules));
        if let Some(metrics) = &self.metrics {
            metrics.set_loaded_mappings(count);
        }
        previous
    }

    /// Compile `text` and install it. On error the active set is untouched.
    pub fn load_str(&self, text: &str) -> Result<usize, ConfigError> {
        let rules = RuleSet::compile(text)?;
        let count = rules.len();
        self.swap(rules);
        Ok(count)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.load_str(&text)
    }

    /// Reload from `path`, counting the outcome in the reload metric.
    pub fn reload_file(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let result = self.load_file(path);
        match &result {
            Ok(count) => {
                tracing::warn!(path = %path.display(), mappings = count, "Config reloaded successfully");
                let rules = self.snapshot();
                let invalid = rules.invalid_label_names();
                if !invalid.is_empty() {
                    tracing::warn!(path = %path.display(), labels = ?invalid, "Config uses labels Prometheus rejects");
                }
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Error reloading config");
            }
        }
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { Outcome::Success } else { Outcome::Failure };
            metrics.record_config_reload(outcome);
        }
        result
    }

    /// Shorthand for resolving against the current snapshot.
    pub fn resolve(&self, tube: &str, instance: &str) -> TubeLabels {
        self.current.load().resolve(tube, instance)
    }
}
