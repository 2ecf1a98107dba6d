//! Dangerous-Pattern Detection
//!
//! Regex rules flagging content that must never be written by the
//! gatekeeper without a block. The rule set is data, not logic: it ships
//! with a YAML default document and can be overridden from
//! `.custodian/safety.yml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};
use yaml_rust2::{Yaml, YamlLoader};

/// Default rule set, in the same YAML shape accepted on disk.
pub const DEFAULT_PATTERNS_YAML: &str = r#"patterns:
  - name: exec
    regex: '\bexec\s*\('
    description: dynamic code execution
  - name: eval
    regex: '\beval\s*\('
    description: dynamic expression evaluation
  - name: shell_true
    regex: 'shell\s*=\s*True'
    description: subprocess with shell=True
  - name: os_system
    regex: '\bos\.system\s*\('
    description: raw shell invocation
  - name: pickle_loads
    regex: '\bpickle\.loads?\s*\('
    description: unsafe deserialization
  - name: yaml_unsafe_load
    regex: '\byaml\.load\s*\('
    description: yaml.load (prefer safe_load)
  - name: dunder_import
    regex: '__import__\s*\('
    description: dynamic import
  - name: hardcoded_secret
    regex: '(?i)(api_key|secret|password|token)\s*=\s*["''][^"'']{8,}["'']'
    description: hardcoded credential
  - name: infinite_loop
    regex: 'while\s+(True|1)\s*:\s*$'
    description: unconditional infinite loop header
  - name: rm_rf
    regex: 'rm\s+-rf\s+/'
    description: recursive filesystem delete
"#;

/// One compiled detection rule.
#[derive(Clone, Debug)]
pub struct PatternRule {
    pub name: String,
    pub regex: Regex,
    pub description: String,
}

/// The compiled rule set used by the guard.
#[derive(Clone, Debug)]
pub struct PatternSet {
    rules: Vec<PatternRule>,
}

impl PatternSet {
    /// Compile the built-in defaults. The default document is validated by
    /// tests, so a parse failure here is a programming error.
    pub fn defaults() -> Self {
        Self::from_yaml(DEFAULT_PATTERNS_YAML)
            .unwrap_or_else(|_| PatternSet { rules: Vec::new() })
    }

    /// Load rules from `safety.yml` if present, else the defaults.
    pub fn load(safety_file: &Path) -> Self {
        if safety_file.exists() {
            match fs::read_to_string(safety_file)
                .map_err(anyhow::Error::from)
                .and_then(|s| Self::from_yaml(&s))
            {
                Ok(set) if !set.rules.is_empty() => {
                    debug!("Loaded {} safety patterns from {}", set.rules.len(), safety_file.display());
                    return set;
                }
                Ok(_) => warn!("Safety file {} defines no patterns; using defaults", safety_file.display()),
                Err(e) => warn!("Failed to load {}: {:#}; using defaults", safety_file.display(), e),
            }
        }
        Self::defaults()
    }

    /// Parse a YAML `patterns:` document into a compiled set. Rules with
    /// invalid regexes are skipped with a warning.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(source).context("Invalid YAML")?;
        let doc = docs.first().context("Empty YAML document")?;

        let items = doc["patterns"]
            .as_vec()
            .context("Missing or invalid 'patterns' key")?;

        let mut rules = Vec::with_capacity(items.len());
        for item in items {
            let name = yaml_str(item, "name");
            let pattern = yaml_str(item, "regex");
            let description = yaml_str(item, "description");

            let (name, pattern) = match (name, pattern) {
                (Some(n), Some(p)) => (n, p),
                _ => {
                    warn!("Skipping safety pattern with missing name/regex");
                    continue;
                }
            };

            match Regex::new(&pattern) {
                Ok(regex) => rules.push(PatternRule {
                    name,
                    regex,
                    description: description.unwrap_or_default(),
                }),
                Err(e) => warn!("Skipping safety pattern '{}': {}", name, e),
            }
        }

        Ok(PatternSet { rules })
    }

    /// Scan `content` line by line and return the names of every rule that
    /// matched anywhere.
    pub fn scan(&self, content: &str) -> Vec<String> {
        let mut matched = Vec::new();
        for rule in &self.rules {
            let hit = content
                .lines()
                .any(|line| rule.regex.is_match(line));
            if hit {
                matched.push(rule.name.clone());
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn yaml_str(item: &Yaml, key: &str) -> Option<String> {
    item[key].as_str().map(|s| s.to_string())
}
