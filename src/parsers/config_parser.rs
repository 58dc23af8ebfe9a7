use crate::error::IngestError;
use crate::events::{now, ChangeType, ConfigChange, Timestamp};
use crate::parsers::fields::value_to_string;
use log::{debug, info};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// `KEY = VALUE`, optionally prefixed with `export`
const ENV_LINE_PATTERN: &str = r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_.\-]*)\s*=\s*(.*)$";

/// `[section]` header of an INI file
const INI_SECTION_PATTERN: &str = r"^\[([A-Za-z0-9_.\- ]+)\]$";

const COMMENT_MARKERS: &[&str] = &["#", ";", "--"];

/// Keys containing any of these are likely to matter during an incident
const CRITICAL_KEYWORDS: &[&str] = &[
    "timeout",
    "connection",
    "pool",
    "max",
    "limit",
    "retry",
    "port",
    "host",
    "url",
    "endpoint",
    "database",
    "db",
    "cache",
    "memory",
    "cpu",
    "thread",
    "worker",
];

/// Input format of a configuration blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    /// Line-oriented `KEY=VALUE` (.env, .ini, .properties, ...)
    Env,
    /// Decide from the path extension, then from the content
    Auto,
}

impl FromStr for ConfigFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            "env" | "ini" | "properties" | "conf" | "cfg" => Ok(ConfigFormat::Env),
            "auto" | "" => Ok(ConfigFormat::Auto),
            other => Err(IngestError::Validation(format!(
                "Unsupported config format: {}",
                other
            ))),
        }
    }
}

/// Parser for configuration snapshots and snapshot diffs
///
/// Nested documents are flattened to one record per leaf with a dot-joined key.
pub struct ConfigParser {
    env_line_regex: Regex,
    ini_section_regex: Regex,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParser {
    pub fn new() -> Self {
        Self {
            env_line_regex: Regex::new(ENV_LINE_PATTERN).expect("valid env line pattern"),
            ini_section_regex: Regex::new(INI_SECTION_PATTERN).expect("valid section pattern"),
        }
    }

    /// Parse a configuration blob into `current` records
    ///
    /// # Arguments
    ///
    /// * `content` - Raw configuration text
    /// * `format` - Input format, or `Auto` to detect
    /// * `path` - Logical path, used for extension detection and as `file_path`
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Json` / `IngestError::Yaml` when an explicitly
    /// JSON or YAML blob does not decode.
    pub fn parse(
        &self,
        content: &str,
        format: ConfigFormat,
        path: &str,
    ) -> Result<Vec<ConfigChange>, IngestError> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let format = match format {
            ConfigFormat::Auto => Self::detect_format(content, path),
            explicit => explicit,
        };
        debug!("Parsing config {} as {:?}", path, format);

        let timestamp = now();
        let changes = match format {
            ConfigFormat::Json => {
                let document: Value = serde_json::from_str(content)?;
                Self::flatten_document(&document, path, timestamp)
            }
            ConfigFormat::Yaml => {
                let yaml: serde_yaml::Value = serde_yaml::from_str(content)?;
                let document = serde_json::to_value(yaml)?;
                Self::flatten_document(&document, path, timestamp)
            }
            _ => self
                .parse_env(content)
                .into_iter()
                .map(|(key, value)| current_record(path, key, value, timestamp))
                .collect(),
        };

        info!("Parsed {} config entries from {}", changes.len(), path);
        Ok(changes)
    }

    /// Extension first, then content probing, with ENV as the last resort
    pub fn detect_format(content: &str, path: &str) -> ConfigFormat {
        let lower = path.to_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            return ConfigFormat::Yaml;
        }
        if lower.ends_with(".json") {
            return ConfigFormat::Json;
        }
        if [".env", ".conf", ".cfg", ".ini", ".properties"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            return ConfigFormat::Env;
        }

        let trimmed = content.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<Value>(content).is_ok()
        {
            return ConfigFormat::Json;
        }

        match serde_yaml::from_str::<serde_yaml::Value>(content) {
            Ok(serde_yaml::Value::Mapping(_)) | Ok(serde_yaml::Value::Sequence(_)) => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Env,
        }
    }

    /// Parse `KEY=VALUE` lines; later duplicates overwrite earlier ones in place
    fn parse_env(&self, content: &str) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || COMMENT_MARKERS.iter().any(|m| line.starts_with(m)) {
                continue;
            }

            if let Some(caps) = self.ini_section_regex.captures(line) {
                section = Some(caps[1].trim().to_string());
                continue;
            }

            let line = strip_inline_comment(line);
            let Some(caps) = self.env_line_regex.captures(line) else {
                debug!("Ignoring config line: {}", line);
                continue;
            };

            let key = match &section {
                Some(prefix) => format!("{}.{}", prefix, &caps[1]),
                None => caps[1].to_string(),
            };
            let value = unquote(caps[2].trim()).to_string();

            match positions.get(&key) {
                Some(&index) => entries[index].1 = value,
                None => {
                    positions.insert(key.clone(), entries.len());
                    entries.push((key, value));
                }
            }
        }

        entries
    }

    fn flatten_document(document: &Value, path: &str, timestamp: Timestamp) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        match document {
            Value::Object(_) => flatten_into(document, "", path, timestamp, &mut changes),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    flatten_into(item, &index.to_string(), path, timestamp, &mut changes);
                }
            }
            Value::Null => {}
            scalar => changes.push(current_record(
                path,
                "value".to_string(),
                value_to_string(scalar),
                timestamp,
            )),
        }
        changes
    }

    /// Diff two snapshots
    ///
    /// Emits `modified` for keys on both sides with different values, `added`
    /// for keys only in `new`, `deleted` (with an empty `new_value`) for keys
    /// only in `old`. `file_path` is taken from the first record of the side
    /// the key comes from.
    pub fn compare(old: &[ConfigChange], new: &[ConfigChange]) -> Vec<ConfigChange> {
        let timestamp = now();
        let old_index: HashMap<&str, &str> = old
            .iter()
            .map(|c| (c.key.as_str(), c.new_value.as_str()))
            .collect();
        let new_index: HashMap<&str, &str> = new
            .iter()
            .map(|c| (c.key.as_str(), c.new_value.as_str()))
            .collect();

        let new_path = new.first().map_or("config", |c| c.file_path.as_str());
        let old_path = old.first().map_or("config", |c| c.file_path.as_str());

        let mut changes = Vec::new();
        let mut seen = HashSet::new();

        for change in new {
            let key = change.key.as_str();
            if !seen.insert(key) {
                continue;
            }
            let new_value = new_index[key];
            match old_index.get(key) {
                Some(old_value) if *old_value != new_value => changes.push(ConfigChange {
                    timestamp,
                    file_path: new_path.to_string(),
                    key: key.to_string(),
                    old_value: Some(old_value.to_string()),
                    new_value: new_value.to_string(),
                    change_type: ChangeType::Modified,
                }),
                Some(_) => {}
                None => changes.push(ConfigChange {
                    timestamp,
                    file_path: new_path.to_string(),
                    key: key.to_string(),
                    old_value: None,
                    new_value: new_value.to_string(),
                    change_type: ChangeType::Added,
                }),
            }
        }

        let mut seen_old = HashSet::new();
        for change in old {
            let key = change.key.as_str();
            if new_index.contains_key(key) || !seen_old.insert(key) {
                continue;
            }
            changes.push(ConfigChange {
                timestamp,
                file_path: old_path.to_string(),
                key: key.to_string(),
                old_value: Some(old_index[key].to_string()),
                new_value: String::new(),
                change_type: ChangeType::Deleted,
            });
        }

        info!("Config comparison found {} differences", changes.len());
        changes
    }

    /// Changes whose key mentions a connection, capacity or timeout setting
    pub fn filter_critical_changes(changes: &[ConfigChange]) -> Vec<ConfigChange> {
        changes
            .iter()
            .filter(|change| {
                let key = change.key.to_lowercase();
                CRITICAL_KEYWORDS.iter().any(|keyword| key.contains(keyword))
            })
            .cloned()
            .collect()
    }
}

fn current_record(path: &str, key: String, value: String, timestamp: Timestamp) -> ConfigChange {
    ConfigChange {
        timestamp,
        file_path: path.to_string(),
        key,
        old_value: None,
        new_value: value,
        change_type: ChangeType::Current,
    }
}

/// Walk nested objects, emitting one record per leaf
fn flatten_into(
    value: &Value,
    prefix: &str,
    path: &str,
    timestamp: Timestamp,
    out: &mut Vec<ConfigChange>,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let full_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, &full_key, path, timestamp, out);
            }
        }
        leaf => out.push(current_record(
            path,
            prefix.to_string(),
            value_to_string(leaf),
            timestamp,
        )),
    }
}

/// Cut the line at the first comment marker that sits outside quotes
fn strip_inline_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;

    for (index, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ if in_single || in_double => {}
            _ => {
                if COMMENT_MARKERS.iter().any(|m| line[index..].starts_with(m)) {
                    return line[..index].trim_end();
                }
            }
        }
    }

    line
}

/// Remove one layer of matching single or double quotes
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
