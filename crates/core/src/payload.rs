use crate::glob::glob_match;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Compiled payload-rewrite rule set. Rule kinds:
/// - `default` / `default-raw`: fill a path only when it is absent in the
///   original payload; first matching rule wins per path.
/// - `override` / `override-raw`: force-set a path; last matching rule wins.
/// - `filter`: delete a path.
///
/// The `-raw` variants carry their values as strings of raw JSON.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PayloadConfig {
    #[serde(default)]
    pub default: Vec<ParamRule>,
    #[serde(default)]
    pub default_raw: Vec<ParamRule>,
    #[serde(default)]
    pub r#override: Vec<ParamRule>,
    #[serde(default)]
    pub override_raw: Vec<ParamRule>,
    #[serde(default)]
    pub filter: Vec<FilterRule>,
}

impl PayloadConfig {
    pub fn is_empty(&self) -> bool {
        self.default.is_empty()
            && self.default_raw.is_empty()
            && self.r#override.is_empty()
            && self.override_raw.is_empty()
            && self.filter.is_empty()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelMatcher {
    pub name: String,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParamRule {
    pub models: Vec<ModelMatcher>,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterRule {
    pub models: Vec<ModelMatcher>,
    pub params: Vec<String>,
}

/// Build the candidate model names used for rule matching: the resolved
/// upstream model, the requested model with its reasoning suffix stripped,
/// and the requested model verbatim. Deduped case-insensitively, order
/// preserved.
pub fn candidate_models(resolved: &str, requested: &str) -> Vec<String> {
    let requested_base = match requested.find('(') {
        Some(pos) if requested.ends_with(')') => &requested[..pos],
        _ => requested,
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in [resolved, requested_base, requested] {
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.to_ascii_lowercase()) {
            out.push(name.to_string());
        }
    }
    out
}

fn matches_rule(matchers: &[ModelMatcher], models: &[String], protocol: Option<&str>) -> bool {
    matchers.iter().any(|m| {
        let name_match = models.iter().any(|model| glob_match(&m.name, model));
        let protocol_match = m
            .protocol
            .as_ref()
            .is_none_or(|p| protocol.is_some_and(|actual| actual.eq_ignore_ascii_case(p)));
        name_match && protocol_match
    })
}

/// Read a value at a dot-separated path.
fn get_nested<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a value at a dot-separated path, creating intermediate objects as
/// needed. Returns false when an intermediate segment is a non-object.
fn set_nested(root: &mut Value, path: &str, value: Value) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(part.to_string(), value);
                return true;
            }
            return false;
        }
        if !current.is_object() {
            return false;
        }
        let obj = current.as_object_mut().unwrap();
        if !obj.contains_key(*part) {
            obj.insert(part.to_string(), Value::Object(Map::new()));
        }
        current = obj.get_mut(*part).unwrap();
    }
    false
}

/// Remove a value at a dot-separated path.
fn remove_nested(root: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                obj.remove(*part);
            }
        } else {
            match current.as_object_mut().and_then(|obj| obj.get_mut(*part)) {
                Some(next) => current = next,
                None => return,
            }
        }
    }
}

fn with_root(root: Option<&str>, path: &str) -> String {
    match root {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{path}"),
        _ => path.to_string(),
    }
}

fn parse_raw(value: &Value) -> Option<Value> {
    let raw = value.as_str()?;
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring unparsable raw payload value {raw:?}: {e}");
            None
        }
    }
}

/// Apply all payload rules to a JSON body. `models` are the candidate names
/// from [`candidate_models`]; `protocol` is the upstream schema the body is
/// in (e.g. "gemini", "openai"). An empty rule set leaves the body
/// untouched; applying the same rules twice is a no-op the second time.
pub fn apply_payload_rules(
    body: &mut Value,
    config: &PayloadConfig,
    models: &[String],
    protocol: Option<&str>,
) {
    apply_payload_rules_with_root(body, config, models, protocol, None)
}

/// Like [`apply_payload_rules`], with every rule path prefixed by `root`
/// (used for enveloped payloads such as Gemini-CLI's nested `request`).
pub fn apply_payload_rules_with_root(
    body: &mut Value,
    config: &PayloadConfig,
    models: &[String],
    protocol: Option<&str>,
    root: Option<&str>,
) {
    if config.is_empty() {
        return;
    }

    // Defaults consult the payload as it arrived, not intermediate writes.
    let original = body.clone();
    let mut written: HashSet<String> = HashSet::new();

    let default_passes: [(&[ParamRule], bool); 2] = [
        (&config.default, false),
        (&config.default_raw, true),
    ];
    for (rules, raw) in default_passes {
        for rule in rules {
            if !matches_rule(&rule.models, models, protocol) {
                continue;
            }
            for (path, value) in &rule.params {
                let full = with_root(root, path);
                if get_nested(&original, &full).is_some() || written.contains(&full) {
                    continue;
                }
                let value = if raw {
                    match parse_raw(value) {
                        Some(v) => v,
                        None => continue,
                    }
                } else {
                    value.clone()
                };
                if set_nested(body, &full, value) {
                    written.insert(full);
                }
            }
        }
    }

    let override_passes: [(&[ParamRule], bool); 2] = [
        (&config.r#override, false),
        (&config.override_raw, true),
    ];
    for (rules, raw) in override_passes {
        for rule in rules {
            if !matches_rule(&rule.models, models, protocol) {
                continue;
            }
            for (path, value) in &rule.params {
                let value = if raw {
                    match parse_raw(value) {
                        Some(v) => v,
                        None => continue,
                    }
                } else {
                    value.clone()
                };
                set_nested(body, &with_root(root, path), value);
            }
        }
    }

    for rule in &config.filter {
        if !matches_rule(&rule.models, models, protocol) {
            continue;
        }
        for path in &rule.params {
            remove_nested(body, &with_root(root, path));
        }
    }
}
