//! User-configurable settings declared by a definition
//!
//! Each setting has a typed kind with a total default-resolution rule, so the
//! template store always receives a well-formed `.Config.<name>` value.

use std::collections::HashMap;

use serde::Deserialize;

use super::de::{opt_scalar_string, ordered_string_map, string_list};
use crate::indexer::template::Value;

/// Raw `settings:` entry as written in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar_string")]
    pub default: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub defaults: Vec<String>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub options: Vec<(String, String)>,
}

/// Typed view of a setting
#[derive(Debug, Clone, PartialEq)]
pub enum SettingKind {
    Text { default: String },
    Password,
    Checkbox { default: bool },
    Select { options: Vec<(String, String)>, default: Option<String> },
    MultiSelect { options: Vec<(String, String)>, defaults: Vec<String> },
    /// Display-only text shown to the user; never reaches the template store
    Info,
}

impl SettingsField {
    pub fn kind(&self) -> SettingKind {
        let kind = self.field_type.as_deref().unwrap_or("text").to_lowercase();
        match kind.as_str() {
            "password" => SettingKind::Password,
            "checkbox" => SettingKind::Checkbox {
                default: self.default.as_deref().is_some_and(is_truthy_flag),
            },
            "select" => SettingKind::Select {
                options: self.options.clone(),
                default: self.default.clone(),
            },
            "multi-select" => SettingKind::MultiSelect {
                options: self.options.clone(),
                defaults: self.defaults.clone(),
            },
            k if k.starts_with("info") => SettingKind::Info,
            _ => SettingKind::Text {
                default: self.default.clone().unwrap_or_default(),
            },
        }
    }

    /// Resolve the effective value for this setting given the user's input
    pub fn resolve(&self, user_value: Option<&str>) -> Option<Value> {
        match self.kind() {
            SettingKind::Info => None,
            SettingKind::Password => Some(Value::from(user_value.unwrap_or_default())),
            SettingKind::Text { default } => {
                Some(Value::from(user_value.unwrap_or(default.as_str())))
            }
            SettingKind::Checkbox { default } => {
                let on = user_value.map(is_truthy_flag).unwrap_or(default);
                Some(Value::Bool(on))
            }
            SettingKind::Select { options, default } => {
                let key = user_value
                    .map(|v| select_key(&options, v))
                    .or(default)
                    .or_else(|| options.first().map(|(k, _)| k.clone()))
                    .unwrap_or_default();
                Some(Value::from(key))
            }
            SettingKind::MultiSelect { options, defaults } => {
                let keys: Vec<String> = match user_value {
                    Some(v) => v
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| select_key(&options, s))
                        .collect(),
                    None => defaults,
                };
                Some(Value::List(keys.into_iter().map(Value::from).collect()))
            }
        }
    }
}

/// Map a select value to its option key. Numeric input that is not itself a
/// key is treated as an index into the option list.
fn select_key(options: &[(String, String)], value: &str) -> String {
    if options.iter().any(|(k, _)| k == value) {
        return value.to_string();
    }
    if let Ok(idx) = value.parse::<usize>() {
        if let Some((k, _)) = options.get(idx) {
            return k.clone();
        }
    }
    value.to_string()
}

fn is_truthy_flag(v: &str) -> bool {
    matches!(
        v.trim().to_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

/// Resolve all settings of a definition into `.Config.*` template values
pub fn resolve_settings(
    fields: &[SettingsField],
    user: &HashMap<String, String>,
) -> Vec<(String, Value)> {
    let mut resolved = Vec::with_capacity(fields.len());
    for field in fields {
        if let Some(value) = field.resolve(user.get(&field.name).map(String::as_str)) {
            resolved.push((field.name.clone(), value));
        }
    }
    // Values the definition did not declare (e.g. cookie, apikey) still pass through
    for (k, v) in user {
        if !fields.iter().any(|f| &f.name == k) {
            resolved.push((k.clone(), Value::from(v.as_str())));
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(yaml: &str) -> SettingsField {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_checkbox_resolves_to_bool() {
        let f = field("name: freeleech\ntype: checkbox\ndefault: false\n");
        assert_eq!(f.resolve(None), Some(Value::Bool(false)));
        assert_eq!(f.resolve(Some("true")), Some(Value::Bool(true)));
        assert_eq!(f.resolve(Some("on")), Some(Value::Bool(true)));
    }

    #[test]
    fn test_select_index_maps_to_key() {
        let f = field(
            "name: sort\ntype: select\ndefault: time\noptions:\n  time: created\n  size: size\n  seeders: seeders\n",
        );
        assert_eq!(f.resolve(None), Some(Value::from("time")));
        assert_eq!(f.resolve(Some("2")), Some(Value::from("seeders")));
        assert_eq!(f.resolve(Some("size")), Some(Value::from("size")));
    }

    #[test]
    fn test_info_is_skipped() {
        let f = field("name: info_cookie\ntype: info_cookie\n");
        assert_eq!(f.kind(), SettingKind::Info);
        assert_eq!(f.resolve(Some("x")), None);
    }

    #[test]
    fn test_undeclared_settings_pass_through() {
        let fields = vec![field("name: username\ntype: text\n")];
        let mut user = HashMap::new();
        user.insert("username".to_string(), "bob".to_string());
        user.insert("apikey".to_string(), "k".to_string());
        let resolved = resolve_settings(&fields, &user);
        assert!(resolved.contains(&("username".to_string(), Value::from("bob"))));
        assert!(resolved.contains(&("apikey".to_string(), Value::from("k"))));
    }
}
