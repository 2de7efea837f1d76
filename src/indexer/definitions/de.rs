//! Lenient deserialization helpers for community-written YAML
//!
//! Definitions in the wild write numbers where strings are expected, use
//! single values where lists are expected, and rely on map key order.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

/// Coerce a YAML scalar (string, number, bool) into a string
pub fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    yaml_to_string(&value).ok_or_else(|| de::Error::custom("expected a scalar value"))
}

/// Optional variant of [`scalar_string`]
pub fn opt_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(yaml_to_string))
}

pub fn yaml_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Tagged(t) => yaml_to_string(&t.value),
        _ => None,
    }
}

/// A map that keeps the key order of the YAML document
pub fn ordered_map<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<serde_yaml::Value, T>()? {
                let key = yaml_to_string(&key)
                    .ok_or_else(|| de::Error::custom("map keys must be scalars"))?;
                out.push((key, value));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(OrderedVisitor(PhantomData))
}

/// Ordered map whose values are coerced to strings.
///
/// List values (as used by `headers`) keep their first element.
pub fn ordered_string_map<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(String, serde_yaml::Value)> = ordered_map(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_yaml::Value::Sequence(items) => {
                    items.first().and_then(yaml_to_string).unwrap_or_default()
                }
                other => yaml_to_string(&other).unwrap_or_default(),
            };
            (k, v)
        })
        .collect())
}

/// Accept either a single scalar or a list of scalars, coerced to strings
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(Vec::new()),
        Some(serde_yaml::Value::Sequence(items)) => Ok(items
            .iter()
            .filter_map(yaml_to_string)
            .collect()),
        Some(other) => yaml_to_string(&other)
            .map(|s| vec![s])
            .ok_or_else(|| de::Error::custom("expected a scalar or a list of scalars")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "ordered_string_map", default)]
        inputs: Vec<(String, String)>,
        #[serde(deserialize_with = "string_list", default)]
        cats: Vec<String>,
        #[serde(deserialize_with = "scalar_string")]
        id: String,
    }

    #[test]
    fn test_order_and_coercion() {
        let yaml = "inputs:\n  z: 1\n  a: true\n  m: text\ncats: Movies\nid: 42\n";
        let sample: Sample = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            sample.inputs,
            vec![
                ("z".to_string(), "1".to_string()),
                ("a".to_string(), "true".to_string()),
                ("m".to_string(), "text".to_string()),
            ]
        );
        assert_eq!(sample.cats, vec!["Movies".to_string()]);
        assert_eq!(sample.id, "42");
    }
}
