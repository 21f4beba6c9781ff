//! YAML decoding using yaml-rust2
//!
//! Blocks are parsed with yaml-rust2 and converted to `serde_json::Value` so
//! they can be deserialized into kube's dynamic object type.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// A block that is not a well-formed YAML document
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse one manifest block into a JSON value.
///
/// Only the first document of the block is used. An empty block yields
/// `Value::Null`.
pub fn parse_block(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    docs.into_iter()
        .next()
        .map(to_json)
        .unwrap_or(Ok(Value::Null))
}

fn to_json(node: Yaml) -> Result<Value, YamlError> {
    Ok(match node {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(raw) => {
            let f: f64 = raw
                .parse()
                .map_err(|_| YamlError(format!("invalid float literal {raw:?}")))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Yaml::Hash(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(key_to_string(key)?, to_json(value)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) => return Err(YamlError("aliases are not supported".to_string())),
        Yaml::BadValue => return Err(YamlError("malformed value".to_string())),
    })
}

fn key_to_string(key: Yaml) -> Result<String, YamlError> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(YamlError("mapping keys must be scalars".to_string())),
    }
}
