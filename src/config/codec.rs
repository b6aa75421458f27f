//! File formats a configuration tree can be read from and written to.

use std::path::Path;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::tree::ConfigTree;
use super::ConfigError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    TomlDecode(#[from] toml::de::Error),

    #[error(transparent)]
    TomlEncode(#[from] toml::ser::Error),

    #[error("input is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("{format} root must be a mapping, got {found}")]
    NonMappingRoot { format: &'static str, found: &'static str },

    #[error("{format} value at '{path}' is not a finite number")]
    NonFiniteFloat { format: &'static str, path: String },

    #[error("{format} cannot represent the value at '{path}': {reason}")]
    Unrepresentable {
        format: &'static str,
        path: String,
        reason: &'static str,
    },
}

/// Decodes raw bytes into a tree and encodes a tree back to bytes.
pub trait FormatCodec: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Extensions claimed by this codec, lowercase and including the dot.
    fn extensions(&self) -> &'static [&'static str];

    fn decode(&self, bytes: &[u8]) -> Result<ConfigTree, CodecError>;

    fn encode(&self, tree: &ConfigTree) -> Result<Vec<u8>, CodecError>;
}

fn join_path(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "mapping",
    }
}

/// An empty document reads as an empty tree; any non-mapping root is rejected.
fn into_tree(format: &'static str, value: Value) -> Result<ConfigTree, CodecError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(ConfigTree::new()),
        other => Err(CodecError::NonMappingRoot {
            format,
            found: kind_of(&other),
        }),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FormatCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<ConfigTree, CodecError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(CodecError::NonMappingRoot {
                format: "JSON",
                found: kind_of(&other),
            }),
        }
    }

    fn encode(&self, tree: &ConfigTree) -> Result<Vec<u8>, CodecError> {
        let mut out = serde_json::to_vec_pretty(tree)?;
        out.push(b'\n');
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl FormatCodec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".yaml", ".yml"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<ConfigTree, CodecError> {
        let text = std::str::from_utf8(bytes)?;
        if text.trim().is_empty() {
            return Ok(ConfigTree::new());
        }
        let document: serde_yaml::Value = serde_yaml::from_str(text)?;
        check_yaml_finite(&document, None)?;
        into_tree("YAML", serde_yaml::from_value(document)?)
    }

    fn encode(&self, tree: &ConfigTree) -> Result<Vec<u8>, CodecError> {
        Ok(serde_yaml::to_string(tree)?.into_bytes())
    }
}

/// `.inf` and `.nan` would otherwise decode to `null`.
fn check_yaml_finite(value: &serde_yaml::Value, path: Option<&str>) -> Result<(), CodecError> {
    match value {
        serde_yaml::Value::Number(n) if n.is_nan() || n.is_infinite() => Err(CodecError::NonFiniteFloat {
            format: "YAML",
            path: path.unwrap_or_default().to_string(),
        }),
        serde_yaml::Value::Sequence(items) => items.iter().try_for_each(|item| check_yaml_finite(item, path)),
        serde_yaml::Value::Mapping(map) => map.iter().try_for_each(|(key, item)| {
            let key = match key.as_str() {
                Some(key) => key.to_string(),
                None => format!("{key:?}"),
            };
            check_yaml_finite(item, Some(&join_path(path, &key)))
        }),
        serde_yaml::Value::Tagged(tagged) => check_yaml_finite(&tagged.value, path),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TomlCodec;

impl FormatCodec for TomlCodec {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".toml"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<ConfigTree, CodecError> {
        let table: toml::Table = toml::from_str(std::str::from_utf8(bytes)?)?;
        from_toml_table(table, None)
    }

    fn encode(&self, tree: &ConfigTree) -> Result<Vec<u8>, CodecError> {
        let table = to_toml_table(tree, None)?;
        Ok(toml::to_string(&table)?.into_bytes())
    }
}

fn from_toml_table(table: toml::Table, prefix: Option<&str>) -> Result<ConfigTree, CodecError> {
    table
        .into_iter()
        .map(|(key, value)| {
            let converted = from_toml(value, &join_path(prefix, &key))?;
            Ok::<_, CodecError>((key, converted))
        })
        .collect()
}

fn from_toml(value: toml::Value, path: &str) -> Result<Value, CodecError> {
    Ok(match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => match Number::from_f64(f) {
            Some(n) => Value::Number(n),
            None => {
                return Err(CodecError::NonFiniteFloat {
                    format: "TOML",
                    path: path.to_string(),
                })
            }
        },
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| from_toml(item, path))
                .collect::<Result<_, _>>()?,
        ),
        toml::Value::Table(table) => Value::Object(from_toml_table(table, Some(path))?),
    })
}

fn to_toml_table(tree: &ConfigTree, prefix: Option<&str>) -> Result<toml::Table, CodecError> {
    tree.iter()
        .map(|(key, value)| {
            let converted = to_toml(value, &join_path(prefix, key))?;
            Ok::<_, CodecError>((key.clone(), converted))
        })
        .collect()
}

fn to_toml(value: &Value, path: &str) -> Result<toml::Value, CodecError> {
    let unrepresentable = |reason| CodecError::Unrepresentable {
        format: "TOML",
        path: path.to_string(),
        reason,
    };

    Ok(match value {
        Value::Null => return Err(unrepresentable("TOML has no null")),
        Value::Bool(b) => toml::Value::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => toml::Value::Integer(i),
            (None, Some(f)) if n.is_f64() => toml::Value::Float(f),
            _ => return Err(unrepresentable("integer out of range")),
        },
        Value::String(s) => toml::Value::String(s.clone()),
        Value::Array(items) => toml::Value::Array(
            items
                .iter()
                .map(|item| to_toml(item, path))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => toml::Value::Table(to_toml_table(map, Some(path))?),
    })
}

/// Codecs keyed by the file extensions they claim.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: Vec<Box<dyn FormatCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            codecs: vec![Box::new(YamlCodec), Box::new(JsonCodec), Box::new(TomlCodec)],
        }
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Adds a codec. Later registrations take precedence for shared extensions.
    pub fn register(&mut self, codec: impl FormatCodec + 'static) {
        self.register_boxed(Box::new(codec));
    }

    pub fn register_boxed(&mut self, codec: Box<dyn FormatCodec>) {
        self.codecs.insert(0, codec);
    }

    /// Looks up a codec by extension, with or without the leading dot.
    pub fn for_extension(&self, extension: &str) -> Result<&dyn FormatCodec, ConfigError> {
        let wanted = format!(".{}", extension.trim_start_matches('.')).to_lowercase();
        self.codecs
            .iter()
            .find(|codec| codec.extensions().iter().any(|ext| ext.eq_ignore_ascii_case(&wanted)))
            .map(|codec| &**codec)
            .ok_or_else(|| ConfigError::UnsupportedFormat {
                extension: wanted,
                supported: self.supported_extensions(),
            })
    }

    pub fn for_path(&self, path: &Path) -> Result<&dyn FormatCodec, ConfigError> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.for_extension(&extension)
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.for_path(path).is_ok()
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self
            .codecs
            .iter()
            .flat_map(|codec| codec.extensions().iter().map(|ext| ext.to_string()))
            .collect();
        extensions.sort();
        extensions.dedup();
        extensions
    }
}
