use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::codec::{CodecRegistry, FormatCodec};
use super::env::{
    EnvVars, Environment, EnvironmentResolver, IntoEnvironment, DEFAULT_ENV_VAR,
};
use super::tree::{self, ConfigTree, DEFAULT_SEPARATOR};
use super::validate::{RuleSpec, ValidationEngine};
use super::ConfigError;

/// The resolved view together with the state it was derived from.
#[derive(Debug)]
struct ResolvedSnapshot {
    generation: u64,
    environment: Environment,
    tree: ConfigTree,
}

/// Layered configuration: files merged in load order, an active environment
/// overlay, environment-variable overrides and validation.
///
/// Each source is deep-merged over what was loaded before it: a table meeting
/// a table combines key by key, and any other pairing takes the newer value.
///
/// ## Environment blocks
///
/// A top-level table named after the active environment is merged over its
/// siblings in the resolved view:
///
/// ```toml
/// [app]
/// debug = false
///
/// [production.app]
/// workers = 8
/// ```
///
/// ## Example
///
/// ```no_run
/// use stratacfg::ConfigStore;
///
/// let mut store = ConfigStore::new();
/// store
///     .load("config/default.toml")?
///     .load_optional("config/local.yaml")?
///     .set_environment("production")?
///     .apply_env_overrides("CONFIG_");
///
/// store.add_rule("database.port", "port")?;
/// store.validate(true)?;
///
/// let host = store.get_or("database.host", "localhost".into());
/// # Ok::<(), stratacfg::ConfigError>(())
/// ```
///
/// A store is single-threaded: the resolved view is cached behind a
/// `RefCell`, so the type is `Send` but not `Sync`.
#[derive(Debug)]
pub struct ConfigStore {
    raw: ConfigTree,
    sources: Vec<PathBuf>,
    resolver: EnvironmentResolver,
    validator: ValidationEngine,
    codecs: CodecRegistry,
    separator: String,
    generation: u64,
    resolved: RefCell<Option<ResolvedSnapshot>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.get_resolved_config(true);
        match serde_json::to_string_pretty(&resolved) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{resolved:?}"),
        }
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ConfigStoreBuilder {
        ConfigStoreBuilder::default()
    }

    /// Every mutation goes through here so the resolved cache can never
    /// outlive the state it was built from.
    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn read_source(&self, path: &Path, codec: Option<&dyn FormatCodec>) -> Result<ConfigTree, ConfigError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let codec = match codec {
            Some(codec) => codec,
            None => self.codecs.for_path(path)?,
        };

        codec.decode(&bytes).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn merge_source(&mut self, path: &Path, tree: ConfigTree) {
        debug!(path = %path.display(), keys = tree.len(), "merging configuration source");
        tree::deep_merge_into(&mut self.raw, tree);
        self.sources.push(path.to_path_buf());
        self.touch();
    }

    /// Loads a file, picking the codec from its extension, and merges it
    /// over the current configuration.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<&mut Self, ConfigError> {
        let path = path.as_ref();
        let tree = self.read_source(path, None)?;
        self.merge_source(path, tree);
        Ok(self)
    }

    /// Like [`load`](Self::load) with an explicit codec, whatever the extension.
    pub fn load_with_codec(
        &mut self,
        path: impl AsRef<Path>,
        codec: &dyn FormatCodec,
    ) -> Result<&mut Self, ConfigError> {
        let path = path.as_ref();
        let tree = self.read_source(path, Some(codec))?;
        self.merge_source(path, tree);
        Ok(self)
    }

    /// Like [`load`](Self::load), but a missing file is silently skipped.
    pub fn load_optional(&mut self, path: impl AsRef<Path>) -> Result<&mut Self, ConfigError> {
        let path = path.as_ref();
        match self.read_source(path, None) {
            Ok(tree) => self.merge_source(path, tree),
            Err(ConfigError::FileNotFound(_)) => {
                debug!(path = %path.display(), "optional configuration file not found");
            }
            Err(e) => return Err(e),
        }
        Ok(self)
    }

    /// Loads every supported file in `dir`, sorted by path.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>, recursive: bool) -> Result<&mut Self, ConfigError> {
        self.load_dir_filtered(dir.as_ref(), recursive, None)
    }

    /// Like [`load_dir`](Self::load_dir), keeping only files whose name
    /// matches the regular expression `pattern`.
    pub fn load_dir_matching(
        &mut self,
        dir: impl AsRef<Path>,
        pattern: &str,
        recursive: bool,
    ) -> Result<&mut Self, ConfigError> {
        let filter = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.load_dir_filtered(dir.as_ref(), recursive, Some(&filter))
    }

    fn load_dir_filtered(
        &mut self,
        dir: &Path,
        recursive: bool,
        filter: Option<&Regex>,
    ) -> Result<&mut Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        self.collect_files(dir, recursive, &mut files)?;
        if let Some(filter) = filter {
            files.retain(|path| {
                path.file_name()
                    .is_some_and(|name| filter.is_match(&name.to_string_lossy()))
            });
        }
        files.sort();
        debug!(dir = %dir.display(), count = files.len(), "loading configuration directory");

        for file in files {
            self.load(&file)?;
        }
        Ok(self)
    }

    fn collect_files(&self, dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
        let read_error = |source| ConfigError::ReadError {
            path: dir.to_path_buf(),
            source,
        };

        for entry in std::fs::read_dir(dir).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            if path.is_dir() {
                if recursive {
                    self.collect_files(&path, recursive, out)?;
                }
            } else if self.codecs.supports(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    /// Merges an in-memory tree. It is not recorded as a source.
    pub fn load_tree(&mut self, tree: ConfigTree) -> &mut Self {
        tree::deep_merge_into(&mut self.raw, tree);
        self.touch();
        self
    }

    pub fn set_environment(&mut self, env: impl IntoEnvironment) -> Result<&mut Self, ConfigError> {
        let env = self.resolver.set_environment(env)?;
        info!(environment = %env, "environment selected");
        self.touch();
        Ok(self)
    }

    pub fn environment(&self) -> Environment {
        self.resolver.current_environment()
    }

    pub fn resolver(&self) -> &EnvironmentResolver {
        &self.resolver
    }

    /// Merges overrides taken from variables starting with `prefix`.
    pub fn apply_env_overrides(&mut self, prefix: &str) -> &mut Self {
        let overrides = self.resolver.compute_overrides(prefix, true);
        if !overrides.is_empty() {
            tree::deep_merge_into(&mut self.raw, overrides);
            self.touch();
        }
        self
    }

    /// Looks up `path`, preferring the active environment's block.
    ///
    /// `<env>.<path>` wins when it holds a non-null value; otherwise the
    /// bare path is read. Both lookups go against the raw tree.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let env_key = self.resolver.config_key_for(path);
        match tree::get(&self.raw, &env_key, &self.separator) {
            Some(value) if !value.is_null() => Some(value),
            _ => tree::get(&self.raw, path, &self.separator),
        }
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).cloned().unwrap_or(default)
    }

    pub fn has(&self, path: &str) -> bool {
        let env_key = self.resolver.config_key_for(path);
        tree::has(&self.raw, &env_key, &self.separator) || tree::has(&self.raw, path, &self.separator)
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> &mut Self {
        tree::set(&mut self.raw, path, &self.separator, value.into());
        self.touch();
        self
    }

    /// Removes `path` from the raw tree, returning the removed value.
    pub fn delete(&mut self, path: &str) -> Option<Value> {
        let removed = tree::delete(&mut self.raw, path, &self.separator);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Applies each `(path, value)` pair in order.
    pub fn update<I, K, V>(&mut self, updates: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (path, value) in updates {
            self.set(path.as_ref(), value);
        }
        self
    }

    /// The raw tree with the active environment's block merged over it.
    ///
    /// With `use_cache`, a snapshot is reused until the next mutation or
    /// environment change.
    pub fn get_resolved_config(&self, use_cache: bool) -> ConfigTree {
        let environment = self.environment();

        if use_cache {
            if let Some(snapshot) = self.resolved.borrow().as_ref() {
                if snapshot.generation == self.generation && snapshot.environment == environment {
                    return snapshot.tree.clone();
                }
            }
        }

        let mut resolved = self.raw.clone();
        let tree = match resolved.remove(environment.as_str()) {
            Some(Value::Object(env_block)) => {
                tree::deep_merge_into(&mut resolved, env_block);
                resolved
            }
            Some(other) => {
                resolved.insert(environment.as_str().to_string(), other);
                resolved
            }
            None => resolved,
        };

        if use_cache {
            self.resolved.replace(Some(ResolvedSnapshot {
                generation: self.generation,
                environment,
                tree: tree.clone(),
            }));
        }
        tree
    }

    /// The resolved view when `resolved`, otherwise a copy of the raw tree.
    pub fn to_tree(&self, resolved: bool) -> ConfigTree {
        if resolved {
            self.get_resolved_config(true)
        } else {
            self.raw.clone()
        }
    }

    pub fn raw(&self) -> &ConfigTree {
        &self.raw
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// All leaf paths, sorted.
    pub fn keys(&self, resolved: bool) -> Vec<String> {
        tree::flatten(&self.to_tree(resolved), &self.separator)
            .into_keys()
            .collect()
    }

    /// All `(path, leaf)` pairs, sorted by path.
    pub fn items(&self, resolved: bool) -> Vec<(String, Value)> {
        tree::flatten(&self.to_tree(resolved), &self.separator)
            .into_iter()
            .collect()
    }

    /// Deserializes the resolved configuration into `T`.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let value = Value::Object(self.get_resolved_config(true));
        serde_json::from_value(value).map_err(ConfigError::DeserializeError)
    }

    pub fn validator(&self) -> &ValidationEngine {
        &self.validator
    }

    pub fn validator_mut(&mut self) -> &mut ValidationEngine {
        &mut self.validator
    }

    pub fn add_rule(&mut self, path: &str, rule: impl Into<RuleSpec>) -> Result<&mut Self, ConfigError> {
        self.validator.add_rule(path, rule)?;
        Ok(self)
    }

    pub fn remove_rule(&mut self, path: &str, rule_name: Option<&str>) -> &mut Self {
        self.validator.remove_rule(path, rule_name);
        self
    }

    /// Validates the resolved configuration.
    pub fn validate(&self, raise_on_error: bool) -> Result<Vec<String>, ConfigError> {
        self.validator
            .validate(&self.get_resolved_config(true), raise_on_error)
    }

    /// Writes the configuration using the codec matching `target`'s extension.
    pub fn save(&self, target: impl AsRef<Path>, resolved: bool) -> Result<(), ConfigError> {
        let target = target.as_ref();
        let codec = self.codecs.for_path(target)?;
        self.save_with_codec(target, codec, resolved)
    }

    /// Writes the configuration in the format registered for `extension`,
    /// regardless of `target`'s own extension.
    pub fn save_as(&self, target: impl AsRef<Path>, extension: &str, resolved: bool) -> Result<(), ConfigError> {
        let codec = self.codecs.for_extension(extension)?;
        self.save_with_codec(target.as_ref(), codec, resolved)
    }

    pub fn save_with_codec(
        &self,
        target: impl AsRef<Path>,
        codec: &dyn FormatCodec,
        resolved: bool,
    ) -> Result<(), ConfigError> {
        let target = target.as_ref();
        let tree = self.to_tree(resolved);
        let bytes = codec.encode(&tree).map_err(|source| ConfigError::EncodeError {
            path: target.to_path_buf(),
            source,
        })?;

        let write_error = |source| ConfigError::WriteError {
            path: target.to_path_buf(),
            source,
        };
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(target, bytes).map_err(write_error)?;

        debug!(path = %target.display(), codec = codec.name(), resolved, "configuration saved");
        Ok(())
    }

    /// Rebuilds the raw tree from the recorded sources, in their original
    /// order. Values set programmatically since are lost; sources that no
    /// longer exist are skipped.
    ///
    /// Every source is read before anything is replaced, so a failing source
    /// leaves the store as it was.
    pub fn reload(&mut self) -> Result<&mut Self, ConfigError> {
        let mut fresh = Vec::with_capacity(self.sources.len());
        for path in &self.sources {
            if !path.exists() {
                warn!(path = %path.display(), "configuration source disappeared, skipping");
                continue;
            }
            fresh.push((path.clone(), self.read_source(path, None)?));
        }

        self.raw.clear();
        self.sources.clear();
        self.touch();
        for (path, tree) in fresh {
            self.merge_source(&path, tree);
        }
        Ok(self)
    }

    /// Drops all configuration data and recorded sources.
    pub fn clear(&mut self) -> &mut Self {
        self.raw.clear();
        self.sources.clear();
        self.touch();
        self
    }
}

/// Builder for a [`ConfigStore`].
#[derive(Debug, Default)]
#[must_use = "builders do nothing until .build() is called"]
pub struct ConfigStoreBuilder {
    env_var: Option<String>,
    separator: Option<String>,
    env_vars: Option<EnvVars>,
    codecs: Vec<Box<dyn FormatCodec>>,
}

impl ConfigStoreBuilder {
    /// The variable naming the active environment (default `APP_ENV`).
    pub fn env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = Some(name.into());
        self
    }

    /// The dot-path separator (default `.`).
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    /// Reads environment variables from `vars` instead of the process.
    pub fn env_vars(mut self, vars: EnvVars) -> Self {
        self.env_vars = Some(vars);
        self
    }

    /// Registers an additional codec, taking precedence over the built-in ones.
    pub fn codec(mut self, codec: impl FormatCodec + 'static) -> Self {
        self.codecs.push(Box::new(codec));
        self
    }

    /// # Panics
    ///
    /// Panics if an empty separator was configured.
    pub fn build(self) -> ConfigStore {
        let separator = self.separator.unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
        let resolver = EnvironmentResolver::new(self.env_var.unwrap_or_else(|| DEFAULT_ENV_VAR.to_string()))
            .with_vars(self.env_vars.unwrap_or_default())
            .with_separator(separator.clone());

        let mut codecs = CodecRegistry::default();
        for codec in self.codecs {
            codecs.register_boxed(codec);
        }

        ConfigStore {
            raw: ConfigTree::new(),
            sources: Vec::new(),
            resolver,
            validator: ValidationEngine::new().with_separator(separator.clone()),
            codecs,
            separator,
            generation: 0,
            resolved: RefCell::new(None),
        }
    }
}
