//! Active environment selection and environment-variable overrides.

use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Number, Value};
use tracing::{debug, warn};

use super::tree::{self, ConfigTree, DEFAULT_SEPARATOR};
use super::ConfigError;

pub const DEFAULT_ENV_VAR: &str = "APP_ENV";
pub const DEFAULT_OVERRIDE_PREFIX: &str = "CONFIG_";

/// The deployment environment a configuration is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Testing,
}

const ALIASES: &[(&str, Environment)] = &[
    ("dev", Environment::Development),
    ("develop", Environment::Development),
    ("development", Environment::Development),
    ("local", Environment::Development),
    ("stage", Environment::Staging),
    ("staging", Environment::Staging),
    ("preprod", Environment::Staging),
    ("pre-production", Environment::Staging),
    ("prod", Environment::Production),
    ("production", Environment::Production),
    ("live", Environment::Production),
    ("test", Environment::Testing),
    ("testing", Environment::Testing),
    ("ci", Environment::Testing),
];

impl Environment {
    pub const ALL: [Environment; 4] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
        Environment::Testing,
    ];

    /// The canonical identifier, also used as the top-level key of the
    /// environment's override block.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Testing => "testing",
        }
    }

    /// All recognized spellings for this environment.
    pub fn aliases(self) -> impl Iterator<Item = &'static str> {
        ALIASES
            .iter()
            .filter(move |(_, env)| *env == self)
            .map(|(alias, _)| *alias)
    }

    /// Lenient detection: an absent or unrecognized value means development.
    pub fn detect(value: Option<&str>) -> Self {
        match value {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = raw, "unrecognized environment, falling back to development");
                Environment::Development
            }),
            None => Environment::Development,
        }
    }

    pub fn is_development(self) -> bool {
        self == Environment::Development
    }

    pub fn is_staging(self) -> bool {
        self == Environment::Staging
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    pub fn is_testing(self) -> bool {
        self == Environment::Testing
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, env)| *env)
            .ok_or_else(|| ConfigError::InvalidEnvironment {
                name: s.to_string(),
                supported: ALIASES.iter().map(|(alias, _)| *alias).collect(),
            })
    }
}

/// Anything that can name an environment: the enum itself or a string alias.
pub trait IntoEnvironment {
    fn into_environment(self) -> Result<Environment, ConfigError>;
}

impl IntoEnvironment for Environment {
    fn into_environment(self) -> Result<Environment, ConfigError> {
        Ok(self)
    }
}

impl IntoEnvironment for &str {
    fn into_environment(self) -> Result<Environment, ConfigError> {
        self.parse()
    }
}

impl IntoEnvironment for String {
    fn into_environment(self) -> Result<Environment, ConfigError> {
        self.parse()
    }
}

/// Where environment variables are read from.
///
/// `Process` reads the live process environment each time it is asked;
/// `Snapshot` is a fixed map, which keeps tests away from global state.
#[derive(Debug, Clone, Default)]
pub enum EnvVars {
    #[default]
    Process,
    Snapshot(BTreeMap<String, String>),
}

impl EnvVars {
    pub fn snapshot<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        EnvVars::Snapshot(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        match self {
            EnvVars::Process => std::env::var(name).ok(),
            EnvVars::Snapshot(vars) => vars.get(name).cloned(),
        }
    }

    /// All variables; entries that are not valid UTF-8 are skipped.
    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            EnvVars::Process => std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
            EnvVars::Snapshot(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// Tracks the active environment and converts prefixed environment
/// variables into an override tree.
///
/// The environment is detected lazily from the selector variable on first
/// read. Overrides are cached per prefix until the environment changes or
/// [`clear_cache`](Self::clear_cache) is called.
#[derive(Debug)]
pub struct EnvironmentResolver {
    selector_var: String,
    separator: String,
    vars: EnvVars,
    active: OnceCell<Environment>,
    overrides: RefCell<Option<(String, ConfigTree)>>,
}

impl Default for EnvironmentResolver {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_VAR)
    }
}

impl EnvironmentResolver {
    pub fn new(selector_var: impl Into<String>) -> Self {
        Self {
            selector_var: selector_var.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
            vars: EnvVars::Process,
            active: OnceCell::new(),
            overrides: RefCell::new(None),
        }
    }

    pub fn with_vars(mut self, vars: EnvVars) -> Self {
        self.vars = vars;
        self.active = OnceCell::new();
        self.overrides = RefCell::new(None);
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        let separator = separator.into();
        assert!(!separator.is_empty(), "separator must not be empty");
        self.separator = separator;
        self
    }

    pub fn selector_var(&self) -> &str {
        &self.selector_var
    }

    pub fn current_environment(&self) -> Environment {
        *self
            .active
            .get_or_init(|| Environment::detect(self.vars.get(&self.selector_var).as_deref()))
    }

    /// Explicitly selects the environment. Unknown names are an error here,
    /// unlike implicit detection.
    pub fn set_environment(&mut self, env: impl IntoEnvironment) -> Result<Environment, ConfigError> {
        let env = env.into_environment()?;
        self.active = OnceCell::from(env);
        self.clear_cache();
        Ok(env)
    }

    pub fn clear_cache(&self) {
        self.overrides.replace(None);
    }

    /// Builds the override tree from variables starting with `prefix`.
    pub fn compute_overrides(&self, prefix: &str, use_cache: bool) -> ConfigTree {
        if use_cache {
            if let Some((cached_prefix, tree)) = self.overrides.borrow().as_ref() {
                if cached_prefix == prefix {
                    return tree.clone();
                }
            }
        }

        let overrides = overrides_from(prefix, self.vars.entries(), &self.separator);
        debug!(prefix, count = overrides.len(), "computed environment overrides");

        if use_cache {
            self.overrides
                .replace(Some((prefix.to_string(), overrides.clone())));
        }
        overrides
    }

    /// `base_path` inside the active environment's block.
    pub fn config_key_for(&self, base_path: &str) -> String {
        format!("{}{}{}", self.current_environment(), self.separator, base_path)
    }
}

/// Converts `PREFIX_SECTION_KEY=value` pairs into `{section: {key: value}}`.
///
/// When two variables collapse onto the same path the later one in
/// iteration order wins; the order is whatever `vars` yields.
pub fn overrides_from<I>(prefix: &str, vars: I, sep: &str) -> ConfigTree
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut overrides = ConfigTree::new();

    for (key, value) in vars {
        if let Some(rest) = key.strip_prefix(prefix) {
            let path = rest.to_lowercase().replace('_', sep);
            tree::set(&mut overrides, &path, sep, coerce_value(&value));
        }
    }

    overrides
}

const TRUTHY: &[&str] = &["true", "yes", "1", "on", "enabled"];
const FALSY: &[&str] = &["false", "no", "0", "off", "disabled"];

/// Coerces a raw environment string to the most specific value:
/// boolean keyword, integer, float, or the string itself.
pub fn coerce_value(s: &str) -> Value {
    if s.is_empty() {
        return Value::String(String::new());
    }

    if TRUTHY.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        return Value::Bool(true);
    }
    if FALSY.iter().any(|f| s.eq_ignore_ascii_case(f)) {
        return Value::Bool(false);
    }

    let trimmed = s.trim();
    if !trimmed.contains(['.', 'e', 'E']) {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Number(i.into());
        }
    }

    // Non-finite floats have no representation and stay strings.
    if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }

    Value::String(s.to_string())
}
