//! Declarative validation of resolved configuration.
//!
//! Rules are registered against dot-paths and evaluated in registration
//! order. A failing rule never aborts validation; every violation is
//! collected into a human-readable message.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use url::Url;

use super::tree::{self, display_value, ConfigTree, DEFAULT_SEPARATOR};
use super::ConfigError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a predicate reports. `Err` is treated the same as `Ok(false)`.
pub type RuleOutcome = Result<bool, BoxError>;

type Predicate = Arc<dyn Fn(&Value) -> RuleOutcome + Send + Sync>;

/// A named check applied to the value at a configuration path.
#[derive(Clone)]
pub struct ValidationRule {
    name: String,
    error_message: String,
    description: String,
    required: bool,
    predicate: Predicate,
}

impl ValidationRule {
    pub fn new<F>(name: impl Into<String>, error_message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> RuleOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            error_message: error_message.into(),
            description: String::new(),
            required: false,
            predicate: Arc::new(predicate),
        }
    }

    /// Marks the rule so that a missing key is itself a violation.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn check(&self, value: &Value) -> bool {
        matches!((self.predicate)(value), Ok(true))
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("error_message", &self.error_message)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = if self.description.is_empty() {
            &self.error_message
        } else {
            &self.description
        };
        write!(f, "ValidationRule({}): {}", self.name, text)
    }
}

/// The rules that ship with the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinRule {
    Url,
    Port,
    Email,
    Required,
    MinLength(usize),
    MaxLength(usize),
    Range { min: f64, max: f64 },
    MinValue(f64),
    MaxValue(f64),
    Choices(Vec<Value>),
    Pattern(String),
}

impl BuiltinRule {
    /// Rules addressable by bare name.
    pub const NAMED: [&'static str; 4] = ["url", "port", "email", "required"];

    pub fn into_rule(self) -> Result<ValidationRule, ConfigError> {
        let rule = match self {
            BuiltinRule::Url => ValidationRule::new(
                "url",
                "must be a valid URL with scheme and netloc",
                |v| Ok(is_url(&display_value(v))),
            )
            .with_description("Validates URLs (http://example.com)"),
            BuiltinRule::Port => ValidationRule::new(
                "port",
                "must be a valid port number (1-65535)",
                |v| Ok(as_integer(v).is_some_and(|n| (1..=65535).contains(&n))),
            )
            .with_description("Validates network port numbers"),
            BuiltinRule::Email => ValidationRule::new("email", "must be a valid email address", |v| {
                Ok(EMAIL.is_match(&display_value(v)))
            })
            .with_description("Validates email addresses"),
            BuiltinRule::Required => {
                ValidationRule::new("required", "is required and cannot be empty", |v| {
                    Ok(is_present(v))
                })
                .with_description("Ensures value is not null or empty")
                .required(true)
            }
            BuiltinRule::MinLength(min) => ValidationRule::new(
                format!("min_length_{min}"),
                format!("must be at least {min} characters long"),
                move |v| Ok(char_len(v) >= min),
            ),
            BuiltinRule::MaxLength(max) => ValidationRule::new(
                format!("max_length_{max}"),
                format!("must be at most {max} characters long"),
                move |v| Ok(char_len(v) <= max),
            ),
            BuiltinRule::Range { min, max } => ValidationRule::new(
                format!("range_{min}_{max}"),
                format!("must be between {min} and {max}"),
                move |v| Ok(as_float(v).is_some_and(|n| min <= n && n <= max)),
            ),
            BuiltinRule::MinValue(min) => ValidationRule::new(
                format!("min_value_{min}"),
                format!("must be at least {min}"),
                move |v| Ok(as_float(v).is_some_and(|n| n >= min)),
            ),
            BuiltinRule::MaxValue(max) => ValidationRule::new(
                format!("max_value_{max}"),
                format!("must be at most {max}"),
                move |v| Ok(as_float(v).is_some_and(|n| n <= max)),
            ),
            BuiltinRule::Choices(choices) => {
                let listed = choices.iter().map(display_value).collect::<Vec<_>>().join(", ");
                ValidationRule::new(
                    format!("choices_{}", choices.len()),
                    format!("must be one of: {listed}"),
                    move |v| Ok(choices.contains(v)),
                )
            }
            BuiltinRule::Pattern(pattern) => {
                let anchored = Regex::new(&format!("^(?:{pattern})")).map_err(|source| {
                    ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                ValidationRule::new("pattern", format!("must match pattern {pattern}"), move |v| {
                    Ok(anchored.is_match(&display_value(v)))
                })
            }
        };
        Ok(rule)
    }
}

impl FromStr for BuiltinRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(BuiltinRule::Url),
            "port" => Ok(BuiltinRule::Port),
            "email" => Ok(BuiltinRule::Email),
            "required" => Ok(BuiltinRule::Required),
            _ => Err(ConfigError::UnknownRule {
                name: s.to_string(),
                available: BuiltinRule::NAMED.to_vec(),
            }),
        }
    }
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email regex is valid")
});

fn is_url(s: &str) -> bool {
    Url::parse(s).is_ok_and(|url| !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn char_len(value: &Value) -> usize {
    display_value(value).chars().count()
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A rule as accepted by [`ValidationEngine::add_rule`].
#[derive(Debug, Clone)]
pub enum RuleSpec {
    Custom(ValidationRule),
    Builtin(BuiltinRule),
    Named(String),
}

impl From<ValidationRule> for RuleSpec {
    fn from(rule: ValidationRule) -> Self {
        RuleSpec::Custom(rule)
    }
}

impl From<BuiltinRule> for RuleSpec {
    fn from(rule: BuiltinRule) -> Self {
        RuleSpec::Builtin(rule)
    }
}

impl From<&str> for RuleSpec {
    fn from(name: &str) -> Self {
        RuleSpec::Named(name.to_string())
    }
}

impl From<String> for RuleSpec {
    fn from(name: String) -> Self {
        RuleSpec::Named(name)
    }
}

impl RuleSpec {
    fn into_rule(self) -> Result<ValidationRule, ConfigError> {
        match self {
            RuleSpec::Custom(rule) => Ok(rule),
            RuleSpec::Builtin(builtin) => builtin.into_rule(),
            RuleSpec::Named(name) => name.parse::<BuiltinRule>()?.into_rule(),
        }
    }
}

/// Registry of path -> rules, kept in the order paths were first added.
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    rules: Vec<(String, Vec<ValidationRule>)>,
    separator: String,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        let separator = separator.into();
        assert!(!separator.is_empty(), "separator must not be empty");
        self.separator = separator;
        self
    }

    pub fn add_rule(&mut self, key_path: &str, rule: impl Into<RuleSpec>) -> Result<(), ConfigError> {
        let rule = rule.into().into_rule()?;
        match self.rules.iter_mut().find(|(path, _)| path == key_path) {
            Some((_, rules)) => rules.push(rule),
            None => self.rules.push((key_path.to_string(), vec![rule])),
        }
        Ok(())
    }

    /// Removes all rules at `key_path`, or only those named `rule_name`.
    pub fn remove_rule(&mut self, key_path: &str, rule_name: Option<&str>) {
        let Some(idx) = self.rules.iter().position(|(path, _)| path == key_path) else {
            return;
        };

        if let Some(name) = rule_name {
            self.rules[idx].1.retain(|rule| rule.name != name);
            if !self.rules[idx].1.is_empty() {
                return;
            }
        }
        self.rules.remove(idx);
    }

    pub fn rules_for(&self, key_path: &str) -> &[ValidationRule] {
        self.rules
            .iter()
            .find(|(path, _)| path == key_path)
            .map(|(_, rules)| rules.as_slice())
            .unwrap_or(&[])
    }

    /// Rule names per path, in registration order.
    pub fn list_rules(&self) -> Vec<(String, Vec<String>)> {
        self.rules
            .iter()
            .map(|(path, rules)| (path.clone(), rules.iter().map(|r| r.name.clone()).collect()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Checks `config` against every registered rule.
    ///
    /// With `raise_on_error`, a non-empty result becomes
    /// [`ConfigError::ValidationFailed`].
    pub fn validate(&self, config: &ConfigTree, raise_on_error: bool) -> Result<Vec<String>, ConfigError> {
        let errors: Vec<String> = self
            .rules
            .iter()
            .flat_map(|(path, rules)| self.check_path(path, rules, config))
            .collect();

        if raise_on_error && !errors.is_empty() {
            return Err(ConfigError::ValidationFailed { errors });
        }
        Ok(errors)
    }

    /// Checks a single registered path.
    pub fn validate_key(&self, key_path: &str, config: &ConfigTree) -> Vec<String> {
        self.check_path(key_path, self.rules_for(key_path), config)
    }

    fn check_path(&self, path: &str, rules: &[ValidationRule], config: &ConfigTree) -> Vec<String> {
        let value = match tree::get(config, path, &self.separator) {
            Some(value) if !value.is_null() => value,
            _ => {
                return if rules.iter().any(ValidationRule::is_required) {
                    vec![format!("{path}: Required key is missing")]
                } else {
                    Vec::new()
                };
            }
        };

        rules
            .iter()
            .filter(|rule| !rule.check(value))
            .map(|rule| format!("{path}: {} (value: {})", rule.error_message, display_value(value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> ConfigTree {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    fn check(rule: BuiltinRule, value: Value) -> bool {
        rule.into_rule().unwrap().check(&value)
    }

    #[test]
    fn test_url_rule() {
        assert!(check(BuiltinRule::Url, json!("http://example.com")));
        assert!(check(BuiltinRule::Url, json!("postgres://user@db:5432/app")));
        assert!(!check(BuiltinRule::Url, json!("example.com")));
        assert!(!check(BuiltinRule::Url, json!("mailto:someone@example.com")));
        assert!(!check(BuiltinRule::Url, json!(42)));
    }

    #[test]
    fn test_port_rule() {
        assert!(check(BuiltinRule::Port, json!(8080)));
        assert!(check(BuiltinRule::Port, json!("443")));
        assert!(check(BuiltinRule::Port, json!(65535)));
        assert!(!check(BuiltinRule::Port, json!(0)));
        assert!(!check(BuiltinRule::Port, json!(99999)));
        assert!(!check(BuiltinRule::Port, json!("http")));
        assert!(!check(BuiltinRule::Port, json!([80])));
    }

    #[test]
    fn test_email_rule() {
        assert!(check(BuiltinRule::Email, json!("ops@example.com")));
        assert!(check(BuiltinRule::Email, json!("first.last+tag@mail.example.org")));
        assert!(!check(BuiltinRule::Email, json!("not-an-email")));
        assert!(!check(BuiltinRule::Email, json!("a@b.c")));
    }

    #[test]
    fn test_required_rule() {
        assert!(check(BuiltinRule::Required, json!("x")));
        assert!(check(BuiltinRule::Required, json!(false)));
        assert!(check(BuiltinRule::Required, json!(0)));
        assert!(!check(BuiltinRule::Required, json!("   ")));
        assert!(!check(BuiltinRule::Required, json!([])));
        assert!(!check(BuiltinRule::Required, json!({})));
        assert!(BuiltinRule::Required.into_rule().unwrap().is_required());
    }

    #[test]
    fn test_parametrized_rules() {
        assert!(check(BuiltinRule::MinLength(3), json!("abc")));
        assert!(!check(BuiltinRule::MinLength(3), json!("ab")));
        assert!(check(BuiltinRule::MaxLength(2), json!(42)));
        assert!(!check(BuiltinRule::MaxLength(2), json!(420)));

        let range = BuiltinRule::Range { min: 1.0, max: 10.0 };
        assert!(check(range.clone(), json!(1)));
        assert!(check(range.clone(), json!("10")));
        assert!(!check(range.clone(), json!(10.5)));
        assert!(!check(range, json!("ten")));

        assert!(check(BuiltinRule::MinValue(0.5), json!(1)));
        assert!(!check(BuiltinRule::MaxValue(0.5), json!(1)));

        let choices = BuiltinRule::Choices(vec![json!("debug"), json!("info")]);
        assert!(check(choices.clone(), json!("info")));
        assert!(!check(choices, json!("trace")));
    }

    #[test]
    fn test_pattern_rule_is_anchored_at_start() {
        let rule = BuiltinRule::Pattern("[a-z]+-\\d".into()).into_rule().unwrap();
        assert!(rule.check(&json!("api-1")));
        assert!(rule.check(&json!("api-1-extra")));
        assert!(!rule.check(&json!("x api-1")));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = BuiltinRule::Pattern("(".into()).into_rule().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_unknown_named_rule() {
        let mut engine = ValidationEngine::new();
        let err = engine.add_rule("a", "uuid").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRule { ref name, .. } if name == "uuid"));
        assert!(err.to_string().contains("url"));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_failing_predicate_is_invalid() {
        let rule = ValidationRule::new("even", "must be even", |v| {
            let n = v.as_i64().ok_or("not an integer")?;
            Ok(n % 2 == 0)
        });
        assert!(rule.check(&json!(4)));
        assert!(!rule.check(&json!(3)));
        assert!(!rule.check(&json!("four")));
    }

    #[test]
    fn test_port_out_of_range_reports_path() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("db.port", "port").unwrap();

        let errors = engine.validate(&config(json!({"db": {"port": 99999}})), false).unwrap();

        assert_eq!(
            errors,
            vec!["db.port: must be a valid port number (1-65535) (value: 99999)"]
        );
    }

    #[test]
    fn test_missing_optional_vs_required() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("api.url", "url").unwrap();
        assert!(engine.validate(&ConfigTree::new(), false).unwrap().is_empty());

        engine.add_rule("api.key", BuiltinRule::Required).unwrap();
        engine.add_rule("api.key", BuiltinRule::MinLength(8)).unwrap();
        let errors = engine.validate(&ConfigTree::new(), false).unwrap();
        assert_eq!(errors, vec!["api.key: Required key is missing"]);
    }

    #[test]
    fn test_null_counts_as_missing() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("name", "required").unwrap();
        let errors = engine.validate(&config(json!({"name": null})), false).unwrap();
        assert_eq!(errors, vec!["name: Required key is missing"]);
    }

    #[test]
    fn test_errors_follow_registration_order() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("b", BuiltinRule::MinLength(5)).unwrap();
        engine.add_rule("a", "email").unwrap();
        engine.add_rule("b", BuiltinRule::Pattern("x".into())).unwrap();

        let errors = engine
            .validate(&config(json!({"a": "nope", "b": "abc"})), false)
            .unwrap();

        assert_eq!(
            errors,
            vec![
                "b: must be at least 5 characters long (value: abc)",
                "b: must match pattern x (value: abc)",
                "a: must be a valid email address (value: nope)",
            ]
        );
    }

    #[test]
    fn test_raise_on_error() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("port", "port").unwrap();

        let err = engine
            .validate(&config(json!({"port": 0})), true)
            .unwrap_err();
        match err {
            ConfigError::ValidationFailed { errors } => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other}"),
        }

        assert!(engine.validate(&config(json!({"port": 80})), true).unwrap().is_empty());
    }

    #[test]
    fn test_remove_rule() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("a", "url").unwrap();
        engine.add_rule("a", "required").unwrap();
        engine.add_rule("b", "port").unwrap();

        engine.remove_rule("a", Some("url"));
        assert_eq!(engine.rules_for("a").len(), 1);

        engine.remove_rule("a", Some("required"));
        assert!(engine.rules_for("a").is_empty());
        assert_eq!(engine.list_rules(), vec![("b".to_string(), vec!["port".to_string()])]);

        engine.remove_rule("b", None);
        engine.remove_rule("missing", None);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_validate_key() {
        let mut engine = ValidationEngine::new();
        engine.add_rule("a", "port").unwrap();
        engine.add_rule("b", "port").unwrap();

        let cfg = config(json!({"a": 0, "b": 0}));
        assert_eq!(engine.validate_key("a", &cfg).len(), 1);
        assert!(engine.validate_key("unregistered", &cfg).is_empty());
    }

    #[test]
    #[should_panic(expected = "separator must not be empty")]
    fn test_empty_separator_panics() {
        let _ = ValidationEngine::new().with_separator("");
    }
}
