pub mod config;

pub use config::{
    BuiltinRule, ConfigError, ConfigStore, ConfigTree, Environment, EnvironmentResolver, EnvVars,
    FormatCodec, ValidationEngine, ValidationRule,
};
pub use serde_json::Value;
