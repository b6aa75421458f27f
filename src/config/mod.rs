//! Configuration loading, layering and validation.

mod codec;
mod env;
mod error;
mod store;
pub mod tree;
mod validate;

pub use codec::{CodecError, CodecRegistry, FormatCodec, JsonCodec, TomlCodec, YamlCodec};
pub use env::{
    coerce_value, overrides_from, EnvVars, Environment, EnvironmentResolver, IntoEnvironment,
    DEFAULT_ENV_VAR, DEFAULT_OVERRIDE_PREFIX,
};
pub use error::ConfigError;
pub use store::{ConfigStore, ConfigStoreBuilder};
pub use tree::{ConfigTree, FlatMap, DEFAULT_SEPARATOR};
pub use validate::{BoxError, BuiltinRule, RuleOutcome, RuleSpec, ValidationEngine, ValidationRule};
