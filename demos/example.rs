use serde::Deserialize;
use stratacfg::{BuiltinRule, ConfigStore};

#[derive(Debug, Deserialize)]
struct AppConfig {
    app: AppSection,
    database: DatabaseSection,
}

#[derive(Debug, Deserialize)]
struct AppSection {
    name: String,
    debug: bool,
    #[serde(default)]
    workers: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct DatabaseSection {
    host: String,
    port: u16,
    name: String,
}

fn main() -> Result<(), stratacfg::ConfigError> {
    let mut store = ConfigStore::new();
    store
        .load("demos/default.toml")?
        .load_optional("demos/local.yaml")?
        .apply_env_overrides("CONFIG_");

    store
        .add_rule("database.port", "port")?
        .add_rule("admin.email", "email")?
        .add_rule("app.name", BuiltinRule::MinLength(3))?;

    for env in ["development", "production"] {
        store.set_environment(env)?;
        store.validate(true)?;

        let config: AppConfig = store.extract()?;
        println!(
            "[{env}] {} (debug={}, workers={:?}) -> {}:{}",
            config.app.name,
            config.app.debug,
            config.app.workers,
            config.database.host,
            config.database.port
        );
    }

    Ok(())
}
