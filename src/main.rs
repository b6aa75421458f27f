use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use stratacfg::config::tree::{self, display_value};
use stratacfg::config::{JsonCodec, YamlCodec, DEFAULT_SEPARATOR};
use stratacfg::{ConfigStore, ConfigTree, FormatCodec};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", author, version, about = "Inspect, validate and convert layered configuration", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration files against built-in rules
    Validate {
        /// Configuration files, lowest precedence first
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        layer: LayerArgs,

        /// Rule to apply, as `path:rule` (e.g. `database.port:port`)
        #[arg(long = "rule")]
        rules: Vec<String>,

        /// Print statistics about the loaded configuration
        #[arg(long)]
        stats: bool,
    },

    /// Display the merged configuration
    Show {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        layer: LayerArgs,

        #[arg(long, value_enum, default_value_t = ShowFormat::Json)]
        format: ShowFormat,

        /// Show a single key only
        #[arg(long)]
        key: Option<String>,

        /// Use the raw tree instead of the environment-resolved view
        #[arg(long)]
        raw: bool,
    },

    /// Convert a configuration file to another format
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Output format (defaults to the output file's extension)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        #[command(flatten)]
        layer: LayerArgs,

        #[arg(long)]
        raw: bool,
    },

    /// List all configuration keys
    Keys {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        layer: LayerArgs,

        /// Only keys matching this regular expression
        #[arg(long)]
        pattern: Option<String>,

        /// Print values next to keys
        #[arg(long)]
        values: bool,

        #[arg(long)]
        raw: bool,
    },
}

#[derive(Args, Debug)]
struct LayerArgs {
    /// Environment to resolve (name or alias such as `prod`)
    #[arg(long = "env")]
    environment: Option<String>,

    /// Prefix of environment variables applied as overrides; empty disables
    #[arg(long, default_value = "CONFIG_")]
    env_prefix: String,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ShowFormat {
    Json,
    Yaml,
    Flat,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum OutputFormat {
    Json,
    Yaml,
    Toml,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Toml => "toml",
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_store(files: &[PathBuf], layer: &LayerArgs) -> Result<ConfigStore> {
    let mut store = ConfigStore::new();

    for file in files {
        debug!(path = %file.display(), "loading");
        store
            .load(file)
            .with_context(|| format!("loading {}", file.display()))?;
    }

    if let Some(env) = &layer.environment {
        store.set_environment(env.as_str())?;
    }

    if !layer.env_prefix.is_empty() {
        store.apply_env_overrides(&layer.env_prefix);
    }

    Ok(store)
}

fn validate(files: &[PathBuf], layer: &LayerArgs, rules: &[String], stats: bool) -> Result<ExitCode> {
    let mut store = open_store(files, layer)?;

    for spec in rules {
        let Some((path, rule)) = spec.split_once(':') else {
            warn!(spec = %spec, "invalid rule specification, expected path:rule");
            continue;
        };
        if let Err(e) = store.add_rule(path, rule) {
            warn!(spec = %spec, error = %e, "skipping rule");
        }
    }

    let errors = store.validate(false)?;
    if !errors.is_empty() {
        println!("Validation failed with {} error(s):", errors.len());
        for (i, error) in errors.iter().enumerate() {
            println!("  {}. {error}", i + 1);
        }
        return Ok(ExitCode::FAILURE);
    }

    println!("Configuration is valid.");
    if stats {
        println!("Files loaded: {}", store.sources().len());
        println!("Total keys: {}", store.keys(true).len());
        println!("Environment: {}", store.environment());
        for source in store.sources() {
            println!("  - {}", source.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn render(tree: &ConfigTree, codec: &dyn FormatCodec) -> Result<String> {
    let bytes = codec.encode(tree)?;
    Ok(String::from_utf8(bytes)?)
}

fn show(files: &[PathBuf], layer: &LayerArgs, format: ShowFormat, key: Option<&str>, raw: bool) -> Result<ExitCode> {
    let store = open_store(files, layer)?;
    let mut config = store.to_tree(!raw);

    if let Some(key) = key {
        let Some(value) = tree::get(&config, key, DEFAULT_SEPARATOR).cloned() else {
            bail!("key '{key}' not found");
        };
        config = ConfigTree::new();
        config.insert(key.to_string(), value);
    }

    match format {
        ShowFormat::Json => print!("{}", render(&config, &JsonCodec)?),
        ShowFormat::Yaml => print!("{}", render(&config, &YamlCodec)?),
        ShowFormat::Flat => {
            for (key, value) in tree::flatten(&config, DEFAULT_SEPARATOR) {
                println!("{key}={}", display_value(&value));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn convert(
    input: &Path,
    output: &Path,
    format: Option<OutputFormat>,
    layer: &LayerArgs,
    raw: bool,
) -> Result<ExitCode> {
    let store = open_store(&[input.to_path_buf()], layer)?;

    match format {
        Some(format) => store.save_as(output, format.extension(), !raw)?,
        None => store.save(output, !raw)?,
    }
    println!("Saved {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn keys(files: &[PathBuf], layer: &LayerArgs, pattern: Option<&str>, values: bool, raw: bool) -> Result<ExitCode> {
    let store = open_store(files, layer)?;
    let pattern = pattern
        .map(Regex::new)
        .transpose()
        .context("invalid --pattern")?;

    let keys = store
        .keys(!raw)
        .into_iter()
        .filter(|key| pattern.as_ref().map_or(true, |re| re.is_match(key)));

    for key in keys {
        if values {
            let value = store.get(&key).map(display_value).unwrap_or_default();
            println!("{key}={value}");
        } else {
            println!("{key}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Validate { files, layer, rules, stats } => validate(&files, &layer, &rules, stats),
        Command::Show { files, layer, format, key, raw } => show(&files, &layer, format, key.as_deref(), raw),
        Command::Convert { input, output, format, layer, raw } => convert(&input, &output, format, &layer, raw),
        Command::Keys { files, layer, pattern, values, raw } => {
            keys(&files, &layer, pattern.as_deref(), values, raw)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
