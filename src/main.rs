// Secure Environment - load envelope-encrypted environment files
//
// This is the main entry point for the application.

use anyhow::{Context, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Region;
use clap::{Args, Parser, Subcommand};
use secure_environment::cipher::EnvelopeCipher;
use secure_environment::config::{Config, Overrides};
use secure_environment::envfile::ContentType;
use secure_environment::kms::AwsKms;
use secure_environment::loader::{format_exports, SecretLoader};
use secure_environment::locator::DEFAULT_PATH_STYLE_REGION;
use secure_environment::store::S3Store;
use secure_environment::supervisor::{build_environment, Supervisor};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Secure Environment - KMS envelope-encrypted environment files on S3
#[derive(Parser, Debug)]
#[command(name = "secure-environment")]
#[command(version = "0.1.1")]
#[command(about = "Load an encrypted environment from S3 for a shell or a command", long_about = None)]
struct Cli {
    /// Set debug logging on
    #[arg(
        long,
        global = true,
        env = "SECURE_ENVIRONMENT_DEBUG",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    debug: bool,

    /// YAML file with default settings
    #[arg(long, global = true, env = "SECURE_ENVIRONMENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
struct SecretArgs {
    /// Sets the key arn
    #[arg(long, env = "SECURE_ENVIRONMENT_KEY")]
    key: Option<String>,

    /// url to the environment file
    #[arg(long, env = "SECURE_ENVIRONMENT_URL")]
    url: Option<String>,

    /// content type of the environment file
    #[arg(long = "env-type", value_enum, env = "SECURE_ENVIRONMENT_TYPE")]
    env_type: Option<ContentType>,

    /// AWS region used when the URL names none
    #[arg(long, env = "SECURE_ENVIRONMENT_REGION")]
    region: Option<String>,

    /// Custom endpoint for S3-compatible storage and KMS
    #[arg(long, env = "SECURE_ENVIRONMENT_ENDPOINT")]
    endpoint: Option<String>,
}

impl From<SecretArgs> for Overrides {
    fn from(args: SecretArgs) -> Self {
        Overrides {
            url: args.url,
            key: args.key,
            env_type: args.env_type,
            region: args.region,
            endpoint: args.endpoint,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a bash compatible export output via stdout
    Export {
        #[command(flatten)]
        secrets: SecretArgs,
    },

    /// Transforms an env file into encrypted env
    Import {
        #[command(flatten)]
        secrets: SecretArgs,

        /// Plaintext environment file to encrypt
        input: PathBuf,

        /// Also write the encrypted envelope to this local file
        output: Option<PathBuf>,
    },

    /// Run a command with decrypted env
    Exec {
        #[command(flatten)]
        secrets: SecretArgs,

        /// Command to run, followed by its arguments
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "COMMAND"
        )]
        command: Vec<String>,
    },
}

/// Initialize tracing on stderr, keeping stdout free for `export`
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("secure_environment=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(filter)
        .init();

    debug!("secure-environment debug logging is on.");
}

/// Resolve AWS settings and credentials once for all clients
///
/// The region comes from `--region`, then the AWS default chain, then `us-east-1`.
async fn load_sdk_config(config: &Config) -> SdkConfig {
    let region = RegionProviderChain::first_try(config.region.clone().map(Region::new))
        .or_default_provider()
        .or_else(Region::from_static(DEFAULT_PATH_STYLE_REGION));

    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .load()
        .await
}

async fn build_loader(config: &Config) -> SecretLoader {
    let sdk_config = load_sdk_config(config).await;
    let kms = AwsKms::new(&sdk_config, config.endpoint.as_deref());
    let store = S3Store::new(sdk_config, config.endpoint.clone());

    SecretLoader::new(Arc::new(store), EnvelopeCipher::new(Arc::new(kms)))
        .with_content_type(config.env_type)
}

fn resolve_config(file: Option<&Path>, secrets: SecretArgs) -> Result<Config> {
    Config::resolve(file, secrets.into())
        .context("Failed to load configuration")
}

async fn run_export(config: &Config) -> Result<i32> {
    if !config.secrets_configured() {
        // Intentionally silent: secrets are optional for export
        debug!("Not configured to load secrets");
        return Ok(0);
    }

    config.locator().context("Invalid secure environment url")?;

    let loader = build_loader(config).await;
    let entries = loader
        .load(config.url(), config.key(), true)
        .await
        .with_context(|| format!("Failed to load secure environment from {}", config.url()))?;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(format_exports(&entries).as_bytes())
        .context("Failed to write exports")?;
    stdout.flush().context("Failed to write exports")?;

    Ok(0)
}

async fn run_import(config: &Config, input: &Path, output: Option<&Path>) -> Result<i32> {
    config
        .validate_for_import()
        .context("Configuration validation failed")?;

    config.locator().context("Invalid secure environment url")?;

    let plaintext = std::fs::read(input)
        .with_context(|| format!("Failed to read environment file: {}", input.display()))?;

    let loader = build_loader(config).await;
    let envelope = loader
        .import(config.url(), config.key(), &plaintext)
        .await
        .with_context(|| format!("Failed to import secure environment to {}", config.url()))?;

    if let Some(path) = output {
        std::fs::write(path, &envelope)
            .with_context(|| format!("Failed to write envelope: {}", path.display()))?;
        debug!("Wrote envelope to {}", path.display());
    }

    Ok(0)
}

async fn run_exec(config: &Config, command: &[String]) -> Result<i32> {
    let entries = if config.secrets_configured() {
        config.locator().context("Invalid secure environment url")?;
        build_loader(config)
            .await
            .load(config.url(), config.key(), false)
            .await
            .with_context(|| {
                format!("Failed to load secure environment from {}", config.url())
            })?
    } else {
        debug!("Not configured to load secrets");
        Vec::new()
    };

    let environment = build_environment(std::env::vars_os(), &entries);
    let outcome = Supervisor::new(command, environment)?
        .run()
        .await
        .with_context(|| format!("Failed to run {}", command[0]))?;

    Ok(outcome.exit_code())
}

async fn run(cli: Cli) -> Result<i32> {
    let config_file = cli.config.as_deref();

    match cli.command {
        Commands::Export { secrets } => run_export(&resolve_config(config_file, secrets)?).await,
        Commands::Import {
            secrets,
            input,
            output,
        } => run_import(&resolve_config(config_file, secrets)?, &input, output.as_deref()).await,
        Commands::Exec { secrets, command } => {
            run_exec(&resolve_config(config_file, secrets)?, &command).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
