use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;
use worker_publish::bundle::DeclaredFormat;
use worker_publish::cloudflare::CloudflareClient;
use worker_publish::config::{self, Config};
use worker_publish::esbuild::EsbuildBundler;
use worker_publish::sites::KvAssetSync;
use worker_publish::{logging, PublishError, PublishProps, PublishResult, Publisher};

#[derive(Parser)]
#[command(
    name = "worker-publish",
    version,
    about = "Build and publish a Cloudflare Worker"
)]
struct Cli {
    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample wrangler.toml into the current directory
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Build the worker and publish it
    Publish(PublishArgs),
}

#[derive(Args)]
struct PublishArgs {
    /// Entry script (default: build.upload.main from the config)
    script: Option<PathBuf>,

    /// Config file (default: nearest wrangler.toml/.json/.jsonc)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment to publish (`[env.<name>]`)
    #[arg(short, long)]
    env: Option<String>,

    /// Publish environments as separate `<name>-<env>` workers
    #[arg(long)]
    legacy_env: bool,

    /// Worker name (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// "modules" or "service-worker"
    #[arg(long)]
    format: Option<DeclaredFormat>,

    #[arg(long)]
    compatibility_date: Option<String>,

    #[arg(long, value_delimiter = ',')]
    compatibility_flags: Vec<String>,

    /// Static asset directory to serve alongside the worker
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Cron schedules (replaces config; pass with no values to clear)
    #[arg(long, num_args = 0.., value_name = "CRON")]
    triggers: Option<Vec<String>>,

    /// Route patterns (replaces config; pass with no values to clear)
    #[arg(long, num_args = 0.., value_name = "PATTERN")]
    routes: Option<Vec<String>>,

    /// Build and compose the upload without publishing
    #[arg(long)]
    dry_run: bool,

    /// esbuild binary
    #[arg(long, env = "ESBUILD_BINARY_PATH", default_value = "esbuild")]
    esbuild: PathBuf,

    #[arg(long, env = "CF_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    #[arg(long, env = "CF_ACCOUNT_ID")]
    account_id: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("Warning: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Init { force } => run_init(force),
            Commands::Publish(args) => run_publish(args).await,
        }
    });

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run_init(force: bool) -> PublishResult<()> {
    let path = std::env::current_dir()?.join(config::CONFIG_FILE_NAMES[0]);

    if path.exists() && !force {
        println!("Config file already exists at: {}", path.display());
        println!("\nUse --force to overwrite, or edit directly:");
        println!("  $EDITOR {}", path.display());
        return Ok(());
    }

    std::fs::write(&path, config::sample_config())?;

    println!("Created config file: {}", path.display());
    println!("\nSet name, account_id and build.upload.main, then run:");
    println!("  worker-publish publish");

    Ok(())
}

fn absolute(cwd: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

async fn run_publish(args: PublishArgs) -> PublishResult<()> {
    let cwd = std::env::current_dir()?;

    let config_path = match args.config {
        Some(path) => Some(absolute(&cwd, path)),
        None => Config::discover(&cwd),
    };
    let (config, config_dir) = match config_path {
        Some(path) => {
            debug!("Using config {}", path.display());
            let config = Config::load(&path)?;
            let dir = path.parent().map(Path::to_path_buf).unwrap_or(cwd.clone());
            (config, dir)
        }
        None => (Config::default(), cwd.clone()),
    };
    let environment = config.environment(args.env.as_deref())?;

    let api_token = match args.api_token {
        Some(token) => token,
        None if args.dry_run => String::new(),
        None => {
            return Err(PublishError::Configuration(
                "An API token is required. Pass --api-token or set CF_API_TOKEN".to_string(),
            ))
        }
    };

    let props = PublishProps {
        config: environment,
        config_dir,
        env: args.env,
        legacy_env: args.legacy_env,
        script: args.script.map(|script| absolute(&cwd, script)),
        name: args.name,
        account_id: args.account_id,
        format: args.format,
        compatibility_date: args.compatibility_date,
        compatibility_flags: args.compatibility_flags,
        assets: args.assets.map(|assets| absolute(&cwd, assets)),
        triggers: args.triggers,
        routes: args.routes,
        dry_run: args.dry_run,
    };

    let client = CloudflareClient::new(api_token);
    let publisher = Publisher::new(
        client.clone(),
        EsbuildBundler::new(args.esbuild),
        KvAssetSync::new(client),
    );

    let report = publisher.publish(&props).await?;
    if props.dry_run {
        println!("Dry run complete for {}; nothing was uploaded.", report.worker_label);
    } else {
        println!("{}", report);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_args_parse() {
        let cli = Cli::try_parse_from([
            "worker-publish",
            "publish",
            "src/index.js",
            "--env",
            "staging",
            "--format",
            "modules",
            "--compatibility-flags",
            "nodejs_compat,streams_enable_constructors",
            "--routes",
            "a.com/*",
            "b.com/*",
            "--triggers",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.script, Some(PathBuf::from("src/index.js")));
        assert_eq!(args.env.as_deref(), Some("staging"));
        assert_eq!(args.format, Some(DeclaredFormat::Modules));
        assert_eq!(args.compatibility_flags.len(), 2);
        assert_eq!(
            args.routes,
            Some(vec!["a.com/*".to_string(), "b.com/*".to_string()])
        );
        assert_eq!(args.triggers, Some(Vec::new()));
        assert!(args.dry_run);
    }

    #[test]
    fn test_invalid_format_is_rejected() {
        assert!(Cli::try_parse_from(["worker-publish", "publish", "--format", "iife"]).is_err());
    }
}
