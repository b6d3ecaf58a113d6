use anyhow::Result;
use clap::Parser;
use rls_balancer::config::RlsConfig;
use rls_balancer::keys::KeyBuilderMap;
use tracing::info;

#[derive(Parser)]
#[command(name = "rls-balancer")]
#[command(about = "Validate a route lookup balancer configuration")]
struct Args {
    #[arg(short, long, default_value = "config/rls.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match RlsConfig::from_file_with_env(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured by the file, fall back to defaults
            rls_balancer::config::LoggingConfig::default().init_tracing(args.verbose);
            tracing::error!("Invalid configuration {}: {:#}", args.config, e);
            return Err(e);
        }
    };
    config.logging.init_tracing(args.verbose);
    info!("Loaded configuration from {}", args.config);

    let route_lookup = config.route_lookup.normalized();
    let key_builders = KeyBuilderMap::new(&route_lookup.key_builders)?;

    info!(
        lookup_service = %route_lookup.lookup_service,
        timeout = ?route_lookup.lookup_timeout(),
        max_age = ?route_lookup.max_age(),
        stale_age = ?route_lookup.stale_age(),
        cache_size = route_lookup.cache_size(),
        default_target = ?route_lookup.default_target(),
        child_policy = %route_lookup.child_policy.name,
        key_builders = key_builders.len(),
        "Configuration is valid"
    );

    println!("{}", serde_json::to_string_pretty(&route_lookup)?);
    Ok(())
}
