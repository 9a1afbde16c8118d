use clap::Parser;
use mfa_gateway::{load_codec, Collaborators, Config, RadiusGateway};
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RADIUS gateway adding a cloud second factor to AD/LDAP/RADIUS authentication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "mfa-radius-gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start the gateway)
    #[arg(short, long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed: {}", e);
                process::exit(1);
            }

            if std::path::Path::new(&cli.config_path).exists() {
                error!("Could not load config file {}: {}", cli.config_path, e);
                process::exit(1);
            }

            warn!("Config file not found: {}", cli.config_path);
            info!("Creating example configuration at: {}", cli.config_path);
            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }
            info!("Please edit {} and restart the gateway", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        println!("Configuration validated successfully");
        println!("  Listen: {}:{}", config.listen_address, config.listen_port);
        println!("  MFA API: {}", config.api_url);
        println!("  Clients: {}", config.clients.len());
        for client in &config.clients {
            println!(
                "    {} ({}) first factor: {:?}",
                client.name,
                client
                    .nas_identifier
                    .as_deref()
                    .or(client.address.as_deref())
                    .unwrap_or("-"),
                client.first_factor_source
            );
        }
        process::exit(0);
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("MFA RADIUS gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);
    if config.clients.is_empty() {
        warn!("No clients configured, every request will be dropped");
    }

    let codec = match load_codec(&config) {
        Ok(codec) => codec,
        Err(e) => {
            error!("Failed to load attribute dictionary: {}", e);
            process::exit(1);
        }
    };

    let collaborators = match Collaborators::production(&config, codec.clone()) {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!("Failed to initialise collaborators: {}", e);
            process::exit(1);
        }
    };

    let gateway = match RadiusGateway::new(config, codec, collaborators).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {}", e);
        process::exit(1);
    }
}
