mod token_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    switchboard_config::SwitchboardConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: multi-tenant messaging gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of discovering one.
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to search for `switchboard.{toml,yaml,yml,json}` instead of
    /// the default locations.
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Instance token management (token auth mode).
    Token {
        #[command(subcommand)]
        action: token_commands::TokenAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved config with secrets redacted.
    Show,
    /// Check that the config is usable for `gateway`.
    Check,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SwitchboardConfig> {
    if let Some(dir) = &cli.config_dir {
        switchboard_config::set_config_dir(dir.clone());
    }
    match &cli.config {
        Some(path) => switchboard_config::load_config(path),
        None => switchboard_config::discover_and_load(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            switchboard_gateway::server::start_gateway(config).await
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            },
            ConfigAction::Check => {
                config.auth.validate()?;
                println!("config ok (auth mode: {})", config.auth.mode.as_str());
                Ok(())
            },
        },
        Commands::Token { action } => token_commands::handle_token(action, &config),
    }
}
