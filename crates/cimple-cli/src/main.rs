//! Cimple CLI - run builds locally, or operate a build server and its agents.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod config;
mod handlers;

use client::ApiClient;
use commands::{BuildCommands, Commands, LogFormat, ServerArgs};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "cimple")]
#[command(author, version, about = "A simple distributed CI", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn api_client(args: &ServerArgs) -> anyhow::Result<ApiClient> {
    let config = CliConfig::load(args.cli_config.as_deref())?
        .with_overrides(args.server_addr.clone(), args.server_port);
    Ok(ApiClient::new(&config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            tasks,
            journal_driver,
            journal_format,
            run_context,
            secrets,
            configuration,
        } => {
            handlers::run(handlers::RunArgs {
                tasks,
                journal_driver,
                journal_format,
                run_context,
                secrets,
                configuration,
            })
            .await
        }
        Commands::Server { host, port, config } => {
            handlers::server(config.as_deref(), host, port).await
        }
        Commands::Agent {
            server_addr,
            server_port,
            no_tls,
            config,
        } => handlers::agent(config.as_deref(), server_addr, server_port, no_tls).await,
        Commands::Agents { server } => handlers::list_agents(&api_client(&server)?).await,
        Commands::Builds { server, command } => {
            let client = api_client(&server)?;
            match command.unwrap_or(BuildCommands::List) {
                BuildCommands::List => handlers::list_builds(&client).await,
                BuildCommands::Submit { url, commit } => {
                    handlers::submit_build(&client, &url, &commit).await
                }
            }
        }
        Commands::Config {
            configuration,
            format,
        } => handlers::show_config(&configuration, format),
    }
}
