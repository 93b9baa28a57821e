//! Command handlers.

use crate::client::ApiClient;
use crate::commands::ConfigFormat;
use anyhow::{Context, bail};
use cimple_agent::{AgentConfig, BuildAgent};
use cimple_api::{Server, ServerConfig};
use cimple_core::project::Project;
use cimple_core::secrets::StaticSecretStore;
use cimple_runner::{BuildGraph, JournalDriver, JournalFormat, LocalRunOptions, run_local};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct RunArgs {
    pub tasks: Vec<String>,
    pub journal_driver: JournalDriver,
    pub journal_format: JournalFormat,
    pub run_context: String,
    pub secrets: Vec<String>,
    pub configuration: PathBuf,
}

/// Run the build of the project in the current directory.
pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let working_dir = std::env::current_dir()?;
    let secrets = StaticSecretStore::parse_all(&args.secrets).context("Invalid --secret")?;

    let mut options = LocalRunOptions::new(working_dir);
    options.project_file = args.configuration;
    options.explicit_tasks = args.tasks;
    options.journal_driver = args.journal_driver;
    options.journal_format = args.journal_format;
    options.run_context = args.run_context;
    options.secrets = Arc::new(secrets);
    options.host_env = std::env::vars().collect();

    let summary = run_local(options).await?;

    println!("  Output:  {}", summary.paths.output.display());
    println!("  Journal: {}", summary.paths.journal.display());

    match summary.error {
        None => {
            println!("{} Build {} succeeded", style("✓").green(), style(&summary.run_id).bold());
            Ok(())
        }
        Some(error) => bail!("Build {} failed: {}", summary.run_id, error),
    }
}

/// Start the server and run until interrupted.
pub async fn server(
    config_file: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = match config_file {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    println!(
        "{} Starting server on {}",
        style("▶").cyan(),
        style(config.socket_addr()).bold()
    );

    Server::new(config).serve(shutdown_signal()).await?;
    Ok(())
}

/// Start an agent and run until interrupted.
pub async fn agent(
    config_file: Option<&Path>,
    server_addr: Option<String>,
    server_port: Option<u16>,
    no_tls: bool,
) -> anyhow::Result<()> {
    let mut config = match config_file {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(addr) = server_addr {
        config.server_addr = addr;
    }
    if let Some(port) = server_port {
        config.server_port = port;
    }
    if no_tls {
        config.tls = false;
    }

    let agent = Arc::new(BuildAgent::new(config));
    println!("{} Agent {} starting", style("▶").cyan(), style(agent.id()).bold());

    let stopper = Arc::clone(&agent);
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.shutdown();
    });

    agent.run().await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received interrupt");
    }
}

/// List agents connected to the server.
pub async fn list_agents(client: &ApiClient) -> anyhow::Result<()> {
    let agents = client.list_agents().await?;

    if agents.is_empty() {
        println!("{} No agents connected", style("i").blue());
        return Ok(());
    }

    println!("{:<38} {:<20} {:<27} {}", "ID", "HOSTNAME", "CONNECTED", "STATUS");
    for agent in agents {
        let status = if agent.busy {
            style("busy").yellow()
        } else {
            style("idle").green()
        };
        println!(
            "{:<38} {:<20} {:<27} {}",
            agent.id,
            agent.hostname.as_deref().unwrap_or("-"),
            agent.connected_date,
            status
        );
    }
    Ok(())
}

/// List builds waiting for an agent.
pub async fn list_builds(client: &ApiClient) -> anyhow::Result<()> {
    let builds = client.list_builds().await?;

    if builds.is_empty() {
        println!("{} No builds queued", style("i").blue());
        return Ok(());
    }

    for build in builds {
        println!(
            "{} {} {}",
            style(&build.id).bold(),
            style(&build.submission_date).dim(),
            build.build_url
        );
    }
    Ok(())
}

pub async fn submit_build(client: &ApiClient, url: &str, commit: &str) -> anyhow::Result<()> {
    client.submit_build(url, commit).await?;
    println!("{} Build of {}#{} queued", style("✓").green(), url, commit);
    Ok(())
}

/// Validate a project file and print its build graph.
pub fn show_config(path: &Path, format: ConfigFormat) -> anyhow::Result<()> {
    print!("{}", render_config(path, format)?);
    Ok(())
}

fn render_config(path: &Path, format: ConfigFormat) -> anyhow::Result<String> {
    let project =
        Project::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let graph = BuildGraph::populate(&project.tasks)?;

    if format == ConfigFormat::Graphviz {
        return Ok(graph.to_graphviz());
    }

    let mut out = format!("{} {} ({})\n", style("✓").green(), project.name, project.version);
    for name in graph.execution_order() {
        let Some(task) = project.task(&name) else {
            continue;
        };
        let mut line = format!("  - {} ({} steps)", task.name, task.steps.len());
        if !task.depends.is_empty() {
            line.push_str(&format!(" after {}", task.depends.join(", ")));
        }
        if let Some(context) = &task.limit_to {
            line.push_str(&format!(" [{} only]", context));
        }
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
