use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gbcms_client::{ConnectionState, Session, WriteOutcome};
use gbcms_core::{
    ClientConfig, Project, ProjectArchive, ResourceState, ResourceStatus, SettingsUpdate, Theme,
};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "gbcms")]
#[command(about = "GBCMS dashboard client", long_about = None)]
struct Cli {
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, env = "GBCMS_API_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Print resource snapshots as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects
    Projects {
        #[command(subcommand)]
        action: ProjectCommands,
    },
    /// Show the activity log
    Logs,
    /// Show or change user settings
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Print the code graph
    Graph,
    /// Chat with the agent; `/quit` leaves
    Chat,
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    List,
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Import {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    Show,
    Update {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        theme: Option<Theme>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let host = config.api_url.host_str().unwrap_or("local").to_string();
    logging::LogSettings::resolve(&cli.log_dir).install(&host);

    let session = Session::start(config, resolve_token(&cli.token))?;
    let outcome = run(&cli, &session).await;
    session.logout();
    outcome
}

async fn run(cli: &Cli, session: &Session) -> Result<()> {
    let coordinator = session.coordinator();
    match &cli.command {
        Commands::Projects { action } => match action {
            ProjectCommands::List => {
                let state = coordinator.fetch_projects().await;
                render(cli.json, &state, |projects| {
                    if projects.is_empty() {
                        println!("No projects yet.");
                    }
                    for project in projects {
                        println!("- [{}] {} - {}", project.id, project.name, project.description);
                    }
                })
            }
            ProjectCommands::Create { name, description } => {
                let outcome = coordinator.create_project(name, description).await?;
                render_written(cli.json, &outcome, "Created")
            }
            ProjectCommands::Import { path } => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                let outcome = coordinator
                    .import_project(ProjectArchive::new(file_name, bytes))
                    .await?;
                render_written(cli.json, &outcome, "Imported")
            }
        },
        Commands::Logs => {
            let state = coordinator.fetch_logs().await;
            render(cli.json, &state, |entries| {
                if entries.is_empty() {
                    println!("No log entries.");
                }
                for entry in entries {
                    println!("{}  {:<12} {}", entry.timestamp, entry.user_id, entry.action);
                }
            })
        }
        Commands::User { action } => {
            let state = match action {
                UserCommands::Show => coordinator.fetch_user().await,
                UserCommands::Update {
                    username,
                    email,
                    theme,
                } => {
                    coordinator
                        .update_user_settings(SettingsUpdate {
                            username: username.clone(),
                            email: email.clone(),
                            theme: *theme,
                        })
                        .await?
                }
            };
            render(cli.json, &state, |user| {
                println!("{} <{}>", user.username, user.email);
                println!("role:  {}", user.role);
                println!("theme: {}", user.theme);
            })
        }
        Commands::Graph => {
            let state = coordinator.fetch_graph().await;
            render(cli.json, &state, |graph| {
                println!("{} nodes, {} edges", graph.nodes().count(), graph.edges().count());
                for edge in graph.edges() {
                    println!("  {} -> {}", edge.source, edge.target);
                }
            })
        }
        Commands::Chat => chat(session).await,
    }
}

async fn chat(session: &Session) -> Result<()> {
    let connection = session.connection();
    connection.on_inbound_message(|message| {
        println!("[{}] {}", message.sender, message.content);
    });
    let mut states = connection.watch_state();
    connection.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("-- {state}");
                if state == ConnectionState::Disconnected {
                    if let Some(err) = connection.last_error() {
                        bail!("connection lost: {err}");
                    }
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let text = line.trim();
                if text == "/quit" {
                    break;
                }
                if text.is_empty() {
                    continue;
                }
                if let Err(err) = connection.send_chat(text).await {
                    println!("!! {err}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("chat_interrupted");
                break;
            }
        }
    }
    Ok(())
}

/// Prints a settled snapshot. Failures print the error (and any stale data)
/// and turn into a non-zero exit.
fn render<T: Serialize>(json: bool, state: &ResourceState<T>, show: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
    } else {
        match (&state.status, &state.data) {
            (ResourceStatus::Loading, _) => println!("Loading..."),
            (_, Some(data)) => show(data),
            (_, None) if state.status != ResourceStatus::Failed => println!("Nothing to show."),
            _ => {}
        }
    }
    if state.status == ResourceStatus::Failed {
        let message = state.error_message().unwrap_or("unknown error").to_string();
        warn!("resource_failed: {message}");
        bail!("{message}");
    }
    Ok(())
}

fn render_written(json: bool, outcome: &WriteOutcome<Vec<Project>, Project>, verb: &str) -> Result<()> {
    render(json, &outcome.state, |_| {
        if let Some(project) = &outcome.record {
            println!("{verb} [{}] {}", project.id, project.name);
        }
    })
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let overrides = [
        ("GBCMS_API_URL", cli.api_url.trim()),
        ("GBCMS_WS_URL", cli.ws_url.trim()),
    ];
    let config = ClientConfig::from_lookup(|key| {
        overrides
            .iter()
            .find(|(name, value)| *name == key && !value.is_empty())
            .map(|(_, value)| value.to_string())
            .or_else(|| env::var(key).ok())
    })?;
    if config.request_timeout < Duration::from_secs(1) {
        bail!("GBCMS_REQUEST_TIMEOUT_SECS must be at least 1");
    }
    Ok(config)
}

fn resolve_token(flag: &str) -> Option<String> {
    let token = flag.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_update_with_theme() {
        let cli = Cli::try_parse_from([
            "gbcms",
            "--api-url",
            "http://localhost:8000",
            "user",
            "update",
            "--theme",
            "vs-dark",
        ])
        .expect("parse");
        match cli.command {
            Commands::User {
                action: UserCommands::Update { theme, username, .. },
            } => {
                assert_eq!(theme, Some(Theme::VsDark));
                assert!(username.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn flags_override_environment_urls() {
        let cli = Cli::try_parse_from([
            "gbcms",
            "--api-url",
            "http://flag.example:9000",
            "--ws-url",
            "ws://flag.example:9000/ws",
            "logs",
        ])
        .expect("parse");
        let config = load_config(&cli).expect("config");
        assert_eq!(config.api_url.host_str(), Some("flag.example"));
        assert_eq!(config.ws_url.as_str(), "ws://flag.example:9000/ws");
    }

    #[test]
    fn blank_token_is_ignored() {
        assert_eq!(resolve_token("  "), None);
        assert_eq!(resolve_token(" abc "), Some("abc".to_string()));
    }
}
