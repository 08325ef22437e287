//! mcp-llm-client: line-oriented terminal front-end.
//!
//! Lines starting with `/` are commands; anything else is sent to the
//! conversation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use mcp_llm_client::agent_core::{ChatTurn, TurnRole};
use mcp_llm_client::inference::Provider;
use mcp_llm_client::{config, AppStatus, ChatApp};

#[derive(Parser)]
#[command(name = "mcp-llm-client")]
#[command(about = "Chat with LLM providers and agents backed by remote MCP tool servers")]
#[command(version)]
struct Cli {
    /// Path to config file (default: $MCP_LLM_CLIENT_CONFIG or <data-dir>/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the database and logs (default: platform data directory)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

const HELP: &str = "\
Commands:
  /servers                      list configured servers
  /add <name> <url> [token]     add a server
  /remove <id|name>             remove a server
  /connect <id|name>            connect (or reconnect) a server
  /keys <provider> <key>        set an API key (openai, claude, gemini); empty clears
  /provider <name>              select the active provider
  /status                       show provider, agent and server state
  /history                      show the conversation
  /quit                         exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base_dir = cli.data_dir.clone().unwrap_or_else(mcp_llm_client::data_dir);
    let app_config = config::load_or_default(cli.config.as_deref(), &base_dir)?;
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| app_config.data_dir.clone())
        .unwrap_or(base_dir);

    let log_path = mcp_llm_client::init_tracing(&data_dir)?;

    let app = ChatApp::open(&app_config, &data_dir)?;
    let _auto_connect = app.start().await;

    println!("MCP LLM Client v{}", env!("CARGO_PKG_VERSION"));
    println!("Data: {}", data_dir.display());
    println!("Log:  {}", log_path.display());
    println!("Type /help for commands.\n");
    print_turns(&app.history());

    let result = run_repl(&app).await;

    app.shutdown().await;
    result
}

async fn run_repl(app: &Arc<ChatApp>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seen = app.history().len();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('/') {
            match app.send(line).await {
                Ok(reply) => print_turn(&reply),
                Err(e) => println!("! {e}"),
            }
            seen = app.history().len();
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let args = &parts[1..];
        match parts[0] {
            "/quit" | "/exit" | "/q" => break,
            "/help" => println!("{HELP}"),
            "/servers" => print_servers(&app.status()),
            "/status" => print_status(&app.status()),
            "/history" => print_turns(&app.history()),
            "/add" => match args {
                [name, url] | [name, url, _] => {
                    match app.add_server(name, url, args.get(2).copied()) {
                        Ok(id) => println!("added {name} ({id})"),
                        Err(e) => println!("! {e}"),
                    }
                }
                _ => println!("Usage: /add <name> <url> [token]"),
            },
            "/remove" => match args {
                [id] => match app.remove_server(id).await {
                    Ok(()) => println!("removed {id}"),
                    Err(e) => println!("! {e}"),
                },
                _ => println!("Usage: /remove <id|name>"),
            },
            "/connect" => match args {
                [id] => match app.connect_server(id).await {
                    Ok(entry) => println!("{}: {}", entry.name, entry.status_detail),
                    Err(e) => println!("! {e}"),
                },
                _ => println!("Usage: /connect <id|name>"),
            },
            "/keys" => match args {
                [provider, rest @ ..] => match provider.parse::<Provider>() {
                    Ok(provider) => match app.set_key(provider, &rest.join(" ")) {
                        Ok(active) => println!("{provider} key saved; active provider: {active}"),
                        Err(e) => println!("! {e}"),
                    },
                    Err(e) => println!("! {e}"),
                },
                _ => println!("Usage: /keys <provider> <key>"),
            },
            "/provider" => match args {
                [name] => match name.parse::<Provider>() {
                    Ok(provider) => {
                        app.set_provider(provider);
                        println!("active provider: {provider}");
                    }
                    Err(e) => println!("! {e}"),
                },
                _ => println!("Usage: /provider <openai|claude|gemini>"),
            },
            other => println!("unknown command {other}; /help lists commands"),
        }

        // Announcements (target changes) that arrived in the background.
        let turns = app.history();
        if turns.len() < seen {
            seen = 0;
        }
        print_turns(&turns[seen..]);
        seen = turns.len();
    }
    Ok(())
}

fn print_turn(turn: &ChatTurn) {
    let label = match turn.role {
        TurnRole::User => "you",
        TurnRole::Assistant => "assistant",
        TurnRole::System => "system",
        TurnRole::Error => "error",
    };
    println!("[{label}] {}", turn.text);
}

fn print_turns(turns: &[ChatTurn]) {
    for turn in turns {
        print_turn(turn);
    }
}

fn print_servers(status: &AppStatus) {
    if status.servers.is_empty() {
        println!("no servers configured");
        return;
    }
    for entry in &status.servers {
        println!(
            "{}  {:<16} {:<10} {}  ({})",
            entry.id,
            entry.name,
            entry.state.as_str(),
            entry.endpoint,
            entry.status_detail
        );
    }
}

fn print_status(status: &AppStatus) {
    let available: Vec<&str> = status.available.iter().map(|p| p.as_str()).collect();
    println!("provider:  {}", status.provider);
    println!(
        "keys:      {}",
        if available.is_empty() { "none".to_string() } else { available.join(", ") }
    );
    println!("agent:     {}", status.phase.as_str());
    if !status.tools.is_empty() {
        println!("tools:     {}", status.tools.join(", "));
    }
    print_servers(status);
}
