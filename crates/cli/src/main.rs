use std::{
    io::Write,
    path::{Path, PathBuf},
};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    futures::StreamExt,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    tether_client::{ChatEvent, ClientOptions, GatewayClient},
    tether_config::TetherConfig,
    tether_protocol::{AgentOptions, ChatSendParams},
};

#[derive(Parser)]
#[command(name = "tether", about = "Tether: real-time chat and agent gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the default locations.
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Round-trip a ping through a running gateway.
    Ping {
        #[arg(long)]
        url: Option<String>,
    },
    /// Stream one chat reply from a running gateway. Ctrl-C cancels the run.
    Chat {
        #[arg(short, long)]
        message: String,
        /// Run in agent mode with tools enabled.
        #[arg(long, default_value_t = false)]
        agent: bool,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
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
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TetherConfig> {
    match path {
        Some(path) => tether_config::load_config(path),
        None => Ok(tether_config::discover_and_load()),
    }
}

async fn connect(config: &TetherConfig, url: Option<String>) -> anyhow::Result<GatewayClient> {
    let url = url.unwrap_or_else(|| config.client_url());
    let options = ClientOptions::from_config(&config.client);
    GatewayClient::connect(&url, options)
        .await
        .with_context(|| format!("connecting to {url}"))
}

async fn run_chat(client: &GatewayClient, params: ChatSendParams) -> anyhow::Result<()> {
    let mut stream = client.chat_stream(params).await?;
    let mut interrupted = false;
    let mut stdout = std::io::stdout();

    loop {
        let next = tokio::select! {
            item = stream.next() => Some(item),
            _ = tokio::signal::ctrl_c(), if !interrupted => None,
        };
        let Some(item) = next else {
            interrupted = true;
            if let Err(e) = stream.cancel("interrupted").await {
                warn!(error = %e, "cancel failed");
            }
            continue;
        };
        let Some(item) = item else { break };
        match item? {
            ChatEvent::Chunk(text) => {
                print!("{text}");
                stdout.flush()?;
            },
            ChatEvent::ToolStart { tool, input, .. } => {
                eprintln!("\n[tool] {tool} {input}");
            },
            ChatEvent::ToolResult {
                tool,
                result,
                is_error,
                ..
            } => {
                let label = if is_error { "error" } else { "result" };
                eprintln!("[{label}] {tool} {result}");
            },
            ChatEvent::TurnComplete { turn_number } => {
                info!(turn = turn_number, "turn complete");
            },
            ChatEvent::Done { turns, .. } => {
                println!();
                info!(turns, "done");
            },
            ChatEvent::Cancelled { reason } => {
                println!();
                eprintln!("cancelled: {reason}");
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            info!(version = env!("CARGO_PKG_VERSION"), "tether starting");
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tether_gateway::server::start_gateway(config).await
        },
        Commands::Ping { url } => {
            let client = connect(&config, url).await?;
            let ts = client.ping().await?;
            let server = client.hello().map(|h| h.server.version).unwrap_or_default();
            println!("pong {ts} (server v{server})");
            client.close().await;
            Ok(())
        },
        Commands::Chat {
            message,
            agent,
            max_turns,
            model,
            url,
        } => {
            let client = connect(&config, url).await?;
            let params = ChatSendParams {
                message,
                history: Vec::new(),
                images: Vec::new(),
                agent_mode: agent,
                agent_options: max_turns.map(|max_turns| AgentOptions {
                    max_turns: Some(max_turns),
                    ..AgentOptions::default()
                }),
                model,
            };
            let result = run_chat(&client, params).await;
            client.close().await;
            result
        },
    }
}
