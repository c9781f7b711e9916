use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "botrelay")]
#[command(about = "Botrelay CLI: bridge gateway and bot instance management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: BOTRELAY_CONFIG_PATH or ~/.botrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (bridge WebSocket + provisioning API).
    Gateway {
        /// Config file path (default: BOTRELAY_CONFIG_PATH or ~/.botrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Manage dedicated bot instances through a running gateway.
    Instances {
        /// Config file path (default: BOTRELAY_CONFIG_PATH or ~/.botrelay/config.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        config: Option<std::path::PathBuf>,

        /// Organization slug (default organization when omitted)
        #[arg(long, short, global = true)]
        organization: Option<String>,

        #[command(subcommand)]
        action: InstanceAction,
    },

    /// Act as a bridge agent: type messages as an end user and print the bot's replies.
    Bridge {
        /// Config file path (default: BOTRELAY_CONFIG_PATH or ~/.botrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Bot-facing number this bridge serves
        #[arg(long, value_name = "NUMBER")]
        bot_number: String,

        /// End-user address the typed messages come from
        #[arg(long, value_name = "ADDRESS", default_value = "+10000000000@s.whatsapp.net")]
        phone: String,

        /// Session id (default: "default")
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        #[arg(long)]
        organization: Option<String>,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// List instances of the organization.
    List,

    /// Provision a new instance.
    Create {
        /// Instance name (container is named rasa_<name>)
        #[arg(long)]
        name: String,

        /// Number the instance serves
        #[arg(long, value_name = "NUMBER")]
        number: String,

        /// Base bot the instance is derived from
        #[arg(long, value_name = "ID")]
        based_on: Option<u64>,

        /// Host port (allocated when omitted)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop, remove and delete an instance.
    Delete {
        id: u64,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("botrelay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Instances {
            config,
            organization,
            action,
        }) => {
            if let Err(e) = run_instances(config, organization, action).await {
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Bridge {
            config,
            bot_number,
            phone,
            session,
            organization,
        }) => {
            if let Err(e) = run_bridge(config, bot_number, phone, session, organization).await {
                log::error!("bridge failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::config::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

/// Base HTTP URL of the configured gateway; wildcard binds are reached over loopback.
fn gateway_base(config: &lib::config::Config) -> String {
    let bind = match config.gateway.bind.trim() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    format!("http://{}:{}", bind, config.gateway.port)
}

async fn run_instances(
    config_path: Option<std::path::PathBuf>,
    organization: Option<String>,
    action: InstanceAction,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let base = gateway_base(&config);
    let client = reqwest::Client::new();
    let org_query: Vec<(&str, String)> = organization
        .into_iter()
        .map(|o| ("organization", o))
        .collect();

    let res = match action {
        InstanceAction::List => {
            client
                .get(format!("{}/api/v1/bot-instances", base))
                .query(&org_query)
                .send()
                .await?
        }
        InstanceAction::Create {
            name,
            number,
            based_on,
            port,
        } => {
            let body = serde_json::json!({
                "name": name,
                "whatsapp_number": number,
                "based_on_bot_id": based_on,
                "port": port,
            });
            client
                .post(format!("{}/api/v1/bot-instances", base))
                .query(&org_query)
                .json(&body)
                .send()
                .await?
        }
        InstanceAction::Delete { id } => {
            client
                .delete(format!("{}/api/v1/bot-instances/{}", base, id))
                .query(&org_query)
                .send()
                .await?
        }
    };

    let status = res.status();
    let body: serde_json::Value = res.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let msg = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        anyhow::bail!("{} ({})", msg, status);
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    bot_number: String,
    phone: String,
    session: Option<String>,
    organization: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let mut params = vec![("phone", bot_number.clone())];
    if let Some(s) = &session {
        params.push(("sessionId", s.clone()));
    }
    if let Some(o) = organization {
        params.push(("organization", o));
    }
    let mut url = reqwest::Url::parse_with_params(&format!("{}/ws", gateway_base(&config)), &params)?;
    url.set_scheme("ws")
        .map_err(|_| anyhow::anyhow!("cannot build websocket url from {}", url))?;

    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();
    println!("connected as {} (type /quit to exit)", bot_number);

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let Ok(Message::Text(text)) = msg else { continue };
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(frame) => println!(
                    "< {}",
                    frame.get("message").and_then(|v| v.as_str()).unwrap_or_default()
                ),
                Err(_) => println!("< {}", text),
            }
        }
        println!("connection closed by gateway");
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        let mut frame = serde_json::json!({
            "phone": phone,
            "message": input,
            "botNumber": bot_number,
        });
        if let Some(s) = &session {
            frame["sessionId"] = serde_json::Value::String(s.clone());
        }
        if let Some(audio) = input.strip_prefix("/audio") {
            frame["message"] = serde_json::Value::String(audio.trim().to_string());
            frame["messageType"] = serde_json::Value::String("audio".to_string());
        }
        sink.send(Message::Text(frame.to_string())).await?;
    }

    let _ = sink.close().await;
    reader.abort();
    Ok(())
}
