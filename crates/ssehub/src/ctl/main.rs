//! ssehubctl - Control CLI for the ssehub broker
//!
//! Listens on a stream with the reconnecting consumer, pushes events through
//! the push intake and reads broker statistics.

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use ssehub::{Consumer, ConsumerConfig, ConsumerState, Event};

const DEFAULT_SERVER_URL: &str = "http://localhost:8686";

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let client = HubClient::new(&cli.server);

    match cli.command {
        Command::Status => handle_status(&client, cli.json).await,
        Command::Listen {
            uid,
            events,
            last_event_id,
            max_retries,
            initial_backoff_ms,
        } => {
            let mut url = reqwest::Url::parse(&client.url("/events")).context("invalid server URL")?;
            url.query_pairs_mut().append_pair("uid", &uid);
            let config = ConsumerConfig::new(url.as_str())
                .max_retries(max_retries)
                .initial_backoff(Duration::from_millis(initial_backoff_ms));
            let config = match last_event_id {
                Some(id) => config.last_event_id(id),
                None => config,
            };
            handle_listen(config, &events, cli.json).await
        }
        Command::Push { uids, event, data } => {
            handle_push(&client, uids, &event, &data, cli.json).await
        }
        Command::Stats => handle_stats(&client, cli.json).await,
        Command::Heartbeat { uid } => handle_heartbeat(&client, &uid).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ssehubctl",
    author,
    version,
    about = "Control CLI for the ssehub broker - listen, push and inspect."
)]
struct Cli {
    /// Broker URL
    #[arg(long, short = 's', default_value = DEFAULT_SERVER_URL, env = "SSEHUB_SERVER_URL")]
    server: String,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the broker is up
    Status,

    /// Open a stream and print events as they arrive
    Listen {
        /// Client identifier to connect as
        uid: String,
        /// Event types to print (repeatable)
        #[arg(long = "event", short = 'e', default_value = "message")]
        events: Vec<String>,
        /// Resume after this event id
        #[arg(long)]
        last_event_id: Option<String>,
        /// Consecutive failed connections before giving up
        #[arg(long, default_value = "5")]
        max_retries: u32,
        /// First reconnect delay in milliseconds
        #[arg(long, default_value = "1000")]
        initial_backoff_ms: u64,
    },

    /// Push one event
    Push {
        /// Target identifier (repeatable); broadcast when omitted
        #[arg(long = "uid", short = 'u')]
        uids: Vec<String>,
        /// Event type
        #[arg(long, short = 'e', default_value = "message")]
        event: String,
        /// Payload; parsed as JSON, sent as a string otherwise
        data: String,
    },

    /// Show push statistics
    Stats,

    /// Send a heartbeat to one client
    Heartbeat {
        /// Client identifier
        uid: String,
    },
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ssehub={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

struct HubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HubClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.client
            .get(self.url(path))
            .send()
            .await
            .context("sending request to server")
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("sending request to server")
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

async fn handle_status(client: &HubClient, json: bool) -> Result<()> {
    let response = client.get("/health").await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else if status.is_success() {
        println!(
            "Broker is running at {} ({} clients online)",
            client.base_url,
            body["online_clients"].as_u64().unwrap_or(0)
        );
    } else {
        println!("Broker returned {}", status);
    }
    Ok(())
}

async fn handle_listen(config: ConsumerConfig, events: &[String], json: bool) -> Result<()> {
    let consumer = Consumer::new(config).context("creating consumer")?;

    for event_type in events {
        consumer.on(event_type.clone(), move |event: Event| print_event(&event, json));
    }
    consumer.connect()?;

    tokio::select! {
        _ = consumer.wait() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl+C")?;
            consumer.disconnect();
            consumer.wait().await;
        }
    }

    if let Some(id) = consumer.last_event_id().await {
        eprintln!("Last event id: {id}");
    }
    if consumer.state() == ConsumerState::Terminated && consumer.attempts() > 0 {
        eprintln!("Stream ended after {} connection attempts", consumer.attempts());
    }
    Ok(())
}

fn print_event(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("Failed to encode event {}: {}", event.id, err),
        }
    } else {
        println!("[{}] {} {}", event.event_type, event.id, event.data);
    }
    let _ = io::stdout().flush();
}

async fn handle_push(
    client: &HubClient,
    uids: Vec<String>,
    event: &str,
    data: &str,
    json: bool,
) -> Result<()> {
    let data = serde_json::from_str::<Value>(data).unwrap_or_else(|_| Value::String(data.to_string()));
    let body = serde_json::json!({
        "uids": uids,
        "events": [Event::new(event, data)],
    });

    let response = client.post_json("/push", &body).await?;
    if !response.status().is_success() {
        bail!("push rejected: {}", error_message(response).await);
    }

    let result: Value = response.json().await.context("parsing push response")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if uids.is_empty() {
        println!("Broadcast 1 '{}' event", event);
    } else {
        println!("Pushed 1 '{}' event to {}", event, uids.join(", "));
    }
    Ok(())
}

async fn handle_stats(client: &HubClient, json: bool) -> Result<()> {
    let response = client.get("/stats").await?;
    if !response.status().is_success() {
        bail!("stats unavailable: {}", error_message(response).await);
    }

    let stats: Value = response.json().await.context("parsing stats")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    for key in ["online_clients", "total", "success", "failed", "timeout"] {
        println!("{:<15} {}", key, stats[key].as_u64().unwrap_or(0));
    }
    Ok(())
}

async fn handle_heartbeat(client: &HubClient, uid: &str) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/heartbeat/{uid}")))
        .send()
        .await
        .context("sending request to server")?;
    if !response.status().is_success() {
        bail!("heartbeat failed: {}", error_message(response).await);
    }
    println!("Heartbeat queued for {uid}");
    Ok(())
}
