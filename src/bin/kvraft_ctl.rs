//! CLI entry point for kvraft-ctl: inspect and drive a kvraft cluster.

use std::time::Duration;

use clap::{Parser, Subcommand};
use kvraft::cluster::message::{Entry, EntryBatch};
use kvraft::cluster::messenger::{RegisterBody, INTERNAL_TOKEN_HEADER};
use kvraft::errors::ErrorBody;

#[derive(Parser)]
#[command(name = "kvraft-ctl", about = "kvraft cluster administration tool")]
struct Cli {
    /// Node to talk to (`host:port` or a full URL).
    #[arg(long, default_value = "127.0.0.1:8888")]
    node: String,
    /// Internal token for the cluster routes.
    #[arg(long, env = "KVRAFT_INTERNAL_TOKEN", default_value = "")]
    token: String,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the nodes the target has registered
    Nodes,
    /// Show the leader the target knows of
    Leader,
    /// Show role, term and indices of the target
    Status,
    /// Bring a new node into the cluster, with the target as entry point
    Register { address: String },
    /// Make the target forget a peer
    Remove { address: String },
    /// Start the target and every peer it knows
    Start,
    /// Write a value through the target
    Set { key: String, value: String },
    /// Read a value from the target's local store
    Get { key: String },
}

struct Client {
    http: reqwest::blocking::Client,
    base: String,
    token: String,
}

impl Client {
    fn new(node: &str, token: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let base = if node.starts_with("http://") || node.starts_with("https://") {
            node.trim_end_matches('/').to_string()
        } else {
            format!("http://{node}")
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base, token })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        if self.token.is_empty() {
            builder
        } else {
            builder.header(INTERNAL_TOKEN_HEADER, &self.token)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let client = match Client::new(&cli.node, cli.token, Duration::from_secs(cli.timeout)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let rc = match run(&client, cli.command) {
        Ok(body) => {
            if !body.is_empty() {
                println!("{}", body);
            }
            0
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            1
        }
    };
    std::process::exit(rc);
}

fn run(client: &Client, command: Commands) -> Result<String, String> {
    use reqwest::Method;

    let builder = match command {
        Commands::Nodes => client.request(Method::GET, "/api/v1/cluster"),
        Commands::Leader => client.request(Method::GET, "/api/v1/cluster/leader"),
        Commands::Status => client.request(Method::GET, "/api/v1/cluster/status"),
        Commands::Register { address } => client
            .request(Method::POST, "/api/v1/cluster")
            .query(&[("handshake", "false"), ("startPoint", "true")])
            .json(&RegisterBody { address }),
        Commands::Remove { address } => client
            .request(Method::DELETE, "/api/v1/cluster")
            .query(&[("address", address)]),
        Commands::Start => client
            .request(Method::PUT, "/api/v1/cluster")
            .query(&[("startPoint", "true")]),
        Commands::Set { key, value } => client
            .request(Method::POST, "/api/v1/data")
            .json(&EntryBatch::single(Entry::new(key, value))),
        Commands::Get { key } => client.request(Method::GET, &format!("/api/v1/data/{key}")),
    };

    let response = builder.send().map_err(|e| e.to_string())?;
    let status = response.status();
    let text = response.text().map_err(|e| e.to_string())?;
    if status.is_success() {
        return Ok(pretty(&text));
    }
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(format!("{} ({}): {}", body.code, status.as_u16(), body.message)),
        Err(_) => Err(format!("HTTP {}: {}", status.as_u16(), text)),
    }
}

/// Re-indent JSON bodies; leave anything else as is.
fn pretty(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| text.to_string())
}
