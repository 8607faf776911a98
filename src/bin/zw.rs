//! CLI for ensemble operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use zooweeper::common::{timestamp_now_millis, SENDER_HEADER};
use zooweeper::ensemble::NodeStatus;
use zooweeper::MetadataRecord;

#[derive(Parser)]
#[command(name = "zw")]
#[command(about = "zooweeper ensemble CLI")]
#[command(version)]
struct Cli {
    /// Node URL (any ensemble member)
    #[arg(long, default_value = "http://localhost:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every record held by the node
    Get,

    /// Write the metadata of a sender
    Put {
        /// Sender address
        sender: String,

        /// Downstream clients (comma-separated)
        #[arg(long, value_delimiter = ',')]
        clients: Vec<String>,

        /// Ordering timestamp (defaults to now, in milliseconds)
        #[arg(long)]
        timestamp: Option<String>,

        /// JSON payload delivered to the clients on commit
        #[arg(long)]
        payload: Option<String>,
    },

    /// Delete a record through the leader
    Delete {
        /// Record id
        id: u64,
    },

    /// Show node role, leader and pipeline state
    Status,
}

fn print_record(record: &MetadataRecord) {
    println!(
        "  #{:<4} parent={:<3} v{:<3} sender={:<16} clients={:?}",
        record.id, record.parent_id, record.version, record.sender_address, record.clients
    );
}

async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let detail = body["error"].as_str().unwrap_or("no detail").to_string();
    anyhow::bail!("request failed ({}): {}", status, detail)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.node.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Get => {
            let response = client.get(format!("{}/metadata", base)).send().await?;
            let records: Vec<MetadataRecord> = check(response).await?.json().await?;
            println!("Records ({}):", records.len());
            for record in &records {
                if record.is_local() {
                    println!(
                        "  #1    node={} leader={} peers={:?}",
                        record.node_address, record.leader, record.peers
                    );
                } else {
                    print_record(record);
                }
            }
        }

        Commands::Put {
            sender,
            clients,
            timestamp,
            payload,
        } => {
            let payload: Value = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => Value::Null,
            };
            let timestamp = match timestamp {
                Some(ts) => json!(ts),
                None => json!(timestamp_now_millis()),
            };
            let body = json!({
                "timestamp": timestamp,
                "metadata": {
                    "senderAddress": sender,
                    "clients": clients,
                },
                "payload": payload,
            });
            let response = client
                .post(format!("{}/metadata", base))
                .header(SENDER_HEADER, sender.as_str())
                .json(&body)
                .send()
                .await?;
            let record: MetadataRecord = check(response).await?.json().await?;
            println!("Committed:");
            print_record(&record);
        }

        Commands::Delete { id } => {
            let response = client
                .delete(format!("{}/metadata/{}", base, id))
                .send()
                .await?;
            let record: MetadataRecord = check(response).await?.json().await?;
            println!("Deleted:");
            print_record(&record);
        }

        Commands::Status => {
            let response = client.get(format!("{}/health", base)).send().await?;
            let status: NodeStatus = check(response).await?.json().await?;
            println!("Node status:");
            println!("  Address: {}", status.address);
            println!("  Role: {}", status.role);
            println!("  Leader: {}", status.leader);
            println!("  Election: {}", status.election);
            println!("  Proposal: {} (round {})", status.proposal, status.round);
            println!("  Sync: {}", status.sync);
            println!("  Records: {}", status.records);
        }
    }

    Ok(())
}
