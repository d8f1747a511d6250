//! busctl: forward one operation to the broker and print the result as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use busd_client::{default_socket_path, BusClient, ClientError};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "busctl", version)]
#[command(about = "Talk to a running busd broker")]
struct Cli {
    /// Broker socket (default: BUSD_SOCKET or derived from the working directory)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a worker name
    Register { name: String },
    /// Long-poll for a task
    Poll {
        name: String,
        /// Poll timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Register, then keep polling until a task arrives
    Wait {
        name: String,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Acknowledge a delivered task
    Ack { name: String, task_id: String },
    /// Report a task as finished
    Done { task_id: String },
    /// Report a task as failed
    Failed { task_id: String, reason: String },
    /// Submit a tracker task for dispatch
    Submit { task_id: String },
    /// Show workers, queue and recent failures
    Status,
    /// Force a worker back to idle, requeueing its task
    Reset { name: String },
    /// Re-dispatch a task that failed
    Retry { task_id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(client: &BusClient, command: Command) -> Result<Value, ClientError> {
    let data = match command {
        Command::Register { name } => to_value(client.register(&name).await?),
        Command::Poll { name, timeout_ms } => {
            to_value(client.poll(&name, timeout_ms.map(Duration::from_millis)).await?)
        }
        Command::Wait { name, timeout_ms } => {
            client.register(&name).await?;
            to_value(
                client
                    .wait_for_task(&name, Duration::from_millis(timeout_ms))
                    .await?,
            )
        }
        Command::Ack { name, task_id } => to_value(client.ack(&name, &task_id).await?),
        Command::Done { task_id } => to_value(client.done(&task_id).await?),
        Command::Failed { task_id, reason } => to_value(client.failed(&task_id, &reason).await?),
        Command::Submit { task_id } => to_value(client.submit(&task_id).await?),
        Command::Status => client.status().await?,
        Command::Reset { name } => to_value(client.reset_worker(&name).await?),
        Command::Retry { task_id } => to_value(client.retry_task(&task_id).await?),
    };
    Ok(data)
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket = cli.socket.unwrap_or_else(default_socket_path);
    debug!("Using socket {}", socket.display());
    let client = BusClient::connect(&socket)
        .await
        .with_context(|| format!("is busd running? ({})", socket.display()))?;

    match execute(&client, cli.command).await {
        Ok(data) => {
            print_json(&data)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(ClientError::Remote { code, message }) => {
            print_json(&serde_json::json!({ "error_code": code, "message": message }))?;
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}
