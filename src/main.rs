use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use serde_json::{Map, Value};
use toyz_dispatch::{
    AppResult,
    cli::{Cli, Commands},
    config::Config,
    init_logging,
    protocol::{Response, TaskRequest},
    session::{ChannelHandlers, SendOutcome},
    transport::{JobSocket, TaskClient},
};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();

    if let Commands::Config { action } = cli.command() {
        Config::handle_command(&action, &cli.config_file)?;
        return Ok(());
    }

    // Load configuration before logging so the file settings apply
    let config = Config::load_or_default(&cli.config_file);
    let log_file = config.log.file_path.as_deref().map(Path::new);
    let _log_guard = init_logging(&cli.effective_log_level(&config.log_level), log_file)?;

    tracing::info!("toyz-dispatch starting, server {}", config.server.job_url());
    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command() {
        Commands::Send {
            module,
            task,
            params,
            detach,
        } => run_send(&config, module, task, &params, detach).await?,
        Commands::Listen { seconds } => run_listen(&config, seconds).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn console_handlers() -> ChannelHandlers {
    ChannelHandlers::default()
        .with_error_handler(|response: &Response| {
            eprintln!(
                "{} {}",
                "ERROR".red().bold(),
                response.message().unwrap_or("server reported an error")
            );
            if let Some(traceback) = response.get("traceback").and_then(Value::as_str) {
                eprintln!("{}", traceback.dimmed());
            }
            ControlFlow::Break(())
        })
        .with_warning_handler(|response: &Response| {
            eprintln!(
                "{} {}",
                "warning".yellow().bold(),
                response.message().unwrap_or("")
            );
            ControlFlow::Break(())
        })
        .with_close_warning(|message: &str| {
            eprintln!("{} {}", "disconnected".yellow().bold(), message);
        })
}

fn parse_params(params: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(params)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--params must be a JSON object, got {}", other),
    }
}

fn print_frame(response: &Response) {
    let label = if response.is_progress_update() {
        "progress".cyan()
    } else {
        "response".green()
    };
    println!("{} {}", label.bold(), response.to_value());
}

async fn run_send(
    config: &Config,
    module: String,
    task: String,
    params: &str,
    detach: bool,
) -> anyhow::Result<()> {
    let request = TaskRequest::new(module, task).with_parameters(parse_params(params)?);
    let (client, handle) = JobSocket::from_config(config, console_handlers());

    if detach {
        let outcome = client.send_detached(request).await?;
        // Queued tasks leave on initialize; shutdown flushes written frames
        client.wait_ready().await?;
        report_outcome(outcome);
        client.shutdown();
        finish(client, handle).await;
        return Ok(());
    }

    let mut responses = client.send_task(request).await?;
    report_outcome(responses.outcome());
    while let Some(frame) = responses.next().await {
        match frame {
            Ok(response) => print_frame(&response),
            Err(e) => {
                eprintln!("{} {}", "ERROR".red().bold(), e);
                break;
            }
        }
    }

    client.shutdown();
    finish(client, handle).await;
    Ok(())
}

async fn run_listen(config: &Config, seconds: Option<u64>) -> anyhow::Result<()> {
    let handlers = console_handlers()
        .with_receive_handler(|response: &Response| print_frame(response))
        .with_notification_handler(|response: &Response| {
            println!(
                "{} {}",
                "notification".blue().bold(),
                response.message().unwrap_or("")
            );
            ControlFlow::Break(())
        });
    let (client, handle) = JobSocket::from_config(config, handlers);
    client.wait_ready().await?;
    println!("{}", "Session ready, listening for server frames".green());

    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    client.shutdown();
    finish(client, handle).await;
    Ok(())
}

fn report_outcome(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Sent(request_id) => {
            tracing::info!("Task sent with request id {}", request_id)
        }
        SendOutcome::Queued(position) => {
            tracing::info!("Task queued at position {} until the session is ready", position)
        }
    }
}

async fn finish(client: TaskClient, handle: tokio::task::JoinHandle<()>) {
    if let Some(stats) = client.stats().await {
        tracing::debug!("Channel stats: {:?}", stats);
    }
    drop(client);
    if let Err(e) = handle.await {
        tracing::warn!("Job socket task failed: {}", e);
    }
}
