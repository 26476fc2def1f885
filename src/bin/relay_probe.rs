//! relay-probe — 连接后端并执行一次（可选流式）查询的命令行工具
//!
//! Usage:
//!   relay-probe [--config <file>] [--stream] [--health] <query>
//!
//! Without `--config`, configuration comes from the environment
//! (`ENDPOINT`, `API_KEY`, `MODEL`, ...). Ctrl-C interrupts a running stream.

use ai_relay::{QueryRequest, RelayClient, RelayConfig};
use anyhow::{bail, Context};
use std::io::Write;
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<String>,
    stream: bool,
    health: bool,
    query: String,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut config = None;
    let mut stream = false;
    let mut health = false;
    let mut words = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config requires a file path")?;
                config = Some(path.clone());
            }
            "--stream" | "-s" => stream = true,
            "--health" => health = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option: {other}"),
            other => words.push(other.to_string()),
        }
    }

    let query = words.join(" ");
    if query.trim().is_empty() && !health {
        print_usage();
        bail!("missing query");
    }
    Ok(Args {
        config,
        stream,
        health,
        query,
    })
}

fn print_usage() {
    println!(
        r#"relay-probe — 连接后端并执行一次查询

USAGE:
    relay-probe [OPTIONS] <QUERY>...

OPTIONS:
    -c, --config <file>     Load configuration from a YAML file
    -s, --stream            Stream the answer as it arrives
        --health            Print the health report as JSON
    -h, --help              Show this help message

ENVIRONMENT:
    ENDPOINT, API_KEY, MODEL    Required when --config is not given
    RUST_LOG                    Log filter (default: info)"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let config = match &args.config {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => RelayConfig::from_env().context("loading configuration from the environment")?,
    };

    let client = RelayClient::builder(config).build()?;
    let ready = client.initialize().await.context("connecting to the backend")?;
    if !ready {
        eprintln!("warning: backend connected but failed its health check");
    }

    if args.health {
        let status = client.health().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        if args.query.trim().is_empty() {
            client.shutdown().await;
            return Ok(());
        }
    }

    let request = QueryRequest::new(args.query.clone())?;
    let outcome = if args.stream {
        run_streaming(&client, request).await
    } else {
        let response = client.ask(request).await;
        if response.success {
            println!("{}", response.content);
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "query failed after {} retries ({}): {}",
                response.retry_count,
                response.error_type.as_deref().unwrap_or("unknown"),
                response.error.as_deref().unwrap_or("no error message"),
            ))
        }
    };

    client.shutdown().await;
    outcome
}

async fn run_streaming(client: &RelayClient, request: QueryRequest) -> anyhow::Result<()> {
    let task = client
        .ask_streaming(request, |text: &str| {
            let mut out = std::io::stdout();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        })
        .await?;

    let mut wait = Box::pin(task.wait());
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            client.interrupt();
            wait.await
        }
    };
    println!();

    if outcome.interrupted {
        eprintln!("(interrupted after {} chunks)", outcome.chunks_delivered);
    }
    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
