//! evrmore-rpc - command-line front end for the Evrmore RPC client.
//!
//! ```text
//! evrmore-rpc call getblockhash 1000
//! evrmore-rpc --testnet config
//! evrmore-rpc stress --calls 500 --concurrency 20
//! evrmore-rpc watch --topic hashblock --resolve
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evrmore_rpc::notify::{Decoder, Notification, Subscriber, Topic};
use evrmore_rpc::{AsyncClient, BlockingClient, RpcConfig};

#[derive(Debug, Parser)]
#[command(name = "evrmore-rpc", version, about = "Query an Evrmore daemon over JSON-RPC")]
struct Cli {
    /// Full RPC endpoint URL (overrides host/port)
    #[arg(long, global = true)]
    url: Option<String>,

    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    /// Use testnet defaults
    #[arg(long, global = true)]
    testnet: bool,

    /// Data directory holding evrmore.conf and .cookie
    #[arg(long, global = true)]
    datadir: Option<PathBuf>,

    /// Config file path (defaults to <datadir>/evrmore.conf)
    #[arg(long, global = true)]
    conf: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call an RPC method. Parameters are parsed as JSON, falling back to strings.
    Call {
        method: String,
        params: Vec<String>,
    },
    /// Show the resolved endpoint and credential source
    Config,
    /// Issue many concurrent calls over one session and report latency
    Stress {
        #[arg(long, default_value_t = 100)]
        calls: usize,
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[arg(long, default_value = "getblockcount")]
        method: String,
    },
    /// Print ZMQ notifications until interrupted
    Watch {
        /// Topics to follow (defaults to every topic with a zmqpub endpoint)
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Endpoint to use instead of the one from evrmore.conf
        #[arg(long)]
        endpoint: Option<String>,
        /// Look blocks and transactions up through RPC
        #[arg(long)]
        resolve: bool,
    },
}

impl Cli {
    fn resolve_config(&self) -> Result<RpcConfig> {
        let mut builder = RpcConfig::builder().request_timeout(Duration::from_secs(self.timeout));
        if let Some(url) = &self.url {
            builder = builder.url(url);
        }
        if let Some(user) = &self.user {
            builder = builder.user(user);
        }
        if let Some(password) = &self.password {
            builder = builder.password(password);
        }
        if let Some(host) = &self.host {
            builder = builder.host(host);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if self.testnet {
            builder = builder.testnet(true);
        }
        if let Some(datadir) = &self.datadir {
            builder = builder.datadir(datadir);
        }
        if let Some(conf) = &self.conf {
            builder = builder.conf_path(conf);
        }
        builder.resolve().context("Failed to resolve RPC configuration")
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evrmore_rpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    match cli.command {
        Command::Call { method, params } => run_call(config, &method, &params),
        Command::Config => {
            print_config(&config);
            Ok(())
        }
        Command::Stress {
            calls,
            concurrency,
            method,
        } => run_stress(config, calls, concurrency.max(1), &method),
        Command::Watch {
            topics,
            endpoint,
            resolve,
        } => run_watch(config, &topics, endpoint, resolve),
    }
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn run_call(config: RpcConfig, method: &str, params: &[String]) -> Result<()> {
    let client = BlockingClient::new(config)?;
    let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();

    let result = client.call(method, params);
    client.close();

    match result? {
        Value::String(s) => println!("{}", s),
        Value::Null => {}
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn print_config(config: &RpcConfig) {
    println!("Endpoint: {}", config.url);
    println!("Network:  {:?}", config.network);
    match &config.credentials {
        Some(creds) => {
            println!("Credentials from {:?}", creds.source);
            println!("  user:     {}", creds.username);
            println!("  password: {}", creds.masked_password());
        }
        None => println!("No authentication method available"),
    }
    for (topic, endpoint) in &config.zmq_endpoints {
        println!("ZMQ {}: {}", topic, endpoint);
    }
}

fn run_stress(config: RpcConfig, calls: usize, concurrency: usize, method: &str) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = AsyncClient::new(config)?;
        let started = Instant::now();

        let outcomes: Vec<evrmore_rpc::Result<Duration>> = stream::iter(0..calls)
            .map(|_| {
                let client = client.clone();
                async move {
                    let t0 = Instant::now();
                    client.call(method, ()).await.map(|_| t0.elapsed())
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let elapsed = started.elapsed();
        let mut latencies: Vec<Duration> = Vec::with_capacity(outcomes.len());
        let mut failures = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(latency) => latencies.push(latency),
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Call failed: {}", e);
                }
            }
        }

        println!("Method:       {}", method);
        println!("Calls:        {} ok, {} failed", latencies.len(), failures);
        println!("Elapsed:      {:.2?}", elapsed);
        if !latencies.is_empty() {
            let total: Duration = latencies.iter().sum();
            let min = latencies.iter().min().copied().unwrap_or_default();
            let max = latencies.iter().max().copied().unwrap_or_default();
            println!(
                "Throughput:   {:.1} calls/s",
                latencies.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
            );
            println!(
                "Latency:      min {:.2?} / avg {:.2?} / max {:.2?}",
                min,
                total / latencies.len() as u32,
                max
            );
        }
        println!(
            "Connections:  {}",
            client.session().transport().connections_opened()
        );

        client.close().await;
        anyhow::Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("1000"), Value::from(1000));
        assert_eq!(parse_param("true"), Value::Bool(true));
        assert_eq!(parse_param("[\"a\"]"), serde_json::json!(["a"]));
        assert_eq!(parse_param("0000abcd"), Value::String("0000abcd".into()));
    }

    #[test]
    fn test_cli_parses_call() {
        let cli = Cli::parse_from(["evrmore-rpc", "--testnet", "call", "getblockhash", "1000"]);
        assert!(cli.testnet);
        match cli.command {
            Command::Call { method, params } => {
                assert_eq!(method, "getblockhash");
                assert_eq!(params, vec!["1000".to_string()]);
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }
}

fn run_watch(
    config: RpcConfig,
    topics: &[String],
    endpoint: Option<String>,
    resolve: bool,
) -> Result<()> {
    let topics: Vec<Topic> = if topics.is_empty() {
        config
            .zmq_endpoints
            .keys()
            .filter_map(|t| t.parse().ok())
            .collect()
    } else {
        topics
            .iter()
            .map(|t| t.parse())
            .collect::<std::result::Result<_, _>>()?
    };
    let first = topics.first().context("No topics to watch")?;

    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => config
            .zmq_endpoints
            .get(first.as_str())
            .cloned()
            .with_context(|| format!("No zmqpub{} endpoint configured", first))?,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = AsyncClient::new(config)?;
        let decoder = if resolve {
            Decoder::new(client.clone())
        } else {
            Decoder::local(client.clone())
        };

        let mut subscriber = Subscriber::new(endpoint, decoder);
        for topic in &topics {
            subscriber.on(*topic, print_notification);
        }
        subscriber.start().await?;

        tokio::signal::ctrl_c().await?;
        subscriber.stop().await;
        client.close().await;
        Ok(())
    })
}

fn print_notification(notification: Notification) {
    match notification {
        Notification::BlockHash { hash, sequence } => println!("[{}] block {}", sequence, hash),
        Notification::TxHash { txid, sequence } => println!("[{}] tx {}", sequence, txid),
        Notification::RawBlock { hex, sequence } => {
            println!("[{}] raw block ({} bytes)", sequence, hex.len() / 2)
        }
        Notification::RawTx { hex, sequence } => println!("[{}] raw tx {}", sequence, hex),
        Notification::Sequence {
            hash,
            label,
            sequence,
        } => println!("[{}] sequence {} {}", sequence, label, hash),
        Notification::Block {
            hash,
            height,
            sequence,
            ..
        } => println!("[{}] block {} at height {:?}", sequence, hash, height),
        Notification::Tx {
            txid,
            assets,
            sequence,
            ..
        } => {
            println!("[{}] tx {}", sequence, txid);
            for asset in assets {
                println!("    {} {} ({})", asset.amount, asset.name, asset.kind);
            }
        }
    }
}
