//! NetSniff CLI - Record HTTP exchanges and browse the captured log

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::{Method, Request};
use netsniff_client::{
    FeedState, HttpTransport, LogFeed, LogStore, NetSniff, NetworkLogSummary, OutgoingContent,
    SnifferConfig, SniffingClient,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// NetSniff - Capture HTTP request/response exchanges into a local log
#[derive(Parser, Debug)]
#[command(name = "netsniff")]
#[command(about = "NetSniff - Capture HTTP request/response exchanges into a local log")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log database URL
    #[arg(long, global = true, env = "NETSNIFF_DATABASE", default_value = netsniff_db::DEFAULT_DATABASE_URL)]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a request and record the exchange
    #[command(long_about = r#"
Send an HTTP request through the sniffing client. The exchange is written
to the log database and the response body is printed.

EXAMPLES:
  netsniff fetch http://127.0.0.1:8080/carts

  netsniff fetch http://127.0.0.1:8080/orders \
    --method POST \
    --header "Accept: application/json" \
    --content-type application/json \
    --data '{"qty": 1}'
    "#)]
    Fetch {
        /// Request URL (http:// only)
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Extra request header ("Name: value"), may be repeated
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Content type of the request body
        #[arg(long, default_value = "text/plain; charset=utf-8")]
        content_type: String,
    },

    /// List captured exchanges, newest first
    List {
        /// Only show exchanges whose URL, method or status contains this text
        #[arg(short, long, default_value = "")]
        query: String,

        #[arg(short, long, default_value = "50")]
        limit: u64,

        #[arg(long, default_value = "0")]
        offset: u64,
    },

    /// Print one captured exchange as JSON
    Show {
        /// Log id
        id: String,
    },

    /// Print the number of captured exchanges
    Count,

    /// Delete every captured exchange
    Clear,

    /// Follow the log list as new exchanges are captured
    Watch {
        #[arg(short, long, default_value = "")]
        query: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Invalid header {:?}, expected \"Name: value\"", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn format_time(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_summaries(summaries: &[NetworkLogSummary]) {
    for log in summaries {
        let status = log
            .response_status_code
            .map(|s| s.to_string())
            .unwrap_or_else(|| "ERR".to_string());
        println!(
            "{}  {}  {:>3}  {:<7} {}",
            log.id,
            format_time(log.request_timestamp),
            status,
            log.request_method,
            log.request_url
        );
    }
}

async fn fetch(
    store: Arc<dyn LogStore>,
    url: String,
    method: String,
    headers: Vec<String>,
    data: Option<String>,
    content_type: String,
) -> Result<()> {
    let config = SnifferConfig::builder()
        .build()
        .context("Failed to build sniffer configuration")?;
    let client = SniffingClient::new(HttpTransport::new(), config, store);

    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid method {}", method))?;
    let mut builder = Request::builder().method(method).uri(&url);
    for raw in &headers {
        let (name, value) = parse_header(raw)?;
        builder = builder.header(name, value);
    }
    let content = match data {
        Some(data) => OutgoingContent::bytes(content_type, data),
        None => OutgoingContent::empty(),
    };
    let request = builder.body(content).context("Invalid request")?;

    let result = client.send(request).await;
    let outcome = match result {
        Ok(response) => {
            let id = response.id().to_string();
            let status = response.status();
            response
                .bytes()
                .await
                .map(|body| {
                    println!("{}", String::from_utf8_lossy(&body));
                    info!("{} {} (log {})", status, url, id);
                })
                .context("Failed to read response body")
        }
        Err(e) => Err(anyhow::anyhow!("Request to {} failed: {}", url, e)),
    };

    // The failed exchange is logged too
    client.flush().await;
    outcome
}

async fn watch(store: Arc<dyn LogStore>, query: String) -> Result<()> {
    let feed = LogFeed::new(store);
    if !query.is_empty() {
        feed.set_query(query);
    }
    let mut states = feed.subscribe();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        match states.borrow_and_update().clone() {
            FeedState::Loading => {}
            FeedState::Empty => println!("(no captured exchanges)"),
            FeedState::Logs(logs) => {
                println!("--- {} exchanges ---", logs.len());
                print_summaries(&logs);
            }
            FeedState::Error(e) => println!("error: {}", e),
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, stopping");
                return Ok(());
            }
            changed = states.changed() => {
                changed.context("Log feed stopped")?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let netsniff = NetSniff::init(&cli.database)
        .await
        .with_context(|| format!("Failed to open log database {}", cli.database))?;
    let store = netsniff.dao();

    match cli.command {
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            content_type,
        } => fetch(Arc::new(store), url, method, headers, data, content_type).await,
        Commands::List {
            query,
            limit,
            offset,
        } => {
            let logs = store
                .query_page(&query, limit, offset)
                .await
                .context("Failed to list logs")?;
            let summaries: Vec<NetworkLogSummary> = logs.iter().map(|log| log.summary()).collect();
            print_summaries(&summaries);
            Ok(())
        }
        Commands::Show { id } => {
            let log = store
                .get_by_id(&id)
                .await
                .context("Failed to load log")?
                .with_context(|| format!("No log with id {}", id))?;
            println!("{}", serde_json::to_string_pretty(&log)?);
            Ok(())
        }
        Commands::Count => {
            let count = store.count().await.context("Failed to count logs")?;
            println!("{}", count);
            Ok(())
        }
        Commands::Clear => {
            store.clear_all().await.context("Failed to clear logs")?;
            info!("All captured exchanges deleted");
            Ok(())
        }
        Commands::Watch { query } => watch(Arc::new(store), query).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let (name, value) = parse_header("Accept:  application/json ").unwrap();
        assert_eq!(name, "Accept");
        assert_eq!(value, "application/json");
        assert!(parse_header("no-colon").is_err());
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(None), "-");
        assert_eq!(format_time(Some(0)), "1970-01-01 00:00:00.000");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["netsniff", "list"]);
        assert_eq!(cli.database, netsniff_db::DEFAULT_DATABASE_URL);
        assert!(matches!(
            cli.command,
            Commands::List { limit: 50, offset: 0, .. }
        ));
    }
}
