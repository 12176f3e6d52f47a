use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use eserver_client::{ClientConfig, LogQuery, MarkerId, SourceLocator, create_runtime};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eserver-client")]
#[command(about = "Discover code markers and run them on a remote executor")]
struct Cli {
    /// Path to eserver.json (default: XDG config dir, then ./eserver.json)
    #[arg(long, global = true, env = "ESERVER_CONFIG")]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan sources and print the markers found
    Scan {
        /// Files or http(s) URLs; defaults to the configured sources
        locators: Vec<String>,
        /// Print marker bodies as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Scan, connect, and execute one marker
    Exec {
        /// Marker id (e.g. mk_3f2a09c1d4e5b677)
        marker: Option<String>,
        /// Resolve the marker by a substring of its source locator
        #[arg(long, requires = "code")]
        source: Option<String>,
        /// Resolve the marker by a substring of its body
        #[arg(long, requires = "source")]
        code: Option<String>,
        /// Arguments as a JSON array
        #[arg(long)]
        args: Option<String>,
        /// How long to wait for the executor connection
        #[arg(long, default_value = "10000")]
        connect_timeout_ms: u64,
        /// Dump the diagnostic log after running
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&rust_log)?)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClientConfig::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClientConfig::load()?,
    };

    match cli.command {
        Commands::Scan { locators, json } => {
            let locators: Vec<SourceLocator> = if locators.is_empty() {
                config.source_locators()
            } else {
                locators.into_iter().map(SourceLocator::from).collect()
            };
            if locators.is_empty() {
                bail!("no locators given and none configured");
            }

            let runtime = create_runtime(config)?;
            let report = runtime.scanner().scan_all(&locators).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report.markers)?);
            } else {
                println!("Found {} markers:", report.markers.len());
                for marker in &report.markers {
                    println!(
                        "  {}  {:?}  {}:{}-{}",
                        marker.id,
                        marker.kind,
                        marker.source_locator,
                        marker.line_range.start,
                        marker.line_range.end
                    );
                }
            }
            for locator in &report.failed {
                warn!("Could not read {}", locator);
            }
        }
        Commands::Exec {
            marker,
            source,
            code,
            args,
            connect_timeout_ms,
            verbose,
        } => {
            let args = parse_args(args.as_deref())?;
            let runtime = create_runtime(config)?;
            runtime.start().await;

            let marker_id = match (marker, source, code) {
                (Some(id), _, _) => MarkerId::new(id),
                (None, Some(source), Some(code)) => runtime
                    .facade()
                    .resolve_marker_by_content(&source, &code)
                    .with_context(|| format!("no block marker in '{}' contains '{}'", source, code))?,
                _ => bail!("give a marker id or --source and --code"),
            };
            let marker = runtime
                .registry()
                .get(marker_id.as_str())
                .with_context(|| format!("unknown marker {}", marker_id))?;

            let connected = runtime
                .connection()
                .wait_connected(Duration::from_millis(connect_timeout_ms))
                .await;
            if !connected {
                runtime.shutdown();
                bail!("could not connect to {}", runtime.config().endpoint);
            }

            // Replay runs in the background; make sure this body is registered first.
            runtime
                .connection()
                .register(&marker.id, &marker.code_body)
                .await?;
            info!("Executing {} with {} args", marker.id, args.len());
            let outcome = runtime.facade().execute(&marker.id, args).await;

            if verbose {
                for entry in runtime.log().snapshot(&LogQuery::default()) {
                    eprintln!(
                        "{} {:<5} {}",
                        entry.timestamp.format("%H:%M:%S%.3f"),
                        entry.level.as_str(),
                        entry.message
                    );
                }
            }
            runtime.shutdown();

            let value = outcome?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` directives on top of the crate's default `info` level.
fn log_filter(rust_log: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::new(rust_log).add_directive("eserver_client=info".parse()?))
}

fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(raw).context("--args is not valid JSON")? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_filter_keeps_rust_log_directives() {
        let filter = log_filter("reqwest=trace,hyper=debug")
            .unwrap()
            .to_string()
            .to_lowercase();
        assert!(filter.contains("reqwest=trace"));
        assert!(filter.contains("hyper=debug"));
        assert!(filter.contains("eserver_client=info"));
    }

    #[test]
    fn args_accept_array_or_single_value() {
        assert_eq!(parse_args(None).unwrap(), Vec::<Value>::new());
        assert_eq!(parse_args(Some("[1, \"x\"]")).unwrap(), vec![json!(1), json!("x")]);
        assert_eq!(parse_args(Some("42")).unwrap(), vec![json!(42)]);
        assert!(parse_args(Some("[1,")).is_err());
    }
}
