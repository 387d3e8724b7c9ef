//! Waddle Node - a single XMPP routing node.
//!
//! Loads server properties from a TOML file, `WADDLE_*` environment
//! variables and `--set` overrides (later sources win), builds the server
//! context and serves client connections until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use config::{Config, Environment, File, Value, ValueKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use waddle_router::config as props;
use waddle_router::server::C2sServer;
use waddle_router::{ServerContext, ServerProperties};

const DEFAULT_FILTER: &str = "info,waddle_router=debug,waddle_node=debug";

/// Property names that are not all lowercase. The config crate folds keys
/// to lowercase, so these are restored after loading.
const MIXED_CASE_NAMES: &[&str] = &[props::ADMIN_JIDS];

/// Waddle Node - clustered XMPP routing node
#[derive(Parser, Debug)]
#[command(name = "waddle-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML file with server properties
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Property override, e.g. `--set xmpp.domain=example.com` (repeatable)
    #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    info!("Waddle Node starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let properties = load_properties(&cli)?;
    let ctx = ServerContext::builder()
        .properties(Arc::new(properties))
        .build()
        .context("Failed to build server context")?;
    ctx.start_clustering_if_enabled()
        .context("Failed to start clustering")?;

    let server = C2sServer::bind(Arc::clone(&ctx))
        .await
        .context("Failed to bind client listener")?;
    info!(
        domain = %ctx.domain(),
        node = %ctx.node_id(),
        addr = %server.local_addr()?,
        "Accepting client connections"
    );

    let outcome = tokio::select! {
        result = server.run() => result.context("Client listener failed"),
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            signal.context("Failed to listen for interrupt")
        }
    };

    ctx.shutdown().await;
    info!("Waddle Node stopped");
    outcome
}

/// Install the global subscriber. `RUST_LOG` wins over `WADDLE_LOG_LEVEL`.
fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives =
            std::env::var("WADDLE_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        EnvFilter::new(directives)
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
    }
    Ok(())
}

fn load_properties(cli: &Cli) -> Result<ServerProperties> {
    let mut builder = Config::builder();
    if let Some(path) = &cli.config {
        builder = builder.add_source(File::from(path.as_path()));
    }
    let loaded = builder
        .add_source(
            Environment::with_prefix("WADDLE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to load configuration")?;

    let table: HashMap<String, Value> = loaded
        .try_deserialize()
        .context("Configuration root must be a table")?;
    let properties = ServerProperties::new();
    for (name, value) in flatten(table)? {
        properties.set(canonical_name(&name), value);
    }
    for raw in &cli.overrides {
        let (name, value) = parse_override(raw)?;
        properties.set(name, value);
    }
    Ok(properties)
}

/// Turn a nested table into `dotted.name -> value` pairs. Arrays become
/// comma separated lists.
fn flatten(table: HashMap<String, Value>) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut pending: Vec<(String, Value)> = table.into_iter().collect();
    while let Some((name, value)) = pending.pop() {
        match value.kind {
            ValueKind::Table(children) => {
                pending.extend(
                    children
                        .into_iter()
                        .map(|(child, value)| (format!("{}.{}", name, child), value)),
                );
            }
            ValueKind::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| item.into_string())
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("Property '{}' must be a list of scalars", name))?;
                out.push((name, items.join(",")));
            }
            ValueKind::Nil => {}
            kind => {
                let text = Value::new(None, kind)
                    .into_string()
                    .with_context(|| format!("Property '{}' has no text form", name))?;
                out.push((name, text));
            }
        }
    }
    out.sort();
    Ok(out)
}

fn canonical_name(name: &str) -> String {
    MIXED_CASE_NAMES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(name))
        .map(|known| known.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn parse_override(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("Override '{}' is not NAME=VALUE", raw);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Override '{}' has an empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str) -> HashMap<String, Value> {
        Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_flatten_nested_tables() {
        let pairs = flatten(table(
            r#"
            [xmpp]
            domain = "example.com"
            client.idle = 60000

            [clustering]
            enabled = true
            "#,
        ))
        .unwrap();

        assert_eq!(
            pairs,
            vec![
                ("clustering.enabled".to_string(), "true".to_string()),
                ("xmpp.client.idle".to_string(), "60000".to_string()),
                ("xmpp.domain".to_string(), "example.com".to_string()),
            ]
        );
    }

    #[test]
    fn test_flatten_joins_arrays() {
        let pairs = flatten(table(
            r#"
            [xmpp.forward]
            admins = ["ops", "root@example.com"]
            "#,
        ))
        .unwrap();

        assert_eq!(
            pairs,
            vec![(
                "xmpp.forward.admins".to_string(),
                "ops,root@example.com".to_string()
            )]
        );
    }

    #[test]
    fn test_mixed_case_names_restored() {
        assert_eq!(canonical_name("admin.authorizedjids"), props::ADMIN_JIDS);
        assert_eq!(canonical_name("xmpp.domain"), "xmpp.domain");
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("xmpp.domain = example.com").unwrap(),
            ("xmpp.domain".to_string(), "example.com".to_string())
        );
        assert_eq!(
            parse_override("route.all-resources=").unwrap(),
            ("route.all-resources".to_string(), String::new())
        );
        assert!(parse_override("xmpp.domain").is_err());
        assert!(parse_override("=value").is_err());
    }

    #[test]
    fn test_cli_accepts_repeated_overrides() {
        let cli = Cli::try_parse_from([
            "waddle-node",
            "--set",
            "xmpp.domain=example.com",
            "-s",
            "clustering.enabled=false",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.overrides.len(), 2);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_overrides_applied_without_file() {
        let cli = Cli {
            config: None,
            overrides: vec!["xmpp.domain=override.org".to_string()],
            log_format: LogFormat::Text,
        };

        let properties = load_properties(&cli).unwrap();
        assert_eq!(properties.domain(), "override.org");
    }
}
