use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::application::{InitOptions, PgApplication};
use crate::config::Config;
use crate::pool::PoolStats;
use crate::routing::TargetKey;

#[derive(Parser)]
#[command(name = "replica-router")]
#[command(about = "Replica Router - route transactions between primary and replica pools", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Configuration override as key=value, e.g. datasource.read.host=replica1
    #[arg(long = "set", global = true, value_parser = parse_key_value)]
    pub overrides: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration (passwords redacted)
    Config,

    /// Open the initial connections of every pool and print their stats
    Check,

    /// Run one statement in a routed transaction
    Exec {
        /// Start the transaction read-only, routing it to the read pool
        #[arg(short = 'r', long = "read-only")]
        read_only: bool,

        /// Statement to execute
        statement: String,
    },
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let options = InitOptions {
        config_path: cli.config,
        overrides: cli.overrides,
        warm_up: false,
    };

    match cli.command {
        Commands::Config => {
            let config = load_config(&options)?;
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }

        Commands::Check => {
            let app = crate::application::initialize(InitOptions {
                warm_up: true,
                ..options
            })
            .await?;
            print_stats(&app);
            app.shutdown().await;
        }

        Commands::Exec {
            read_only,
            statement,
        } => {
            let app = crate::application::initialize(options).await?;

            let result = app
                .transactional(read_only, |tx| {
                    Box::pin(async move { tx.execute(&statement).await })
                })
                .await;

            match result {
                Ok(rows) => println!("✓ {} row(s) affected", rows),
                Err(err) => {
                    app.shutdown().await;
                    return Err(err).context("Statement failed");
                }
            }

            print_stats(&app);
            app.shutdown().await;
        }
    }

    Ok(())
}

fn load_config(options: &InitOptions) -> Result<Config> {
    let mut builder =
        Config::builder().config_path(options.config_path.clone().map(std::path::PathBuf::from));
    for (key, value) in &options.overrides {
        builder = builder.set(key.clone(), value.clone());
    }
    builder.build().context("Failed to load configuration")
}

fn print_stats(app: &PgApplication) {
    for (target, stats) in app.stats() {
        println!("{}", format_stats(target, &stats));
    }
}

fn format_stats(target: TargetKey, stats: &PoolStats) -> String {
    format!(
        "{:<5} | {} | size {}/{} | idle {} | in use {} | created {} | closed {} | timeouts {}",
        target,
        stats.name,
        stats.size,
        stats.max_size,
        stats.idle,
        stats.in_use,
        stats.connections_created,
        stats.connections_closed,
        stats.acquire_timeouts
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_command() {
        let cli = Cli::parse_from([
            "replica-router",
            "--set",
            "datasource.read.host=replica1",
            "exec",
            "--read-only",
            "SELECT 1",
        ]);

        assert_eq!(
            cli.overrides,
            vec![("datasource.read.host".to_string(), "replica1".to_string())]
        );
        match cli.command {
            Commands::Exec {
                read_only,
                statement,
            } => {
                assert!(read_only);
                assert_eq!(statement, "SELECT 1");
            }
            _ => panic!("expected exec command"),
        }
    }

    #[test]
    fn test_override_requires_key_value() {
        assert!(parse_key_value("datasource.read.host").is_err());
        assert!(parse_key_value("=value").is_err());
        assert_eq!(
            parse_key_value("routing.lenient_fallback=true").unwrap(),
            ("routing.lenient_fallback".to_string(), "true".to_string())
        );
    }

    #[test]
    fn test_format_stats_line() {
        let stats = PoolStats {
            name: "read".into(),
            max_size: 20,
            size: 3,
            idle: 2,
            in_use: 1,
            connections_created: 3,
            ..PoolStats::default()
        };
        let line = format_stats(TargetKey::Read, &stats);
        assert!(line.starts_with("read  | read | size 3/20"));
        assert!(line.contains("in use 1"));
    }
}
