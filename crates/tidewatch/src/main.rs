#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::{io::Write as _, sync::Arc};
use tidewatch::{
    cli_output,
    config::ChainInfo,
    paths::TidewatchPaths,
    portfolio::{Engine, ReportRequest},
    store::ConfigStore,
};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tidewatch", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a portfolio report for a wallet: balances, protocol positions, USD totals.
    Report {
        /// EVM wallet address (0x + 40 hex digits).
        wallet: String,

        /// Restrict to a chain (repeatable). Defaults to every configured chain.
        #[arg(long = "chain")]
        chains: Vec<String>,

        /// Restrict to a protocol (repeatable): aave_v3, lido, yearn, compound_v3.
        #[arg(long = "protocol")]
        protocols: Vec<String>,

        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List the configured chains.
    Chains {
        /// Ask each chain's RPC for its chain id and compare with the configured one.
        #[arg(long, default_value_t = false)]
        probe: bool,

        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &TidewatchPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tidewatch.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn write_json_line(v: &impl serde::Serialize, what: &str) -> eyre::Result<()> {
    let s = serde_json::to_string(v).with_context(|| format!("serialize {what}"))?;
    writeln!(std::io::stdout().lock(), "{s}").with_context(|| format!("write {what}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = TidewatchPaths::discover()?;
    tidewatch::fsutil::ensure_dir(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);

    match cli.cmd {
        Command::Paths => write_json_line(
            &serde_json::json!({
              "config_dir": paths.config_dir,
              "config_file": paths.config_file(),
              "data_dir": paths.data_dir,
              "log_file": paths.log_file,
            }),
            "paths",
        ),
        Command::Chains { probe: true, json } => {
            let cfg = ConfigStore::new(&paths).load_or_init_default()?;
            let probes = Engine::new(&cfg)?.probe_chains().await;
            if json {
                write_json_line(&probes, "chain probes")
            } else {
                cli_output::print_probes(&probes);
                Ok(())
            }
        }
        Command::Chains { probe: false, json } => {
            let cfg = ConfigStore::new(&paths).load_or_init_default()?;
            let engine = Engine::new(&cfg)?;
            let chains = engine.chains();
            if json {
                let list: Vec<&ChainInfo> = chains.iter().map(Arc::as_ref).collect();
                write_json_line(&list, "chains")
            } else {
                cli_output::print_chains(chains);
                Ok(())
            }
        }
        Command::Report {
            wallet,
            chains,
            protocols,
            json,
        } => {
            let cfg = ConfigStore::new(&paths).load_or_init_default()?;
            let engine = Engine::new(&cfg)?;
            let req = ReportRequest {
                wallet,
                chains,
                protocols,
            };
            let report = engine.report(&req).await.context("invalid report request")?;
            if json {
                write_json_line(&report, "report")
            } else {
                cli_output::print_report(&report);
                Ok(())
            }
        }
    }
}
