use std::process::{Command, Output};

use eyre::Context as _;
use predicates::prelude::*;

fn tidewatch(args: &[&str]) -> eyre::Result<(Output, tempfile::TempDir)> {
    let exe = assert_cmd::cargo::cargo_bin!("tidewatch");
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("TIDEWATCH_CONFIG_DIR", cfg_dir.path())
        .env("TIDEWATCH_DATA_DIR", data_dir.path())
        .env_remove("TIDEWATCH_EXPLORER_API_KEY")
        .env_remove("TIDEWATCH_PRICE_API_KEY")
        .args(args)
        .output()
        .with_context(|| format!("run tidewatch {}", args.join(" ")))?;
    Ok((out, cfg_dir))
}

#[test]
fn chains_json_lists_builtin_chains() -> eyre::Result<()> {
    let (out, cfg_dir) = tidewatch(&["chains", "--json"])?;
    assert!(
        out.status.success(),
        "chains exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse chains json")?;
    let list = v.as_array().ok_or_else(|| eyre::eyre!("expected array"))?;
    let eth = list
        .iter()
        .find(|c| c.get("name").and_then(serde_json::Value::as_str) == Some("ethereum"))
        .ok_or_else(|| eyre::eyre!("ethereum missing"))?;
    assert_eq!(eth.get("chain_id").and_then(serde_json::Value::as_u64), Some(1_u64));

    // First run writes the default config for the user to edit.
    assert!(cfg_dir.path().join("config.toml").is_file(), "config.toml not written");
    Ok(())
}

#[test]
fn paths_json_reports_overridden_dirs() -> eyre::Result<()> {
    let (out, cfg_dir) = tidewatch(&["paths"])?;
    assert!(out.status.success(), "paths exited non-zero");

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse paths json")?;
    let config_dir = v.get("config_dir").and_then(serde_json::Value::as_str);
    assert_eq!(config_dir, cfg_dir.path().to_str());
    assert!(v.get("log_file").and_then(|x| x.as_str()).is_some());
    Ok(())
}

#[test]
fn report_rejects_malformed_wallet() -> eyre::Result<()> {
    let (out, _cfg) = tidewatch(&["report", "not-an-address", "--json"])?;
    assert!(!out.status.success(), "malformed wallet accepted");
    assert!(out.stdout.is_empty(), "no report expected on stdout");
    Ok(())
}

#[test]
fn report_rejects_unknown_chain_before_fetching() -> eyre::Result<()> {
    let (out, _cfg) = tidewatch(&[
        "report",
        "0x000000000000000000000000000000000000dEaD",
        "--chain",
        "narnia",
        "--json",
    ])?;
    assert!(!out.status.success(), "unknown chain accepted");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        predicate::str::contains("unknown chain").eval(&stderr),
        "stderr should name the chain: {stderr}"
    );
    Ok(())
}
