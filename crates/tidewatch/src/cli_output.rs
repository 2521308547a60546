//! Centralised helpers for user-facing CLI output written to stderr.

use crate::{
    config::ChainRegistry,
    portfolio::{ChainProbe, PortfolioReport},
    protocols::ProtocolReport,
};
use std::fmt::Write as _;
use std::io::Write as _;

fn stderr_writeln(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    if stderr.write_all(b"\n").is_err() {
        return;
    }
    let _flush = stderr.flush();
}

fn protocol_lines(out: &mut String, p: &ProtocolReport) {
    if let Some(e) = &p.error {
        let _w = writeln!(out, "  {:<12} {:<10} error: {} ({})", p.protocol, p.chain, e.code, e.message);
        return;
    }
    for pos in &p.positions {
        let _w = write!(
            out,
            "  {:<12} {:<10} {:<8} supplied {} borrowed {}",
            p.protocol, p.chain, pos.symbol, pos.supplied, pos.borrowed
        );
        if let Some(apy) = &pos.supply_apy {
            let _w = write!(out, " apy {apy}%");
        }
        if let Some(u) = &pos.underlying {
            let _w = write!(out, " underlying {u}");
        }
        out.push('\n');
    }
    for e in &p.errors {
        let _w = writeln!(
            out,
            "  {:<12} {:<10} skipped {}: {} ({})",
            p.protocol, p.chain, e.object, e.error.code, e.error.message
        );
    }
}

pub fn render_report(r: &PortfolioReport) -> String {
    let mut out = String::new();
    let _w = writeln!(out, "Wallet {}  total ${}", r.wallet, r.total_usd);
    for c in &r.chains {
        let _w = writeln!(out, "\n{} (chain id {})  ${}", c.chain, c.chain_id, c.total_usd);
        for b in &c.balances {
            let _w = writeln!(
                out,
                "  {:<10} {:>24}  ${} [{}]",
                b.symbol.as_deref().unwrap_or("?"),
                b.amount.as_deref().unwrap_or(b.raw.as_str()),
                b.value_usd,
                b.price_source.as_str()
            );
        }
        for e in &c.errors {
            let _w = writeln!(out, "  ! {}: {}", e.code, e.message);
        }
    }
    let with_content: Vec<&ProtocolReport> = r
        .protocols
        .iter()
        .filter(|p| !p.positions.is_empty() || p.error.is_some() || !p.errors.is_empty())
        .collect();
    if !with_content.is_empty() {
        out.push_str("\nPositions\n");
        for p in with_content {
            protocol_lines(&mut out, p);
        }
    }
    out
}

/// Print a human-readable report to stderr (JSON goes to stdout via `--json`).
pub fn print_report(r: &PortfolioReport) {
    stderr_writeln(render_report(r).trim_end());
}

pub fn print_chains(chains: &ChainRegistry) {
    let mut out = String::from("Configured chains:\n");
    for c in chains.iter() {
        let _w = writeln!(
            out,
            "  {:<10} id {:<6} native {:<5} multicall {}",
            c.name,
            c.chain_id,
            c.native.symbol,
            if c.multicall.is_some() { "yes" } else { "no" }
        );
    }
    stderr_writeln(out.trim_end());
}

pub fn print_probes(probes: &[ChainProbe]) {
    let mut out = String::from("RPC chain id check:\n");
    for p in probes {
        let status = match &p.error {
            None => "ok".to_owned(),
            Some(e) => format!("{}: {}", e.code, e.message),
        };
        let _w = writeln!(out, "  {:<10} expected {:<6} {status}", p.chain, p.expected_chain_id);
    }
    stderr_writeln(out.trim_end());
}
