//! Batch CLI: estimate the BTC/USD price for one UTC day (or an explicit
//! block range) straight from a Bitcoin Core node, and write a JSON report.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainpulse_backend::{chain::rpc::BitcoinRpc, engine::batch, oracle::stencil};

#[derive(Parser, Debug)]
#[command(
    name = "chainpulse-batch",
    about = "Estimate BTC/USD from one day of on-chain transactions"
)]
struct Args {
    /// UTC date, YYYY-MM-DD or YYYY/MM/DD
    date: Option<String>,

    /// Explicit inclusive block range FIRST:LAST, instead of a date
    #[arg(long)]
    blocks: Option<String>,

    /// Directory the JSON report is written into
    #[arg(long, env = "CHAINPULSE_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Do not try to open the report when done
    #[arg(long)]
    no_browser: bool,

    #[arg(long, env = "BITCOIN_RPC_URL", default_value = "http://127.0.0.1:8332")]
    rpc_url: String,

    #[arg(long, env = "BITCOIN_RPC_USER")]
    rpc_user: Option<String>,

    #[arg(long, env = "BITCOIN_RPC_PASSWORD")]
    rpc_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if !stencil::verify_integrity() {
        bail!("stencil constants failed the integrity check");
    }

    let rpc = BitcoinRpc::new(args.rpc_url.clone(), args.rpc_user, args.rpc_password)?;

    let (outcome, label) = if let Some(range) = &args.blocks {
        let (first, last) = parse_range(range)?;
        (batch::run_for_range(&rpc, first, last).await?, range.replace(':', "-"))
    } else {
        let raw = args
            .date
            .as_deref()
            .context("a date or a --blocks range is required")?;
        let date = parse_date(raw)?;
        (batch::run_for_date(&rpc, date).await?, date.to_string())
    };

    match outcome.result.price_usd {
        Some(price) => {
            info!(
                price,
                confidence = outcome.result.confidence,
                tx_count = outcome.result.tx_count,
                outputs = outcome.result.output_count,
                "Estimation complete"
            );
            println!(
                "blocks {}..{}  price ${:.2}  confidence {:.2}  ({} accepted txs, {} outputs, {} cloud points)",
                outcome.first_height,
                outcome.last_height,
                price,
                outcome.result.confidence,
                outcome.result.tx_count,
                outcome.result.output_count,
                outcome.result.intraday.len(),
            );
        }
        None => {
            warn!("Not enough usable transactions to estimate a price");
            println!(
                "blocks {}..{}  no price (insufficient data, {} accepted txs)",
                outcome.first_height, outcome.last_height, outcome.result.tx_count,
            );
        }
    }

    let report_path = args.data_dir.join(format!("chainpulse-{}.json", label));
    let report = serde_json::json!({
        "first_height": outcome.first_height,
        "last_height": outcome.last_height,
        "result": outcome.result,
    });
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
    info!(path = %report_path.display(), "Report written");

    if !args.no_browser {
        let _ = Command::new("xdg-open").arg(&report_path).spawn();
    }

    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw.replace('/', "-"), "%Y-%m-%d")
        .with_context(|| format!("Unparseable date: {}", raw))
}

fn parse_range(raw: &str) -> Result<(u64, u64)> {
    let (first, last) = raw
        .split_once(':')
        .with_context(|| format!("Range must look like FIRST:LAST, got {}", raw))?;
    let first: u64 = first.trim().parse().context("Bad first height")?;
    let last: u64 = last.trim().parse().context("Bad last height")?;
    if last < first {
        bail!("Range ends before it starts: {}:{}", first, last);
    }
    Ok((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_both_separators() {
        assert_eq!(
            parse_date("2024/03/15").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
        assert_eq!(
            parse_date("2024-03-15").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
        assert!(parse_date("15/03/2024").is_err());
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("850000:850143").unwrap(), (850_000, 850_143));
        assert!(parse_range("850143:850000").is_err());
        assert!(parse_range("850000").is_err());
    }
}
