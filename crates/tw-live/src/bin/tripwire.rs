use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tw_live::{SafetyContext, SafetyMonitor};
use tw_types::{
    ExecutionPosition, ExecutionStats, PatternMonitoringReport, PatternStats, SafetyConfig, Side,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SafetyConfig::from_env()?;
    let paper = SafetyContext::paper();

    // Seed the sandbox with one protected position and plausible telemetry.
    paper.exchange.set_price("BTCUSDT", Decimal::from(42_000));
    paper.context.positions.open(
        ExecutionPosition::new("sandbox-1", "BTCUSDT", Side::Buy, Decimal::ONE, Decimal::from(42_000))
            .with_stop_loss(Decimal::from(40_000))
            .with_take_profit(Decimal::from(46_000)),
    )?;
    paper.execution.set_stats(ExecutionStats {
        success_rate: Decimal::from(65),
        ..Default::default()
    });
    paper.patterns.set_report(PatternMonitoringReport {
        status: "running".to_string(),
        stats: PatternStats {
            average_confidence: Decimal::from(75),
            ..Default::default()
        },
    });

    let monitor = SafetyMonitor::new(paper.context.clone(), config)?;
    monitor.start_monitoring().await?;
    info!("tripwire running in sandbox mode, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    let report = monitor.get_report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    monitor.stop_monitoring().await?;
    Ok(())
}
