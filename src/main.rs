mod catalog;
mod chart;
mod cloud_watch_metrics_client;
mod config;
mod dispatcher;
mod error;
mod failure;
mod fetcher;
mod metric;
mod orchestrator;
mod retry;
mod store;
#[cfg(test)]
mod testing;
mod time_range;
mod workbook;

use crate::cloud_watch_metrics_client::{CloudWatchMetricsClient, MetricsSource};
use crate::config::Config;
use crate::dispatcher::SesMailTransport;
use crate::error::ReportError;
use crate::orchestrator::Orchestrator;
use crate::store::S3ObjectStore;
use anyhow::Context as _;
use chrono::Utc;
use lambda_runtime::{handler_fn, Context, Error};
use rusoto_core::Region;
use serde_json::Value;
use std::convert::TryFrom;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .without_time()
        .init();
    lambda_runtime::run(handler_fn(report_handler)).await?;
    Ok(())
}

async fn report_handler(_: Value, ctx: Context) -> Result<Value, Error> {
    let config = Config::from_env().context("reading configuration")?;
    let budget = remaining(ctx.deadline, Utc::now().timestamp_millis(), config.run_timeout);
    info!(
        request_id = ctx.request_id.as_str(),
        budget_ms = budget.as_millis() as u64,
        "report run starting"
    );
    let deadline = Instant::now() + budget;
    let orchestrator = build(config).context("creating AWS clients")?;

    let report = orchestrator.run(Utc::now(), deadline).await;
    let output = serde_json::to_value(&report)?;
    if report.is_done() {
        Ok(output)
    } else {
        Err(anyhow::anyhow!("report run failed: {}", output).into())
    }
}

fn build(config: Config) -> Result<Orchestrator, ReportError> {
    let home = region(&config.home_region)?;
    let sources = config
        .regions
        .iter()
        .map(|name| -> Result<(String, Arc<dyn MetricsSource>), ReportError> {
            let client = CloudWatchMetricsClient::new(region(name)?);
            Ok((name.clone(), Arc::new(client)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let store = Arc::new(S3ObjectStore::new(
        home.clone(),
        config.bucket.clone(),
        config.link_expiry,
    ));
    let transport = Arc::new(SesMailTransport::new(home));
    Ok(Orchestrator::new(config, sources, store, transport))
}

fn region(name: &str) -> Result<Region, ReportError> {
    Region::from_str(name).map_err(|error| ReportError::Config(format!("region {}: {}", name, error)))
}

/// Time left before the invocation deadline (epoch milliseconds), or
/// `fallback` when the runtime did not provide one.
fn remaining(deadline_ms: u64, now_ms: i64, fallback: Duration) -> Duration {
    match i64::try_from(deadline_ms) {
        Ok(deadline) if deadline > now_ms => Duration::from_millis((deadline - now_ms) as u64),
        _ => fallback,
    }
}
