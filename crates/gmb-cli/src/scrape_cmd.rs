//! `gmb scrape`: run one job in the foreground and print the outcome.

use anyhow::{Context, Result};
use serde::Serialize;

use gmb_core::{Launcher, ScrapeOutcome, ScrapeQuery, aggregate};

#[derive(Debug, Serialize)]
struct Report<'a> {
    success: bool,
    query: &'a ScrapeQuery,
    #[serde(flatten)]
    outcome: &'a ScrapeOutcome,
    total_businesses: usize,
}

/// Launch the worker for `query`, drain it, and print the outcome as JSON.
///
/// Returns whether the scrape counts as successful (no error and at least
/// one business).
pub async fn run_scrape(launcher: &dyn Launcher, query: &ScrapeQuery) -> Result<bool> {
    query.validate()?;
    tracing::info!(activity = %query.activity, city = %query.city, grid_size = query.grid_size, "starting scrape");

    let bridge = launcher
        .launch(query)
        .await
        .context("failed to launch worker")?;
    let outcome = aggregate(bridge).await;

    let report = Report {
        success: outcome.is_success(),
        query,
        outcome: &outcome,
        total_businesses: outcome.businesses.len(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        tracing::warn!(error = outcome.failure_message(), "scrape finished without results");
    }
    Ok(report.success)
}
