//! Prometheus metrics exposition
//!
//! Counters are emitted by the pool library through the `metrics` facade;
//! this module installs the recorder that collects them and adds the pool
//! gauges the daemon refreshes itself:
//!
//! - `account_pool_throttle_events_total` (counter): label `error_type`
//! - `account_pool_recoveries_total` (counter): label `recovered_by`
//! - `account_pool_tokens_total` (counter): label `account_id`
//! - `account_pool_switch_decisions_total` (counter): label `decision`
//! - `account_pool_accounts` (gauge): label `status`
//! - `account_pool_assignments` (gauge)
//! - `account_pool_events_total` (counter): label `channel`

use account_pool::{AccountEvent, EventSink, PoolSummary};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "account_pool_throttle_events_total",
        "Provider throttle signals recorded against an account"
    );
    metrics::describe_counter!(
        "account_pool_recoveries_total",
        "Throttled accounts returned to active"
    );
    metrics::describe_counter!(
        "account_pool_tokens_total",
        "Tokens reported per account across all windows"
    );
    metrics::describe_counter!(
        "account_pool_switch_decisions_total",
        "Failover decisions taken after a throttle"
    );
    metrics::describe_gauge!("account_pool_accounts", "Accounts in the pool by status");
    metrics::describe_gauge!("account_pool_assignments", "Sessions bound to an account");
    metrics::describe_counter!("account_pool_events_total", "Pool events published per channel");
}

/// Counts every pool event by channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn send(&self, event: AccountEvent) {
        metrics::counter!("account_pool_events_total", "channel" => event.channel()).increment(1);
    }
}

/// Refresh the pool gauges from a registry summary.
pub fn record_pool_summary(summary: &PoolSummary) {
    let by_status = [
        ("active", summary.accounts_active),
        ("throttled", summary.accounts_throttled),
        ("expired", summary.accounts_expired),
        ("disabled", summary.accounts_disabled),
    ];
    for (status, count) in by_status {
        metrics::gauge!("account_pool_accounts", "status" => status).set(count as f64);
    }
    metrics::gauge!("account_pool_assignments").set(summary.assignments_total as f64);
}
