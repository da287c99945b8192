//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//! - `_bytes` suffix for byte counters

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Resource locks
    describe_counter!(
        "stornode_lock_claims_total",
        "Resource lock claims (by outcome: acquired, duplicate, stolen, busy)"
    );

    // Background jobs
    describe_gauge!("stornode_jobs_running", "Background jobs currently executing");
    describe_counter!("stornode_jobs_total", "Finished background jobs (by kind, outcome)");
    describe_histogram!("stornode_job_duration_seconds", "Background job duration (by kind)");

    // Scrubbing
    describe_counter!("stornode_scrub_bytes_total", "Bytes overwritten while scrubbing (by kind)");
    describe_counter!(
        "stornode_scrub_exceptions_total",
        "Snapshot COW exceptions scrubbed"
    );

    // Volume lifecycle
    describe_counter!("stornode_volume_created_total", "Volumes created (by source)");
    describe_counter!("stornode_volume_deleted_total", "Volumes removed after scrubbing");

    // External commands
    describe_counter!(
        "stornode_command_failures_total",
        "External commands exiting non-zero (by program)"
    );
}

pub fn record_lock_claim(outcome: &'static str) {
    counter!("stornode_lock_claims_total", "outcome" => outcome).increment(1);
}

pub fn set_jobs_running(count: usize) {
    gauge!("stornode_jobs_running").set(count as f64);
}

pub fn record_job_finished(kind: &str, outcome: &'static str, duration_secs: f64) {
    counter!("stornode_jobs_total", "kind" => kind.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("stornode_job_duration_seconds", "kind" => kind.to_string()).record(duration_secs);
}

pub fn record_scrub(kind: &'static str, bytes: u64, exceptions: u64) {
    counter!("stornode_scrub_bytes_total", "kind" => kind).increment(bytes);
    if exceptions > 0 {
        counter!("stornode_scrub_exceptions_total").increment(exceptions);
    }
}

pub fn record_volume_created(source: &'static str) {
    counter!("stornode_volume_created_total", "source" => source).increment(1);
}

pub fn record_volume_deleted() {
    counter!("stornode_volume_deleted_total").increment(1);
}

pub fn record_command_failure(program: &str) {
    counter!("stornode_command_failures_total", "program" => program.to_string()).increment(1);
}
