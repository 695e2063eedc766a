//! Client-side counters
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op. The embedding application decides whether and how to
//! export them.
//!
//! - `kms_client_requests_total` (counter): label `status`
//! - `kms_client_replays_total` (counter): label `outcome`
//! - `kms_refresh_total` (counter): label `outcome`
//! - `kms_refresh_joined_total` (counter)

/// Record a dispatched API request (original or replay) by response status.
pub fn record_request(status: u16) {
    metrics::counter!("kms_client_requests_total", "status" => status.to_string()).increment(1);
}

/// Record the outcome of a replay after refresh: "ok", "unauthorized" or
/// "error".
pub fn record_replay(outcome: &'static str) {
    metrics::counter!("kms_client_replays_total", "outcome" => outcome).increment(1);
}

/// Record a finished refresh network call: "success", "rejected", "timeout"
/// or "superseded".
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("kms_refresh_total", "outcome" => outcome).increment(1);
}

/// Record a caller that attached to an already running refresh.
pub fn record_refresh_joined() {
    metrics::counter!("kms_refresh_joined_total").increment(1);
}
