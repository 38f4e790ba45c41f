//! Prometheus metrics collection for meshsync.
//!
//! Tracks replication traffic, dial outcomes, evictions and the size of the
//! overlay as seen from this node.
//!
//! - `meshsync_messages_sent_total{kind}` / `meshsync_messages_received_total{kind}`
//! - `meshsync_bytes_sent_total{peer}` / `meshsync_bytes_received_total{peer}`
//! - `meshsync_dials_total{result}` - Dial attempts by outcome
//! - `meshsync_evictions_total` - Peers evicted after repeated dial failures
//! - `meshsync_outbound_peers` / `meshsync_inbound_peers` - Current connections

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Protocol messages written, by message kind.
pub static MESSAGES_SENT: OnceLock<IntCounterVec> = OnceLock::new();

/// Protocol messages read, by message kind.
pub static MESSAGES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Bytes written to each peer.
pub static BYTES_SENT: OnceLock<IntCounterVec> = OnceLock::new();

/// Bytes read from each peer.
pub static BYTES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Dial attempts by result (`ok`, `failed`, `cancelled`).
pub static DIALS: OnceLock<IntCounterVec> = OnceLock::new();

/// Peers removed from the ring after repeated dial failures.
pub static EVICTIONS: OnceLock<IntCounter> = OnceLock::new();

/// Sessions that ended with an unexpected error, by error code.
pub static SESSION_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Currently connected outbound peers.
pub static OUTBOUND_PEERS: OnceLock<IntGauge> = OnceLock::new();

/// Currently connected inbound peers.
pub static INBOUND_PEERS: OnceLock<IntGauge> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded. Recording
/// before `init()` is a silent no-op.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    register!(MESSAGES_SENT, IntCounterVec::new(Opts::new("meshsync_messages_sent_total", "Protocol messages sent by kind"), &["kind"]));
    register!(MESSAGES_RECEIVED, IntCounterVec::new(Opts::new("meshsync_messages_received_total", "Protocol messages received by kind"), &["kind"]));
    register!(BYTES_SENT, IntCounterVec::new(Opts::new("meshsync_bytes_sent_total", "Bytes sent to peers"), &["peer"]));
    register!(BYTES_RECEIVED, IntCounterVec::new(Opts::new("meshsync_bytes_received_total", "Bytes received from peers"), &["peer"]));
    register!(DIALS, IntCounterVec::new(Opts::new("meshsync_dials_total", "Dial attempts by result"), &["result"]));
    register!(EVICTIONS, IntCounter::new("meshsync_evictions_total", "Peers evicted after repeated dial failures"));
    register!(SESSION_ERRORS, IntCounterVec::new(Opts::new("meshsync_session_errors_total", "Sessions ended by unexpected errors"), &["error"]));
    register!(OUTBOUND_PEERS, IntGauge::new("meshsync_outbound_peers", "Connected outbound peers"));
    register!(INBOUND_PEERS, IntGauge::new("meshsync_inbound_peers", "Connected inbound peers"));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for replication metric updates
// ============================================================================

fn inc_vec(metric: &OnceLock<IntCounterVec>, label: &str, by: u64) {
    if let Some(c) = metric.get() {
        c.with_label_values(&[label]).inc_by(by);
    }
}

#[inline]
pub fn record_message_sent(kind: &str) {
    inc_vec(&MESSAGES_SENT, kind, 1);
}

#[inline]
pub fn record_message_received(kind: &str) {
    inc_vec(&MESSAGES_RECEIVED, kind, 1);
}

#[inline]
pub fn record_bytes_sent(peer: &str, bytes: u64) {
    if bytes > 0 {
        inc_vec(&BYTES_SENT, peer, bytes);
    }
}

#[inline]
pub fn record_bytes_received(peer: &str, bytes: u64) {
    if bytes > 0 {
        inc_vec(&BYTES_RECEIVED, peer, bytes);
    }
}

#[inline]
pub fn record_dial(result: &str) {
    inc_vec(&DIALS, result, 1);
}

#[inline]
pub fn record_eviction() {
    if let Some(c) = EVICTIONS.get() {
        c.inc();
    }
}

#[inline]
pub fn record_session_error(code: &str) {
    inc_vec(&SESSION_ERRORS, code, 1);
}

#[inline]
pub fn set_outbound_peers(count: usize) {
    if let Some(g) = OUTBOUND_PEERS.get() {
        g.set(count as i64);
    }
}

#[inline]
pub fn set_inbound_peers(count: usize) {
    if let Some(g) = INBOUND_PEERS.get() {
        g.set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        init();

        record_message_sent("delta");
        record_dial("ok");
        record_eviction();
        set_outbound_peers(3);

        let output = gather_metrics();
        assert!(output.contains("meshsync_messages_sent_total"));
        assert!(output.contains("meshsync_dials_total"));
        assert!(output.contains("meshsync_outbound_peers"));
    }
}
