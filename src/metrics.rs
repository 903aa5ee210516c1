//! Prometheus metrics for the TON bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::types::{Direction, JobStatus, PacketKind};

lazy_static! {
    // Block processing metrics
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "tonbridge_relayer_blocks_scanned_total",
        "Total number of source blocks scanned",
        &["direction"]
    ).unwrap();

    pub static ref CHAIN_HEIGHT: GaugeVec = register_gauge_vec!(
        "tonbridge_relayer_chain_height",
        "Latest source chain height observed",
        &["direction"]
    ).unwrap();

    pub static ref OFFSET: GaugeVec = register_gauge_vec!(
        "tonbridge_relayer_offset",
        "Last durably saved offset",
        &["direction"]
    ).unwrap();

    // Packet and job metrics
    pub static ref PACKETS_DETECTED: CounterVec = register_counter_vec!(
        "tonbridge_relayer_packets_detected_total",
        "Total number of bridge packets extracted",
        &["direction", "kind"]
    ).unwrap();

    pub static ref JOBS_FINISHED: CounterVec = register_counter_vec!(
        "tonbridge_relayer_jobs_finished_total",
        "Jobs reaching a terminal state",
        &["direction", "status"]
    ).unwrap();

    pub static ref JOBS_IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "tonbridge_relayer_jobs_in_flight",
        "Jobs queued or being processed by the pipeline",
        &["direction"]
    ).unwrap();

    // Confirmation latency
    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "tonbridge_relayer_confirmation_latency_seconds",
        "Time from broadcast to confirmed sequence advance",
        &["message"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 90.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "tonbridge_relayer_errors_total",
        "Total number of errors",
        &["direction", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_OFFSET_FAILURES: GaugeVec = register_gauge_vec!(
        "tonbridge_relayer_consecutive_offset_failures",
        "Consecutive failed offset saves",
        &["direction"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "tonbridge_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref WALLET_BALANCE: Gauge = register_gauge!(
        "tonbridge_relayer_wallet_balance_nano",
        "Relayer wallet balance on the destination chain"
    ).unwrap();

    pub static ref WALLET_BALANCE_LOW: Gauge = register_gauge!(
        "tonbridge_relayer_wallet_balance_low",
        "1 when the relayer wallet is below the configured minimum"
    ).unwrap();
}

pub fn record_blocks_scanned(direction: Direction, blocks: u64) {
    BLOCKS_SCANNED
        .with_label_values(&[direction.as_str()])
        .inc_by(blocks as f64);
}

pub fn set_chain_height(direction: Direction, height: u64) {
    CHAIN_HEIGHT
        .with_label_values(&[direction.as_str()])
        .set(height as f64);
}

pub fn set_offset(direction: Direction, height: u64) {
    OFFSET
        .with_label_values(&[direction.as_str()])
        .set(height as f64);
}

/// Record a packet extracted
pub fn record_packet_detected(direction: Direction, kind: PacketKind) {
    PACKETS_DETECTED
        .with_label_values(&[direction.as_str(), kind.as_str()])
        .inc();
}

/// Record a job reaching `Confirmed` or `Failed`
pub fn record_job_finished(direction: Direction, status: JobStatus) {
    JOBS_FINISHED
        .with_label_values(&[direction.as_str(), status.as_str()])
        .inc();
}

pub fn inc_jobs_in_flight(direction: Direction) {
    JOBS_IN_FLIGHT.with_label_values(&[direction.as_str()]).inc();
}

pub fn dec_jobs_in_flight(direction: Direction) {
    JOBS_IN_FLIGHT.with_label_values(&[direction.as_str()]).dec();
}

/// Record confirmation latency
pub fn record_confirmation_latency(message: &str, seconds: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[message])
        .observe(seconds);
}

/// Record an error
pub fn record_error(direction: Direction, error_type: &str) {
    ERRORS
        .with_label_values(&[direction.as_str(), error_type])
        .inc();
}

pub fn set_consecutive_offset_failures(direction: Direction, count: u32) {
    CONSECUTIVE_OFFSET_FAILURES
        .with_label_values(&[direction.as_str()])
        .set(count as f64);
}

/// Record the wallet balance and whether it is below `minimum`
pub fn set_wallet_balance(balance: u128, minimum: u128) {
    WALLET_BALANCE.set(balance as f64);
    WALLET_BALANCE_LOW.set(if balance < minimum { 1.0 } else { 0.0 });
}
