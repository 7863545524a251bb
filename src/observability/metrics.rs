//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the transport, inbox and dispatcher.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Message flow metrics (atomic for high frequency)
    messages_received: AtomicU64,
    messages_handled: AtomicU64,
    handler_failures: AtomicU64,
    handler_retries: AtomicU64,
    messages_dead_lettered: AtomicU64,
    messages_dropped: AtomicU64,
    acks_sent: AtomicU64,
    ack_failures: AtomicU64,

    // Inbox pressure
    inbox_depth: AtomicU64,
    inbox_high_watermark: AtomicU64,

    // Connection metrics
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_start_time: AtomicU64,
    current_epoch: AtomicU64,

    // Handler times (mutex protected for percentile math)
    handle_times: Mutex<Vec<u64>>, // in milliseconds

    // Lifecycle metrics
    consumer_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            messages_received: AtomicU64::new(0),
            messages_handled: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_retries: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            inbox_depth: AtomicU64::new(0),
            inbox_high_watermark: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            current_epoch: AtomicU64::new(0),
            handle_times: Mutex::new(Vec::new()),
            consumer_state: Mutex::new("created".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Message flow metrics
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        self.record_handle_time(duration);
    }

    pub fn record_handler_failure(&self, duration: Duration) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        self.record_handle_time(duration);
    }

    pub fn record_handler_retry(&self) {
        self.handler_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dead_lettered(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_handle_time(&self, duration: Duration) {
        if let Ok(mut times) = self.handle_times.lock() {
            times.push(duration.as_millis() as u64);

            // Limit to last 1000 measurements to prevent unbounded growth
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    // Inbox pressure
    pub fn inbox_depth_changed(&self, depth: usize) {
        let depth = depth as u64;
        self.inbox_depth.store(depth, Ordering::Relaxed);

        let current_max = self.inbox_high_watermark.load(Ordering::Relaxed);
        if depth > current_max {
            self.inbox_high_watermark.store(depth, Ordering::Relaxed);
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self, epoch: u32) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.current_epoch.store(epoch as u64, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_consumer_state(&self, state: &str) {
        if let Ok(mut current_state) = self.consumer_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    /// Calculate handle time statistics (pure function)
    fn calculate_handle_time_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(times) = self.handle_times.lock() {
            if times.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();

                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                let p50 = percentile(&sorted_times, 50.0);
                let p95 = percentile(&sorted_times, 95.0);
                let p99 = percentile(&sorted_times, 99.0);

                (avg, p50, p95, p99)
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if self.connected.load(Ordering::Relaxed) {
            let start_time = self.connection_start_time.load(Ordering::Relaxed);
            if start_time > 0 {
                now - start_time
            } else {
                0
            }
        } else {
            0
        }
    }

    fn current_consumer_state(&self) -> String {
        self.consumer_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_handle_time_ms, p50, p95, p99) = self.calculate_handle_time_statistics();

        MetricsSnapshot {
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                handled: self.messages_handled.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                handler_retries: self.handler_retries.load(Ordering::Relaxed),
                dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                acks_sent: self.acks_sent.load(Ordering::Relaxed),
                ack_failures: self.ack_failures.load(Ordering::Relaxed),
                avg_handle_time_ms,
                handle_time_p50_ms: p50,
                handle_time_p95_ms: p95,
                handle_time_p99_ms: p99,
            },
            inbox: InboxMetrics {
                depth: self.inbox_depth.load(Ordering::Relaxed),
                high_watermark: self.inbox_high_watermark.load(Ordering::Relaxed),
            },
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                current_epoch: self.current_epoch.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_consumer_state(),
                uptime_seconds: now - self.uptime_start.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.messages_received.store(0, Ordering::Relaxed);
        self.messages_handled.store(0, Ordering::Relaxed);
        self.handler_failures.store(0, Ordering::Relaxed);
        self.handler_retries.store(0, Ordering::Relaxed);
        self.messages_dead_lettered.store(0, Ordering::Relaxed);
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.acks_sent.store(0, Ordering::Relaxed);
        self.ack_failures.store(0, Ordering::Relaxed);
        self.inbox_depth.store(0, Ordering::Relaxed);
        self.inbox_high_watermark.store(0, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
        self.current_epoch.store(0, Ordering::Relaxed);
        self.state_transitions.store(0, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.handle_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.consumer_state.lock() {
            *state = "created".to_string();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub inbox: InboxMetrics,
    pub connection: ConnectionMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub handled: u64,
    pub handler_failures: u64,
    pub handler_retries: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub acks_sent: u64,
    pub ack_failures: u64,
    pub avg_handle_time_ms: f64,
    pub handle_time_p50_ms: f64,
    pub handle_time_p95_ms: f64,
    pub handle_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct InboxMetrics {
    pub depth: u64,
    pub high_watermark: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub current_epoch: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
