use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes the listening address, broker-wide limits and the policy applied
/// to every destination.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub policy: DestinationPolicy,
}

/// Configuration settings for the server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Broker-wide limits and sweep periods.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Directory of the sled store. `None` keeps everything in memory.
    pub data_dir: Option<String>,
    pub memory_limit_bytes: u64,
    pub store_limit_bytes: u64,
    pub gc_sweep_period_ms: u64,
    /// Zero means no cap.
    pub max_purged_destinations_per_sweep: usize,
    pub expire_sweep_period_ms: u64,
    pub log_level: String,
}

/// What a producer experiences when its destination is out of space.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlPolicy {
    /// Wait until space frees up (or `send_timeout_ms` elapses).
    Block,
    /// Fail the send immediately.
    Reject,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterVariant {
    Shared,
    Individual,
}

/// Parameters of the dead-letter strategy.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeadLetterPolicy {
    pub variant: DeadLetterVariant,
    pub shared_queue: String,
    pub queue_prefix: String,
    pub topic_prefix: String,
    pub use_queue_for_queue_messages: bool,
    pub use_queue_for_topic_messages: bool,
    pub destination_per_durable_subscriber: bool,
    pub process_expired: bool,
    pub process_non_persistent: bool,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            variant: DeadLetterVariant::Shared,
            shared_queue: "DLQ".to_string(),
            queue_prefix: "DLQ.Queue.".to_string(),
            topic_prefix: "DLQ.Topic.".to_string(),
            use_queue_for_queue_messages: true,
            use_queue_for_topic_messages: true,
            destination_per_durable_subscriber: false,
            process_expired: true,
            process_non_persistent: false,
        }
    }
}

/// Per-destination policy. The core treats every field as plain input.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DestinationPolicy {
    pub queue_prefetch: u32,
    pub topic_prefetch: u32,
    /// Memory limit of each destination. `None` inherits the broker limit.
    pub memory_limit_bytes: Option<u64>,
    pub max_redeliveries: u32,
    pub gc_inactive_destinations: bool,
    pub gc_inactive_after_ms: u64,
    pub cursor_high_watermark_percent: u8,
    pub cursor_low_watermark_percent: u8,
    pub cursor_batch_size: usize,
    pub flow_control: FlowControlPolicy,
    pub send_timeout_ms: Option<u64>,
    pub topic_pending_limit: Option<usize>,
    pub retroactive_recovery_count: usize,
    pub dead_letter: DeadLetterPolicy,
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            queue_prefetch: 1000,
            topic_prefetch: 32766,
            memory_limit_bytes: None,
            max_redeliveries: 6,
            gc_inactive_destinations: false,
            gc_inactive_after_ms: 60_000,
            cursor_high_watermark_percent: 70,
            cursor_low_watermark_percent: 50,
            cursor_batch_size: 200,
            flow_control: FlowControlPolicy::Block,
            send_timeout_ms: None,
            topic_pending_limit: None,
            retroactive_recovery_count: 0,
            dead_letter: DeadLetterPolicy::default(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub policy: Option<DestinationPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub data_dir: Option<String>,
    pub memory_limit_bytes: Option<u64>,
    pub store_limit_bytes: Option<u64>,
    pub gc_sweep_period_ms: Option<u64>,
    pub max_purged_destinations_per_sweep: Option<usize>,
    pub expire_sweep_period_ms: Option<u64>,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            policy: DestinationPolicy::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            memory_limit_bytes: 64 * 1024 * 1024,
            store_limit_bytes: 1024 * 1024 * 1024,
            gc_sweep_period_ms: 30_000,
            max_purged_destinations_per_sweep: 0,
            expire_sweep_period_ms: 30_000,
            log_level: "info".to_string(),
        }
    }
}
