use super::settings::{DeadLetterVariant, FlowControlPolicy, Settings};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::io::Write;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.broker.data_dir, None);
    assert_eq!(settings.policy.max_redeliveries, 6);
    assert_eq!(settings.policy.queue_prefetch, 1000);
    assert_eq!(settings.policy.flow_control, FlowControlPolicy::Block);
    assert_eq!(settings.policy.dead_letter.variant, DeadLetterVariant::Shared);
    assert_eq!(settings.policy.dead_letter.shared_queue, "DLQ");
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("POPMQ_SERVER__PORT", Some("9191")),
            ("POPMQ_BROKER__MEMORY_LIMIT_BYTES", Some("4096")),
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings.server.port, 9191);
            assert_eq!(settings.server.host, "127.0.0.1");
            assert_eq!(settings.broker.memory_limit_bytes, 4096);
            assert_eq!(settings.broker.store_limit_bytes, 1024 * 1024 * 1024);
        },
    );
}

#[test]
#[serial]
fn test_policy_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[policy]
max_redeliveries = 2
flow_control = "reject"
gc_inactive_destinations = true

[policy.dead_letter]
variant = "individual"
destination_per_durable_subscriber = true
"#
    )
    .unwrap();

    let settings = load_config_from(path.to_str().unwrap()).unwrap();
    assert_eq!(settings.policy.max_redeliveries, 2);
    assert_eq!(settings.policy.flow_control, FlowControlPolicy::Reject);
    assert!(settings.policy.gc_inactive_destinations);
    // untouched fields keep their defaults
    assert_eq!(settings.policy.queue_prefetch, 1000);
    assert_eq!(settings.policy.dead_letter.variant, DeadLetterVariant::Individual);
    assert!(settings.policy.dead_letter.destination_per_durable_subscriber);
    assert_eq!(settings.policy.dead_letter.queue_prefix, "DLQ.Queue.");
}
