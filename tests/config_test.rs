//! Configuration file layering on top of compiled defaults.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use tasker_lanes::config::{
    BrokerProviderKind, ConfigLoader, ConfigurationError, IsolationMode, LanesConfig,
};
use tasker_lanes::routing::{ChannelRegistry, RoutingError};

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("tasker-lanes")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_file_overrides_only_the_keys_it_sets() {
    let file = toml_file(
        r#"
queue_name = "eventos"

[broker]
host = "rabbit.internal"

[worker]
prefetch_count = 2
max_deliveries = 5

[supervisor]
isolation = "in_process"
shutdown_grace_seconds = 9
"#,
    );

    let config = ConfigLoader::load_file(file.path()).unwrap();
    let defaults = LanesConfig::default();

    assert_eq!(config.broker.host, "rabbit.internal");
    assert_eq!(config.broker.port, defaults.broker.port);
    assert_eq!(config.worker.prefetch_count, 2);
    assert_eq!(config.worker.max_deliveries, 5);
    assert_eq!(config.worker.reconnect_delay(), Duration::from_secs(5));
    assert_eq!(config.supervisor.isolation, IsolationMode::InProcess);
    assert_eq!(config.supervisor.shutdown_grace(), Duration::from_secs(9));
    assert_eq!(config.channels, defaults.channels);
    assert_eq!(config.routing, defaults.routing);
}

#[test]
fn test_file_routing_table_replaces_the_defaults() {
    let file = toml_file(
        r#"
[routing]
hemograma = "fluxo_exames"
raio_x = "fluxo_exames"
tomografia = "fluxo_clinico"
"#,
    );

    let config = ConfigLoader::load_file(file.path()).unwrap();
    let registry = ChannelRegistry::from_config(&config);

    assert_eq!(registry.resolve("tomografia").unwrap().name(), "fluxo_clinico");
    assert_eq!(registry.resolve("hemograma").unwrap().name(), "fluxo_exames");
    assert_eq!(registry.routes().len(), 3);

    // Routes left out of the file are gone, channels are untouched
    assert!(matches!(
        registry.resolve("consulta"),
        Err(RoutingError::UnmappedTaskType { .. })
    ));
    assert_eq!(config.channels, LanesConfig::default().channels);
    assert!(config.warnings().is_empty());
}

#[test]
fn test_empty_routing_table_keeps_the_defaults() {
    let file = toml_file("[routing]\n\n[broker]\nport = 5680\n");

    let config = ConfigLoader::load_file(file.path()).unwrap();
    assert_eq!(config.broker.port, 5680);
    assert_eq!(config.routing, LanesConfig::default().routing);
}

#[test]
fn test_route_to_unlisted_channel_loads_with_a_warning() {
    let file = toml_file(
        r#"
[routing]
alta = "fluxo_aposentado"
"#,
    );

    let config = ConfigLoader::load_file(file.path()).unwrap();
    let warnings = config.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("fluxo_aposentado"));

    let registry = ChannelRegistry::from_config(&config);
    assert_eq!(registry.drifted_routes(), vec![("alta", "fluxo_aposentado")]);
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigLoader::load_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigurationError::FileNotFound { .. }));
}

#[test]
fn test_config_path_can_come_from_the_environment() {
    let file = toml_file("[broker]\nport = 5680\n");
    let config = ConfigLoader::new()
        .with_env_vars(vars(&[(
            "TASKER_LANES_CONFIG",
            file.path().to_str().unwrap(),
        )]))
        .load()
        .unwrap();
    assert_eq!(config.broker.port, 5680);
}

#[test]
fn test_environment_outranks_file_and_legacy_outranks_both() {
    let file = toml_file(
        r#"
[broker]
host = "from-file"

[worker]
reconnect_delay_ms = 1500
prefetch_count = 3
"#,
    );

    let config = ConfigLoader::new()
        .with_file(file.path())
        .with_env_vars(vars(&[
            ("TASKER_LANES_BROKER__HOST", "from-env"),
            ("TASKER_LANES_WORKER__RECONNECT_DELAY_MS", "2500"),
            ("WORKER_RECONNECT_DELAY", "7"),
        ]))
        .load()
        .unwrap();

    assert_eq!(config.broker.host, "from-env");
    assert_eq!(config.worker.reconnect_delay_ms, 7000);
    assert_eq!(config.worker.prefetch_count, 3);
}

#[test]
fn test_process_isolation_rejects_in_memory_broker() {
    let file = toml_file(
        r#"
[broker]
provider = "in_memory"

[supervisor]
isolation = "process"
"#,
    );

    let err = ConfigLoader::load_file(file.path()).unwrap_err();
    match err {
        ConfigurationError::Validation { errors } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("in_memory"));
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn test_every_violation_is_collected() {
    let file = toml_file(
        r#"
queue_name = ""

[worker]
prefetch_count = 0
poll_interval_ms = 0
"#,
    );

    let err = ConfigLoader::load_file(file.path()).unwrap_err();
    let ConfigurationError::Validation { errors } = err else {
        panic!("expected validation error");
    };
    assert_eq!(errors.len(), 3);
}

#[test]
fn test_in_memory_broker_with_in_process_workers_is_valid() {
    let file = toml_file(
        r#"
[broker]
provider = "in_memory"

[supervisor]
isolation = "in_process"
"#,
    );

    let config = ConfigLoader::load_file(file.path()).unwrap();
    assert_eq!(config.broker.provider, BrokerProviderKind::InMemory);
}
