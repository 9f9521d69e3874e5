//! Loading app model files from disk.

use app_model::{Manifest, ReadinessCheck};
use apphost_config::{ConfigError, EnvVars, parse_file};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_and_plan() {
    let file = write_config(
        r#"
version: "1.0"
name: todo
resources:
  cache:
    type: container
    image: redis:7
    endpoints:
      - name: tcp
        target_port: 6379
    connection_string: "{host}:{port}"
  api:
    type: project
    binary: ${TODO_API:-./api}
    endpoints:
      - name: http
        scheme: http
        env: PORT
    references: [cache]
    wait_for: [cache]
  web:
    type: project
    binary: ./web
    references: [api]
"#,
    );

    let config = parse_file(file.path()).unwrap();
    let model = config.to_model_with(&EnvVars::default()).unwrap();

    let batches = model.graph().layers().unwrap();
    assert_eq!(
        batches,
        vec![
            vec!["cache".to_string()],
            vec!["api".to_string()],
            vec!["web".to_string()],
        ]
    );

    let api = model.resource("api").unwrap();
    assert_eq!(api.effective_readiness(), ReadinessCheck::Tcp { endpoint: None });

    let manifest = Manifest::from_model(&model).unwrap();
    let json = manifest.to_json_pretty().unwrap();
    assert!(json.contains("\"cache\""));
    assert!(json.contains("{cache.bindings.tcp.host}"));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = parse_file(dir.path().join("apphost.yaml"));
    assert!(matches!(result, Err(ConfigError::Read(_))));
}

#[test]
fn test_invalid_yaml() {
    let file = write_config("version: \"1.0\"\nresources: [not, a, map]\n");
    assert!(matches!(parse_file(file.path()), Err(ConfigError::Yaml(_))));
}

#[test]
fn test_unknown_setting_is_rejected() {
    let file = write_config(
        r#"
version: "1.0"
settings:
  startup_timout: 10
resources: {}
"#,
    );
    assert!(matches!(parse_file(file.path()), Err(ConfigError::Yaml(_))));
}

#[test]
fn test_batches_follow_file_order() {
    let file = write_config(
        r#"
version: "1.0"
resources:
  pg:
    type: container
    image: postgres:16
    endpoints:
      - name: tcp
        target_port: 5432
    connection_string: "Host={host};Port={port}"
  orders:
    type: database
    server: pg
  worker:
    type: project
    binary: ./worker
    wait_for: [pg]
"#,
    );

    let model = parse_file(file.path())
        .unwrap()
        .to_model_with(&EnvVars::default())
        .unwrap();

    let names: Vec<&str> = model.resources().map(|node| node.name()).collect();
    assert_eq!(names, vec!["pg", "orders", "worker"]);
    assert_eq!(
        model.graph().layers().unwrap(),
        vec![
            vec!["pg".to_string()],
            vec!["orders".to_string(), "worker".to_string()],
        ]
    );
}
