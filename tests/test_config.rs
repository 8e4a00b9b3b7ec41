use std::time::Duration;

use serial_test::serial;
use warden::config::{CONFIG_ENV, Config, LISTEN_ENV};

fn clear_env() {
    unsafe {
        std::env::remove_var(LISTEN_ENV);
        std::env::remove_var(CONFIG_ENV);
    }
}

#[test]
#[serial]
fn test_config_default_address() {
    // When LISTEN env var is not set, should use default
    clear_env();
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.server.io_loops, 1);
    assert_eq!(cfg.server.keep_alive_timeout(), Duration::from_secs(30));
    assert_eq!(cfg.server.poll_timeout(), Duration::from_millis(250));
    assert_eq!(cfg.server.read_buffer_size, 1536);
}

#[test]
#[serial]
fn test_config_custom_address_from_env() {
    // When LISTEN env var is set, should use it
    clear_env();
    unsafe {
        std::env::set_var(LISTEN_ENV, "0.0.0.0:3000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");
    clear_env();
}

#[test]
#[serial]
fn test_config_clone() {
    clear_env();
    let cfg1 = Config::load().unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.server.listen_addr, cfg2.server.listen_addr);
}

#[test]
#[serial]
fn test_config_file_with_listen_override() {
    clear_env();
    let path = std::env::temp_dir().join(format!("warden-config-{}.yaml", std::process::id()));
    std::fs::write(
        &path,
        "server:\n  listen_addr: 127.0.0.1:9000\n  io_loops: 4\n  keep_alive_timeout_ms: 500\n",
    )
    .unwrap();

    unsafe {
        std::env::set_var(CONFIG_ENV, &path);
    }
    let from_file = Config::load().unwrap();
    assert_eq!(from_file.server.listen_addr, "127.0.0.1:9000");
    assert_eq!(from_file.server.io_loops, 4);
    assert_eq!(from_file.server.keep_alive_timeout(), Duration::from_millis(500));
    assert_eq!(from_file.server.poll_timeout_ms, 250);

    unsafe {
        std::env::set_var(LISTEN_ENV, "127.0.0.1:9001");
    }
    let overridden = Config::load().unwrap();
    assert_eq!(overridden.server.listen_addr, "127.0.0.1:9001");
    assert_eq!(overridden.server.io_loops, 4);

    clear_env();
    std::fs::remove_file(&path).unwrap();
}

#[test]
#[serial]
fn test_config_missing_file_is_an_error() {
    clear_env();
    unsafe {
        std::env::set_var(CONFIG_ENV, "/nonexistent/warden.yaml");
    }
    assert!(Config::load().is_err());
    clear_env();
}

#[test]
fn test_config_from_yaml_partial() {
    let cfg = Config::from_yaml("server:\n  poll_timeout_ms: 10\n").unwrap();

    assert_eq!(cfg.server.poll_timeout(), Duration::from_millis(10));
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
}

#[test]
fn test_config_rejects_zero_loops() {
    assert!(Config::from_yaml("server:\n  io_loops: 0\n").is_err());
}

#[test]
fn test_config_rejects_zero_poll_timeout() {
    let err = Config::from_yaml("server:\n  poll_timeout_ms: 0\n").unwrap_err();

    assert!(err.to_string().contains("poll_timeout_ms"));
}

#[test]
fn test_config_protocol_settings() {
    let cfg = Config::from_yaml("server:\n  keep_alive_timeout_ms: 1500\n  read_buffer_size: 64\n").unwrap();
    let settings = cfg.server.protocol_settings();

    assert_eq!(settings.keep_alive_timeout, Duration::from_millis(1500));
    assert_eq!(settings.read_buffer_size, 64);
}
