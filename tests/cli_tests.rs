//! Command-line tests
//!
//! Run the built binary against a throwaway configuration directory.

use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn tunwatch(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tunwatch"))
        .args(args)
        .env("TUNWATCH_CONFIG_DIR", config_dir)
        .env("NO_COLOR", "1")
        .env_remove("SUDO_USER")
        .output()
        .expect("Failed to run tunwatch")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn write_config(config_dir: &Path, port: u16) {
    let config = format!(
        r#"
recommended_server = "local"

[probe]
max_retries_per_protocol = 1
handshake_timeout_ms = 1000

[[servers]]
id = "remote"
name = "Remote"
address = "remote.example.net"
port = 443

[[servers]]
id = "local"
name = "Loopback"
address = "127.0.0.1"
port = {port}
protocols = ["secondary_b", "primary"]
"#
    );
    std::fs::write(config_dir.join("config.toml"), config).unwrap();
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = tempdir().unwrap();
    let output = tunwatch(temp_dir.path(), &["--help"]);

    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["run", "probe", "protocol", "servers"] {
        assert!(text.contains(command), "help should mention {}", command);
    }
}

#[test]
fn test_servers_without_config() {
    let temp_dir = tempdir().unwrap();
    let output = tunwatch(temp_dir.path(), &["servers"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("No servers configured"));
}

#[test]
fn test_servers_marks_recommended() {
    let temp_dir = tempdir().unwrap();
    write_config(temp_dir.path(), 443);

    let output = tunwatch(temp_dir.path(), &["servers"]);

    assert!(output.status.success());
    let text = stdout(&output);
    let local = text
        .lines()
        .find(|line| line.contains("local"))
        .expect("local server listed");
    assert!(local.starts_with('*'), "line: {}", local);
    assert!(local.contains("secondary_b > primary"), "line: {}", local);
}

#[test]
fn test_protocol_set_get_clear() {
    let temp_dir = tempdir().unwrap();

    let output = tunwatch(temp_dir.path(), &["protocol", "set", "secondary_c"]);
    assert!(output.status.success());
    assert!(temp_dir.path().join("state.toml").exists());

    let output = tunwatch(temp_dir.path(), &["protocol", "get"]);
    assert!(stdout(&output).contains("Preferred protocol: secondary_c"));

    let output = tunwatch(temp_dir.path(), &["protocol", "clear"]);
    assert!(output.status.success());
    let output = tunwatch(temp_dir.path(), &["protocol", "get"]);
    assert!(stdout(&output).contains("No preferred protocol"));
}

#[test]
fn test_unknown_protocol_is_rejected() {
    let temp_dir = tempdir().unwrap();
    let output = tunwatch(temp_dir.path(), &["protocol", "set", "carrier_pigeon"]);

    assert!(!output.status.success());
    assert!(!temp_dir.path().join("state.toml").exists());
}

#[test]
fn test_probe_json_reports_winner_and_persists_it() {
    let temp_dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    write_config(temp_dir.path(), listener.local_addr().unwrap().port());

    let output = tunwatch(temp_dir.path(), &["probe", "--json"]);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"], "succeeded");
    assert_eq!(report["protocol"], "secondary_b");
    assert_eq!(report["log"].as_array().map(Vec::len), Some(1));

    let output = tunwatch(temp_dir.path(), &["protocol", "get"]);
    assert!(stdout(&output).contains("Preferred protocol: secondary_b"));
}

#[test]
fn test_unknown_server_exits_with_config_error() {
    let temp_dir = tempdir().unwrap();
    write_config(temp_dir.path(), 443);

    let output = tunwatch(temp_dir.path(), &["probe", "--server", "nowhere"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown server: nowhere"));
}

#[test]
fn test_run_without_driver_commands_fails() {
    let temp_dir = tempdir().unwrap();
    write_config(temp_dir.path(), 443);

    let output = tunwatch(temp_dir.path(), &["run"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[driver.commands]"));
}
