use std::{fs, process::Command};

fn write_config(name: &str, text: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("solarlink-{}-{}.toml", name, std::process::id()));
    fs::write(&path, text).expect("Failed to write config");
    path
}

/// `--check` accepts a valid configuration
#[test]
fn test_cli_check_valid_config() {
    let path = write_config(
        "valid",
        r#"
[[connection]]
name = "bench"
comms = "dummy"
echo = true

[[poller]]
name = "link"
connection = "bench"
request = "ping"
"#,
    );
    let output = Command::new(env!("CARGO_BIN_EXE_solarlink"))
        .arg("--config")
        .arg(&path)
        .arg("--check")
        .output()
        .expect("Failed to execute solarlink binary");
    let _ = fs::remove_file(&path);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("configuration OK"));
}

/// `--check` rejects a slave without its master
#[test]
fn test_cli_check_rejects_orphan_slave() {
    let path = write_config(
        "orphan",
        r#"
[[connection]]
name = "second"
comms = "shared"
role = "slave"
use_connection = "bus"
"#,
    );
    let output = Command::new(env!("CARGO_BIN_EXE_solarlink"))
        .arg("--config")
        .arg(&path)
        .arg("--check")
        .output()
        .expect("Failed to execute solarlink binary");
    let _ = fs::remove_file(&path);

    assert!(!output.status.success());
}
