//! Drives the `netlab` binary end to end.

use std::path::PathBuf;
use std::process::Command;

fn netlab() -> Command {
    Command::new(env!("CARGO_BIN_EXE_netlab"))
}

fn scenario(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../scenarios")
        .join(name)
}

#[test]
fn check_accepts_shipped_scenarios() {
    for name in ["bulksend-changelink.toml", "ldos-pulse.toml"] {
        let out = netlab().arg("check").arg(scenario(name)).output().unwrap();
        assert!(
            out.status.success(),
            "{name}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        assert!(String::from_utf8_lossy(&out.stdout).contains(": ok ("));
    }
}

#[test]
fn check_rejects_unknown_variant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    let text = std::fs::read_to_string(scenario("bulksend-changelink.toml"))
        .unwrap()
        .replace("variant = \"NewReno\"", "variant = \"Westwood\"");
    std::fs::write(&path, text).unwrap();

    let out = netlab().arg("check").arg(&path).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown transport variant"));
}

#[test]
fn missing_config_is_reported() {
    let out = netlab()
        .args(["check", "/nonexistent/netlab.toml"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("failed to read"));
}

#[test]
fn run_writes_sinks_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let out = netlab()
        .arg("run")
        .arg(scenario("bulksend-changelink.toml"))
        .arg("--out")
        .arg(dir.path())
        .args(["--run", "3", "--stop-time", "4s"])
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Flow 1 ("));

    let json = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    let report: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(report["name"], "bulksend-changelink");
    assert_eq!(report["run"], 3);
    assert_eq!(report["elapsed_s"], 4.0);

    assert!(dir.path().join("report.txt").exists());
    assert!(dir.path().join("phy-rx-drop-run3.txt").exists());
    let rx = std::fs::read_to_string(dir.path().join("server-rx-data-3-run3.txt")).unwrap();
    assert!(rx.lines().count() > 0);
    assert!(dir.path().join("flow1-throughput-run3.txt").exists());
    assert!(!dir.path().join("flow2-throughput-run3.txt").exists());
}

#[test]
fn run_rejects_zero_stop_time_override() {
    let dir = tempfile::tempdir().unwrap();
    let out = netlab()
        .arg("run")
        .arg(scenario("bulksend-changelink.toml"))
        .arg("--out")
        .arg(dir.path())
        .args(["--stop-time", "0s"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid stop_time: must be positive"));
    assert!(!dir.path().join("report.json").exists());
}
