use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn sheetbridge_bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sheetbridge"))
}

fn cli(home: &Path) -> AssertCommand {
    let mut cmd = AssertCommand::new(sheetbridge_bin_path());
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

fn run_json(home: &Path, args: &[&str]) -> Value {
    let output = Command::new(sheetbridge_bin_path())
        .env("HOME", home)
        .env("USERPROFILE", home)
        .args(args)
        .output()
        .expect("run sheetbridge");
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

struct DaemonProcess {
    child: Child,
    binary: PathBuf,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(binary: PathBuf, home: PathBuf) -> Self {
        let child = Command::new(&binary)
            .env("HOME", &home)
            .env("USERPROFILE", &home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");

        Self {
            child,
            binary,
            home,
        }
    }

    fn stop(&mut self) {
        let _ = Command::new(&self.binary)
            .env("HOME", &self.home)
            .env("USERPROFILE", &self.home)
            .args(["daemon", "stop"])
            .status();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_running(binary: &Path, home: &Path) -> bool {
    let output = match Command::new(binary)
        .env("HOME", home)
        .env("USERPROFILE", home)
        .args(["daemon", "status"])
        .output()
    {
        Ok(output) => output,
        Err(_) => return false,
    };
    if !output.status.success() {
        return false;
    }

    let Ok(value) = serde_json::from_slice::<Value>(&output.stdout) else {
        return false;
    };
    value
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn init_writes_default_config_once() {
    let home = TempDir::new().expect("home");

    cli(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default config"));
    assert!(home.path().join(".sheetbridge/config.yaml").exists());

    cli(home.path())
        .args(["init", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Using existing config"))
        .stdout(predicate::str::contains("\"default_collection\": \"orders\""));
}

#[test]
fn daemon_status_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");
    let value = run_json(home.path(), &["daemon", "status"]);
    assert_eq!(value["running"], json!(false));
}

#[test]
fn write_without_daemon_suggests_starting_it() {
    let home = TempDir::new().expect("home");
    cli(home.path())
        .args(["write", "DH001", "--field", "status=shipped"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sheetbridge daemon start"));
}

#[test]
fn write_rejects_malformed_field() {
    let home = TempDir::new().expect("home");
    cli(home.path())
        .args(["write", "DH001", "--field", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn write_flush_poll_and_sheet_edit_through_daemon() {
    let home = TempDir::new().expect("home");
    let binary = sheetbridge_bin_path();
    let mut daemon = DaemonProcess::start(binary.clone(), home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(
            &binary,
            home.path()
        )),
        "daemon did not report running state in time",
    );

    let written = run_json(
        home.path(),
        &["write", "DH001", "--field", "status=Shipped", "--field", "quantity=2"],
    );
    assert_eq!(written["queued"], json!(true));

    cli(home.path()).arg("flush").assert().success();

    let sheet_path = home.path().join(".sheetbridge/sheets/orders.json");
    assert!(
        wait_until(Duration::from_secs(5), || {
            std::fs::read_to_string(&sheet_path)
                .map(|content| content.contains("\"Status\": \"shipped\""))
                .unwrap_or(false)
        }),
        "client write was not mirrored to the sheet file",
    );

    let polled = run_json(home.path(), &["poll", "--json"]);
    let changes = polled["changes"].as_array().expect("changes");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["external"], json!(false));
    let after = polled["last_version"].as_u64().expect("last_version");

    // An edit to a different row is picked up by the watcher once the
    // mirror write has left the debounce window.
    sleep(Duration::from_millis(700));
    let mut sheet: Value =
        serde_json::from_str(&std::fs::read_to_string(&sheet_path).expect("read sheet"))
            .expect("sheet json");
    sheet["rows"]["DH002"] = json!({"Status": "Open", "Quantity": 5});
    std::fs::write(&sheet_path, serde_json::to_string_pretty(&sheet).expect("encode"))
        .expect("edit sheet");

    let since = after.to_string();
    let picked_up = wait_until(Duration::from_secs(10), || {
        let polled = run_json(home.path(), &["poll", "--since", &since, "--json"]);
        polled["changes"]
            .as_array()
            .map(|changes| {
                changes
                    .iter()
                    .any(|c| c["key"] == json!("DH002") && c["external"] == json!(true))
            })
            .unwrap_or(false)
    });
    assert!(picked_up, "sheet edit was not ingested by the daemon");

    cli(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("orders"));

    daemon.stop();
}
