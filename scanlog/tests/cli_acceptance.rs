use scanlog_core::{Database, ScanStatus};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("scanlog/scans.db")
    }

    fn open_db(&self) -> Database {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        db
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("scanlog");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str], server: Option<&str>) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("scanlog"));
    let mut command = Command::new(bin_path);

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env("SCANLOG_DEVICE_ID", "test-dock")
        .env_remove("SCANLOG_API_BASE_URL")
        .env_remove("API_BASE_URL")
        .env_remove("RUST_LOG");

    if let Some(url) = server {
        command.env("SCANLOG_API_BASE_URL", url);
    }

    command
        .output()
        .unwrap_or_else(|e| panic!("failed to execute scanlog: {e}"))
}

fn render(args: &[&str], output: &Output) -> String {
    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "scanlog {rendered_args}\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn assert_success(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args, None);
    if !output.status.success() {
        panic!("command failed\n{}", render(args, &output));
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_failure(env: &CliTestEnv, args: &[&str], server: Option<&str>) -> String {
    let output = run_bin(env, args, server);
    if output.status.success() {
        panic!("command should have failed\n{}", render(args, &output));
    }
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn capture_persists_pending_scans() {
    let env = CliTestEnv::new();

    let stdout = assert_success(&env, &["capture", "3017620422003", "-t", "ean13"]);
    assert!(stdout.contains("Captured"), "unexpected output:\n{stdout}");
    assert!(stdout.contains("Pending sync: 1"));

    assert_success(&env, &["capture", "PKG-0002", "--session", "round-4"]);

    let db = env.open_db();
    let counts = db.count_by_status().expect("failed to count");
    assert_eq!(counts.pending, 2);

    let records = db.list_recent(10).expect("failed to list");
    assert!(records.iter().all(|r| r.payload.device_id == "test-dock"));

    let status = assert_success(&env, &["status"]);
    assert!(status.contains("Device:    test-dock"));
    assert!(status.contains("Pending sync: 2"));
    assert!(status.contains("Last sync: never"));
}

#[test]
fn refused_capture_leaves_store_unchanged() {
    let env = CliTestEnv::new();
    assert_success(&env, &["capture", "PKG-0001"]);

    let stderr = assert_failure(&env, &["capture", "   "], None);
    assert!(stderr.contains("empty content"), "unexpected stderr:\n{stderr}");

    let stderr = assert_failure(&env, &["capture", "123", "-t", "morse"], None);
    assert!(stderr.contains("unknown symbology"), "unexpected stderr:\n{stderr}");

    assert_eq!(env.open_db().count_records().expect("failed to count"), 1);
}

#[test]
fn list_json_outputs_one_record_per_line() {
    let env = CliTestEnv::new();
    assert_success(&env, &["capture", "PKG-A"]);
    assert_success(&env, &["capture", "PKG-B"]);

    let stdout = assert_success(&env, &["list", "--json"]);
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("invalid JSON line"))
        .collect();

    assert_eq!(records.len(), 2);
    // Newest first
    assert_eq!(records[0]["payload"]["content"], "PKG-B");
    assert_eq!(records[1]["payload"]["content"], "PKG-A");
    assert_eq!(records[0]["status"], "pending");

    let stdout = assert_success(&env, &["list", "--status", "confirmed"]);
    assert!(stdout.contains("No scans."));
}

#[test]
fn sync_requires_configured_server() {
    let env = CliTestEnv::new();
    assert_success(&env, &["capture", "PKG-1"]);

    let stderr = assert_failure(&env, &["sync"], None);
    assert!(stderr.contains("api.base_url"), "unexpected stderr:\n{stderr}");

    env.write_config("[api]\nbase_url = \"ftp://example.com\"\n");
    let stderr = assert_failure(&env, &["status"], None);
    assert!(stderr.contains("http(s)"), "unexpected stderr:\n{stderr}");
}

#[test]
fn sync_while_unreachable_keeps_scans_pending() {
    let env = CliTestEnv::new();
    env.write_config("[api]\ntimeout_secs = 2\n");
    assert_success(&env, &["capture", "PKG-1"]);

    let args = ["sync"];
    let output = run_bin(&env, &args, Some("http://127.0.0.1:9"));
    assert!(output.status.success(), "{}", render(&args, &output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Server unreachable"), "unexpected output:\n{stdout}");
    assert!(stdout.contains("Pending sync: 1"));

    let db = env.open_db();
    let records = db.list_recent(1).expect("failed to list");
    assert_eq!(records[0].status, ScanStatus::Pending);
    assert_eq!(records[0].attempts, 0);
}

#[test]
fn resolve_moves_records_needing_attention() {
    let env = CliTestEnv::new();
    assert_success(&env, &["capture", "PKG-1"]);
    assert_success(&env, &["capture", "PKG-2"]);
    assert_success(&env, &["capture", "PKG-3"]);

    let (conflicted, failed, pending) = {
        let db = env.open_db();
        let batch = db.claim_pending_batch(2).expect("failed to claim");
        db.update_status(&batch[0].id, ScanStatus::Conflicted, Some("item already delivered"))
            .expect("failed to mark conflicted");
        db.update_status(&batch[1].id, ScanStatus::Failed, Some("unknown parcel"))
            .expect("failed to mark failed");
        let pending = db.get_pending().expect("failed to list pending");
        (batch[0].id.clone(), batch[1].id.clone(), pending[0].id.clone())
    };

    let stdout = assert_success(&env, &["list", "--attention"]);
    assert!(stdout.contains("item already delivered"), "unexpected output:\n{stdout}");
    assert!(stdout.contains("unknown parcel"));

    let status = assert_success(&env, &["status"]);
    assert!(status.contains("2 scan(s) need attention"));

    let stdout = assert_success(&env, &["resolve", &conflicted, "--accept"]);
    assert!(stdout.contains("marked confirmed"));
    let stdout = assert_success(&env, &["resolve", &failed, "--retry"]);
    assert!(stdout.contains("queued for sync"));

    // Pending scans need no decision; unknown ids and a missing action are errors
    assert_failure(&env, &["resolve", &pending, "--retry"], None);
    assert_failure(&env, &["resolve", "no-such-scan", "--retry"], None);
    assert_failure(&env, &["resolve", &pending], None);

    let db = env.open_db();
    assert_eq!(db.get(&conflicted).unwrap().unwrap().status, ScanStatus::Confirmed);
    assert_eq!(db.get(&failed).unwrap().unwrap().status, ScanStatus::Pending);
}

#[test]
fn purge_removes_only_confirmed_scans() {
    let env = CliTestEnv::new();
    assert_success(&env, &["capture", "PKG-1"]);
    assert_success(&env, &["capture", "PKG-2"]);

    {
        let db = env.open_db();
        let batch = db.claim_pending_batch(1).expect("failed to claim");
        db.update_status(&batch[0].id, ScanStatus::Confirmed, None)
            .expect("failed to confirm");
    }

    // Default retention keeps fresh confirmations
    let stdout = assert_success(&env, &["purge"]);
    assert!(stdout.contains("Purged 0"));

    let stdout = assert_success(&env, &["purge", "--older-than-hours", "0"]);
    assert!(stdout.contains("Purged 1"), "unexpected output:\n{stdout}");

    let counts = env.open_db().count_by_status().expect("failed to count");
    assert_eq!(counts.confirmed, 0);
    assert_eq!(counts.pending, 1);
}
