//! CLI integration tests

use std::path::Path;
use std::process::{Command, Output};

/// Run fgctl with an isolated home directory so no user config is read
fn fgctl(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fgctl"))
        .args(args)
        .env("HOME", home)
        .env_remove("FGCTL_API_URL")
        .output()
        .expect("Failed to execute fgctl")
}

/// 100 flood flows from one source mixed with 100 ordinary flows
fn write_labelled_csv(path: &Path) {
    let mut csv = String::from(
        "Flow ID,Src IP,Src Port,Dst IP,Dst Port,Protocol,Timestamp,Flow Duration,Tot Fwd Pkts,Label\n",
    );
    for i in 0..200u32 {
        let src_port = 40_000 + (i * 37) % 20_000;
        if i % 2 == 0 {
            csv.push_str(&format!(
                "f{i},10.9.9.9,{src_port},192.168.1.10,80,6,t,{},{},ddos\n",
                10 + i % 50,
                400 + i % 50
            ));
        } else {
            csv.push_str(&format!(
                "f{i},10.0.{}.{},{src_port},192.168.1.10,80,6,t,{},{},Benign\n",
                i % 7,
                1 + i % 200,
                50_000 + (i * 13) % 10_000,
                2 + i % 10
            ));
        }
    }
    std::fs::write(path, csv).unwrap();
}

#[test]
fn test_cli_help() {
    let home = tempfile::tempdir().unwrap();
    let output = fgctl(home.path(), &["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("FlowGuard"), "Should show app name");
    for command in ["train", "score", "offenders", "bans", "status"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
    assert!(stdout.contains("--api-url"));
    assert!(stdout.contains("--format"));
}

#[test]
fn test_cli_version() {
    let home = tempfile::tempdir().unwrap();
    let output = fgctl(home.path(), &["--version"]);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("fgctl"));
}

#[test]
fn test_offenders_help() {
    let home = tempfile::tempdir().unwrap();
    let output = fgctl(home.path(), &["offenders", "--help"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--banned"));
}

#[test]
fn test_train_then_score() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("flows.csv");
    let model_dir = work.path().join("models");
    write_labelled_csv(&input);

    let output = fgctl(
        home.path(),
        &[
            "--format",
            "json",
            "train",
            "--input",
            input.to_str().unwrap(),
            "--model-dir",
            model_dir.to_str().unwrap(),
            "--name",
            "test.json",
        ],
    );
    assert!(
        output.status.success(),
        "train failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["flows"], 200);
    assert_eq!(summary["feature_width"], 5);
    assert!(summary["validation_accuracy"].as_f64().unwrap() >= 0.9);
    assert!(model_dir.join("test.json").exists());

    let output = fgctl(
        home.path(),
        &[
            "--format",
            "json",
            "score",
            "--input",
            input.to_str().unwrap(),
            "--model-dir",
            model_dir.to_str().unwrap(),
            "--name",
            "test.json",
        ],
    );
    assert!(
        output.status.success(),
        "score failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["flows"], 200);
    assert_eq!(report["results"].as_array().unwrap().len(), 200);
    assert!(report["attacks_by_source"]["10.9.9.9"].as_u64().unwrap() >= 90);
}

#[test]
fn test_train_requires_labels() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("unlabelled.csv");
    std::fs::write(
        &input,
        "Src IP,Src Port,Dst IP,Dst Port,Protocol,Flow Duration\n10.0.0.1,1,10.0.0.2,22,6,5\n",
    )
    .unwrap();

    let output = fgctl(
        home.path(),
        &[
            "train",
            "--input",
            input.to_str().unwrap(),
            "--model-dir",
            work.path().to_str().unwrap(),
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Label"));
}

#[test]
fn test_score_with_missing_model_fails() {
    let home = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("flows.csv");
    write_labelled_csv(&input);

    let output = fgctl(
        home.path(),
        &[
            "score",
            "--input",
            input.to_str().unwrap(),
            "--model-dir",
            work.path().to_str().unwrap(),
            "--name",
            "absent.json",
        ],
    );
    assert!(!output.status.success());
}

#[test]
fn test_status_reports_unreachable_agent() {
    let home = tempfile::tempdir().unwrap();
    let output = fgctl(home.path(), &["--api-url", "http://127.0.0.1:9", "status"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to reach agent"));
}
