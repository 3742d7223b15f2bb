use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("surveydata").expect("binary builds");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("export"));
}

#[test]
fn sync_with_missing_config_file_fails() {
    let mut cmd = Command::cargo_bin("surveydata").expect("binary builds");
    cmd.args(["sync", "--config", "/definitely/not/here.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn export_writes_csv_from_a_desktop_export() {
    let dir = tempfile::tempdir().expect("tempdir");
    let export_file = dir.path().join("form_WIDE.csv");
    std::fs::write(&export_file, "KEY,age,name\nuuid:2,7,grace\nuuid:1,5,ada\n")
        .expect("write export fixture");

    let config_file = dir.path().join("config.yaml");
    std::fs::write(
        &config_file,
        format!(
            "platform:\n  type: surveycto\n  server: myserver\n  form_id: f\nstorage:\n  type: surveycto_export\n  export_file: {}\n",
            export_file.display()
        ),
    )
    .expect("write config fixture");

    let output_file = dir.path().join("out.csv");
    let mut cmd = Command::cargo_bin("surveydata").expect("binary builds");
    cmd.env("SURVEYCTO_USERNAME", "user@example.org")
        .env("SURVEYCTO_PASSWORD", "secret")
        .args([
            "export",
            "--config",
            config_file.to_str().unwrap(),
            "--output",
            output_file.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 2 submission(s)"));

    let written = std::fs::read_to_string(&output_file).expect("output exists");
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("KEY,age,name"));
    // Rows come back sorted by submission ID.
    assert!(lines.next().unwrap().starts_with("uuid:1"));
    assert!(lines.next().unwrap().starts_with("uuid:2"));
}

#[test]
fn export_requires_an_output_path() {
    let mut cmd = Command::cargo_bin("surveydata").expect("binary builds");
    cmd.args(["export", "--config", "whatever.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--output"));
}
