//! Scenario: CLI config hash
//!
//! # Invariants under test
//!
//! 1. `kiln config-hash` prints a stable `config_hash=` line followed by the
//!    canonical JSON of the merged layers.
//! 2. Later layers override earlier ones.
//! 3. A literal access token in config is refused with its value redacted.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let p = dir.path().join(name);
    fs::write(&p, body).unwrap();
    p.to_string_lossy().to_string()
}

#[test]
fn config_hash_prints_merged_canonical_json() {
    let dir = tempfile::tempdir().unwrap();
    let base = write(
        &dir,
        "base.yaml",
        "upstream:\n  base_url: https://shop.example.com\nretry:\n  max_attempts: 3\n",
    );
    let over = write(&dir, "prod.yaml", "retry:\n  max_attempts: 5\n");

    let out = Command::cargo_bin("kiln")
        .unwrap()
        .current_dir(dir.path())
        .args(["config-hash", &base, &over])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("config_hash="))
        .stdout(predicate::str::contains(r#""max_attempts":5"#))
        .get_output()
        .stdout
        .clone();

    let again = Command::cargo_bin("kiln")
        .unwrap()
        .current_dir(dir.path())
        .args(["config-hash", &base, &over])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(out, again);
}

#[test]
fn literal_token_in_config_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write(
        &dir,
        "bad.yaml",
        "upstream:\n  access_token_env: shpat_0123456789abcdef\n",
    );

    Command::cargo_bin("kiln")
        .unwrap()
        .current_dir(dir.path())
        .args(["config-hash", &bad])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("shpat_0123456789abcdef").not());
}
