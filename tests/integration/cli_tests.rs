//! Integration tests for the `crawl` subcommand
//!
//! The compiled binary is run the way the controller launches it, against
//! a wiremock listing.

use crate::crawl_tests::{count_lines, mount_group};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use sumi_pipeline::output::group_file_path;
use tempfile::TempDir;
use tokio::process::Command;
use wiremock::MockServer;

const BINARY: &str = env!("CARGO_BIN_EXE_sumi-pipeline");

/// Writes a crawl config in the provider's JSON format
fn create_test_config_file(dir: &TempDir, workers: u32, groups: &[&str]) -> PathBuf {
    let path = dir.path().join("crawl.json");
    let config = serde_json::json!({
        "max_workers": workers,
        "request_timeout": 5,
        "delay_between_offers_min": 0.1,
        "delay_between_offers_max": 0.2,
        "delay_between_pages_min": 0.5,
        "delay_between_pages_max": 0.5,
        "max_offers_per_brand": 2,
        "brands_to_scrape": groups,
    });
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn listing_template(server: &MockServer) -> String {
    format!("{}/osobowe/{{group}}?page={{page}}", server.uri())
}

fn combined_output(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

async fn run_crawl_binary(args: &[&str], env: &[(&str, &Path)], listing_url: Option<&str>) -> Output {
    let mut command = Command::new(BINARY);
    command
        .arg("crawl")
        .args(args)
        .env_remove("CRAWL_CONFIG_FILE")
        .env_remove("CRAWL_OUTPUT_DIR")
        .env_remove("CRAWL_LISTING_URL");
    for (key, value) in env {
        command.env(key, value);
    }
    if let Some(url) = listing_url {
        command.env("CRAWL_LISTING_URL", url);
    }
    command.output().await.unwrap()
}

#[tokio::test]
async fn test_crawl_command_writes_group_files() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "audi", &[&[1, 2, 3]], "2 grudnia 2025").await;

    let config = create_test_config_file(&dir, 1, &["audi"]);
    let output_dir = dir.path().join("out");
    let template = listing_template(&server);

    let output = run_crawl_binary(
        &[
            "--config",
            config.to_str().unwrap(),
            "--output-dir",
            output_dir.to_str().unwrap(),
            "--listing-url",
            &template,
        ],
        &[],
        None,
    )
    .await;

    let text = combined_output(&output);
    assert!(output.status.success(), "{}", text);
    assert_eq!(count_lines(&group_file_path(&output_dir, "audi")), 2);
    assert!(text.contains("Crawl Summary"));
    assert!(!text.contains('\u{1b}'), "log output carries escape codes");
}

#[tokio::test]
async fn test_crawl_command_reads_environment() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "bmw", &[&[4, 5]], "2 grudnia 2025").await;

    let config = create_test_config_file(&dir, 2, &["bmw"]);
    let output_dir = dir.path().join("env-out");
    let template = listing_template(&server);

    let output = run_crawl_binary(
        &[],
        &[
            ("CRAWL_CONFIG_FILE", config.as_path()),
            ("CRAWL_OUTPUT_DIR", output_dir.as_path()),
        ],
        Some(&template),
    )
    .await;

    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(count_lines(&group_file_path(&output_dir, "bmw")), 2);
}

#[tokio::test]
async fn test_crawl_command_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config_file(&dir, 0, &["audi"]);
    let output_dir = dir.path().join("out");

    let output = run_crawl_binary(
        &["--config", config.to_str().unwrap(), "--output-dir", output_dir.to_str().unwrap()],
        &[],
        None,
    )
    .await;

    assert!(!output.status.success());
    assert!(combined_output(&output).contains("max_workers"));
    assert!(!group_file_path(&output_dir, "audi").exists());
}

#[tokio::test]
async fn test_crawl_command_requires_config() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.json");
    let output_dir = dir.path().join("out");

    let output = run_crawl_binary(
        &["--config", missing.to_str().unwrap(), "--output-dir", output_dir.to_str().unwrap()],
        &[],
        None,
    )
    .await;
    assert!(!output.status.success());

    let output = run_crawl_binary(&["--output-dir", output_dir.to_str().unwrap()], &[], None).await;
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("CRAWL_CONFIG_FILE"));
}
