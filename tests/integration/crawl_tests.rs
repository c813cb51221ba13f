//! Integration tests for the crawler
//!
//! These tests use wiremock to serve listing and detail pages and run
//! whole groups end-to-end into a temporary output directory.

use chrono::NaiveDate;
use std::fs;
use std::time::{Duration, SystemTime};
use sumi_pipeline::config::CrawlConfig;
use sumi_pipeline::crawler::{Crawler, RetryPolicy};
use sumi_pipeline::output::{count_items_since, group_file_path};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a crawl config without delays for the given groups
fn create_test_config(groups: &[&str], cap: Option<usize>) -> CrawlConfig {
    CrawlConfig {
        worker_count: 2,
        request_timeout_secs: 5,
        offer_delay_min: 0.0,
        offer_delay_max: 0.0,
        page_delay_min: 0.0,
        page_delay_max: 0.0,
        max_items_per_group: cap,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        publication_date_from: None,
        publication_date_to: None,
    }
}

fn create_test_crawler(server: &MockServer, config: CrawlConfig, dir: &TempDir) -> Crawler {
    let template = format!("{}/osobowe/{{group}}?page={{page}}", server.uri());
    Crawler::new(config, template, dir.path())
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(1))
}

fn detail_path(group: &str, id: u32) -> String {
    format!("/osobowe/oferta/{}-car-{}.html", group, id)
}

fn listing_html(group: &str, ids: &[u32]) -> String {
    let articles: String = ids
        .iter()
        .map(|id| {
            format!(
                r#"<article data-id="{}"><a href="{}">Car {}</a></article>"#,
                id,
                detail_path(group, *id),
                id
            )
        })
        .collect();
    format!("<html><body>{}</body></html>", articles)
}

fn detail_html(published: &str) -> String {
    format!(
        r#"<html><body>
            <span class="offer-price__number">10 000</span>
            <div class="ooa-vtq6wn"><p>{}</p></div>
        </body></html>"#,
        published
    )
}

/// Mounts listing pages (1-based) and one detail page per item
pub(crate) async fn mount_group(server: &MockServer, group: &str, pages: &[&[u32]], published: &str) {
    for (index, ids) in pages.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(format!("/osobowe/{}", group)))
            .and(query_param("page", (index + 1).to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_html(group, ids)))
            .mount(server)
            .await;

        for id in ids.iter() {
            Mock::given(method("GET"))
                .and(path(detail_path(group, *id)))
                .respond_with(ResponseTemplate::new(200).set_body_string(detail_html(published)))
                .mount(server)
                .await;
        }
    }
}

pub(crate) fn count_lines(path: &std::path::Path) -> usize {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

#[tokio::test]
async fn test_cap_stops_mid_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "audi", &[&[1, 2], &[3, 4], &[5, 6]], "2 grudnia 2025").await;

    let crawler = create_test_crawler(&server, create_test_config(&["audi"], Some(5)), &dir);
    let result = crawler.crawl_group("audi".to_string()).await;

    assert_eq!(result.items.len(), 5);
    assert_eq!(result.processed, 5);
    assert!(result.error.is_none());

    let ids: Vec<&str> = result.items.iter().map(|i| i.external_id()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(count_lines(&group_file_path(dir.path(), "audi")), 5);
}

#[tokio::test]
async fn test_cap_reached_skips_next_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "bmw", &[&[1, 2]], "2 grudnia 2025").await;

    Mock::given(method("GET"))
        .and(path("/osobowe/bmw"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html("bmw", &[3])))
        .expect(0)
        .mount(&server)
        .await;

    let crawler = create_test_crawler(&server, create_test_config(&["bmw"], Some(2)), &dir);
    let result = crawler.crawl_group("bmw".to_string()).await;

    assert_eq!(result.items.len(), 2);
}

#[tokio::test]
async fn test_detail_fetch_recovers_after_retries() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path(detail_path("audi", 7)))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_group(&server, "audi", &[&[7]], "2 grudnia 2025").await;

    let crawler = create_test_crawler(&server, create_test_config(&["audi"], None), &dir)
        .with_retry_policy(RetryPolicy::immediate(3));
    let result = crawler.crawl_group("audi".to_string()).await;

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.fetched, 1);
    assert_eq!(result.items[0].get("price"), "10000");
}

#[tokio::test]
async fn test_failed_detail_is_skipped() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path(detail_path("audi", 1)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_group(&server, "audi", &[&[1, 2]], "2 grudnia 2025").await;

    let crawler = create_test_crawler(&server, create_test_config(&["audi"], None), &dir);
    let result = crawler.crawl_group("audi".to_string()).await;

    assert_eq!(result.processed, 2);
    assert_eq!(result.fetched, 1);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].external_id(), "2");
}

#[tokio::test]
async fn test_publication_date_filter() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "audi", &[&[1]], "2 grudnia 2025 13:26").await;

    // Page 2 carries an older item
    Mock::given(method("GET"))
        .and(path("/osobowe/audi"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_html("audi", &[2])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(detail_path("audi", 2)))
        .respond_with(ResponseTemplate::new(200).set_body_string(detail_html("5 stycznia 2024")))
        .mount(&server)
        .await;

    let mut config = create_test_config(&["audi"], None);
    config.publication_date_from = NaiveDate::from_ymd_opt(2025, 1, 1);
    config.publication_date_to = NaiveDate::from_ymd_opt(2025, 12, 31);

    let crawler = create_test_crawler(&server, config, &dir);
    let result = crawler.crawl_group("audi".to_string()).await;

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].publication_date(), "02.12.2025");
    assert_eq!(result.filtered_out, 1);
    assert_eq!(result.fetched, 2);
}

#[tokio::test]
async fn test_empty_group_writes_no_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/osobowe/fiat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
        .mount(&server)
        .await;

    let crawler = create_test_crawler(&server, create_test_config(&["fiat"], None), &dir);
    let result = crawler.crawl_group("fiat".to_string()).await;

    assert!(result.items.is_empty());
    assert!(result.error.is_none());
    assert!(!group_file_path(dir.path(), "fiat").exists());
}

#[tokio::test]
async fn test_write_failure_is_isolated_to_group() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_group(&server, "audi", &[&[1, 2]], "2 grudnia 2025").await;
    mount_group(&server, "bmw", &[&[3, 4]], "2 grudnia 2025").await;

    // A directory where the bmw file should go makes its write fail
    fs::create_dir_all(group_file_path(dir.path(), "bmw")).unwrap();

    let started = SystemTime::now();
    let crawler = create_test_crawler(&server, create_test_config(&["audi", "bmw"], None), &dir);
    let results = crawler.run().await;

    assert_eq!(results.len(), 2);

    let bmw = &results["bmw"];
    assert!(bmw.error.is_some());
    assert_eq!(bmw.items.len(), 2);

    let audi = &results["audi"];
    assert!(audi.error.is_none());
    assert_eq!(audi.items.len(), 2);
    assert_eq!(count_lines(&group_file_path(dir.path(), "audi")), 2);

    let count = count_items_since(
        dir.path(),
        &["audi".to_string(), "bmw".to_string()],
        started,
        Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(count.groups, vec!["audi".to_string()]);
    assert_eq!(count.total, 2);
}
