/// Smoke-test for the full crawl pipeline on a real browser.
///
/// Launches headless Chromium, extracts the heading and links of
/// <https://example.com> with a DOM policy, and saves them under a
/// temporary directory (or `GLEANER_OUT` when set). The session is
/// persisted next to the output so a second run reuses its cookies.
///
/// Run with:
///   cargo run -p gleaner-client --example crawl_smoke --features browser
use std::path::PathBuf;

use gleaner_client::{ChromiumDriver, ReqwestFetcherFactory};
use gleaner_core::pipeline::{CrawlOutcome, CrawlPipeline, CrawlRequest};
use gleaner_core::policy::CrawlPolicy;
use gleaner_core::session::SessionSnapshot;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gleaner_core=debug".into()),
        )
        .init();

    let tmp = tempfile::tempdir()?;
    let out = std::env::var("GLEANER_OUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| tmp.path().to_path_buf());
    let session_file = out.join("session.json");

    let policy = CrawlPolicy::from_value(json!({
        "extractor": {
            "type": "dom",
            "fields": [
                { "name": "title", "selector": "h1" },
                { "name": "link", "selector": "a", "attribute": "href", "absolute": true }
            ]
        },
        "wait": { "selector": "h1", "condition": "visible", "timeout_sec": 10 },
        "normalization": [
            { "source": "payload.title", "kind": "text", "name_template": "{section}_{item_index}_title" },
            { "source": "payload.link", "kind": "text", "name_template": "{section}_{item_index}_link" }
        ],
        "storage": {
            "targets": { "text": out.join("texts") }
        },
        "retries": 1,
        "run_timeout_sec": 60,
        "session_file": &session_file
    }))?;

    println!("Launching headless browser…");
    let session = SessionSnapshot::load_or_default(&session_file)?;
    let driver = ChromiumDriver::launch(session).await?;

    let pipeline = CrawlPipeline::new(policy, driver, ReqwestFetcherFactory::default());
    let outcome = pipeline
        .run(CrawlRequest::new("https://example.com", "example"))
        .await;

    match outcome {
        CrawlOutcome::Success(report) => {
            println!(
                "OK: {} page(s), {} attempt(s), {} artifact(s) saved",
                report.pages,
                report.attempts,
                report.summary.succeeded()
            );
            for artifact in report.summary.flatten() {
                println!("  {:?} -> {:?}", artifact.kind, artifact.path);
            }
            anyhow::ensure!(
                !report.summary["text"].is_empty(),
                "Expected at least one text artifact"
            );
        }
        CrawlOutcome::Failure(failure) => {
            anyhow::bail!(
                "crawl failed in {} after {} attempt(s): {}",
                failure.stage,
                failure.attempts,
                failure.error
            );
        }
    }
    Ok(())
}
