/// Smoke-test for `ChromiumSessions`.
///
/// Launches a headless Chromium session and renders <https://example.com>
/// plus a synthetic listing page in the same session.
///
/// Run with:
///   cargo run -p lotwatch-client --example browser_smoke --features browser
use std::time::Duration;

use lotwatch_client::{BrowserSession, ChromiumSessions, SessionProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let sessions = ChromiumSessions::new(Duration::from_secs(30));
    let mut session = sessions.new_session(None).await?;

    let html = session.navigate("https://example.com").await?;
    anyhow::ensure!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );
    println!("OK: got {} bytes of rendered HTML", html.len());

    let listing = "data:text/html,<div data-listing-id='L1'><span class='price'>$1</span></div>";
    let html = session.navigate(listing).await?;
    anyhow::ensure!(html.contains("data-listing-id"), "listing card missing");
    println!("OK: synthetic listing page rendered");

    session.close().await;
    Ok(())
}
