use std::sync::Arc;

use anyhow::Context;

use mail_archiver::config::ArchiverConfig;
use mail_archiver::session::{CancelToken, SessionCoordinator, SessionOutcome};
use mail_archiver::source::{ImapTransport, check_source};
use mail_archiver::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let check_only = args.iter().any(|a| a == "--check");
    let config_path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .or_else(|| std::env::var("MAIL_ARCHIVER_CONFIG").ok())
        .context("Usage: mail-archiver <config.toml> [--check] (or set MAIL_ARCHIVER_CONFIG)")?;

    let config = ArchiverConfig::from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    eprintln!("📬 Mail Archiver v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {config_path}");
    eprintln!("   Sources: {}", config.sources.len());

    let transport = Arc::new(ImapTransport::new(config.connect_timeout()));

    if check_only {
        let mut failures = 0;
        for source in &config.sources {
            match check_source(transport.as_ref(), source).await {
                Ok(count) => println!("{}: ok, {count} unseen message(s)", source.name),
                Err(e) => {
                    failures += 1;
                    println!("{}: {} ({e})", source.name, e.label());
                }
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} source(s) failed the connection check");
        }
        return Ok(());
    }

    let store = Arc::new(MemoryStore::new());
    let coordinator = SessionCoordinator::new(config, store, transport);

    let cancel = CancelToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancellation requested, finishing current message ...");
            signal_cancel.cancel();
        }
    });

    match coordinator.run(&cancel).await {
        SessionOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        SessionOutcome::AlreadyRunning => {
            anyhow::bail!("An ingestion session is already in progress")
        }
        SessionOutcome::Failed(e) => Err(e).context("Ingestion session failed"),
    }
}
