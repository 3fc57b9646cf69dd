use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{Stream, StreamExt, stream};
use nexrad_dl::{
    BatchReport, DirectorySink, DownloadCoordinator, HttpFetcher, ProgressTracker, dedup_links,
    extract,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG takes priority over -v/-q
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let target = if args.prompts_to_stderr() {
        args.resolve_target(&mut io::stdin().lock(), &mut io::stderr())?
    } else {
        args.resolve_target(&mut io::stdin().lock(), &mut io::stdout())?
    };

    let fetcher = HttpFetcher::new(&args.fetcher_config())?;

    info!(url = %target.source_url, "fetching download links");
    let page = fetcher
        .fetch_page(&target.source_url)
        .await
        .context("Failed to fetch the inventory page")?;

    let mut links = extract(&page, &target.source_url);
    if args.dedup {
        links = dedup_links(links);
    }
    info!(links = links.len(), "found download links");

    let sink = Arc::new(DirectorySink::create(&target.output_dir)?);
    let tracker = Arc::new(if args.quiet {
        ProgressTracker::hidden(links.len())
    } else {
        ProgressTracker::new(links.len())
    });
    let coordinator = DownloadCoordinator::new(Arc::new(fetcher), usize::from(args.concurrency))?;

    let cancel = CancellationToken::new();
    let signals = Box::pin(stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    }));
    let watcher = watch_interrupts(signals, cancel.clone(), Arc::clone(&tracker));
    tokio::spawn(async move {
        if watcher.await {
            std::process::exit(130);
        }
    });

    let outcome = coordinator
        .run_until_cancelled(links, sink, tracker, cancel)
        .await?;

    let output_dir = target.output_dir.display().to_string();

    if args.json {
        let report = BatchReport::new(&target.source_url, &output_dir, outcome);
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    println!("Total files downloaded: {}", outcome.success_count());
    if outcome.failure_count() > 0 {
        println!("Failed: {} of {}", outcome.failure_count(), outcome.total());
    }
    println!("Files saved in: {output_dir}");

    Ok(())
}

/// Cancels the batch on the first interrupt. Returns `true` when a second
/// interrupt arrives and the caller should abort.
async fn watch_interrupts<S>(
    mut signals: S,
    cancel: CancellationToken,
    tracker: Arc<ProgressTracker>,
) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    tracker.suspend(|| warn!("interrupted, finishing downloads in flight (Ctrl-C again to abort)"));
    cancel.cancel();

    if signals.next().await.is_none() {
        return false;
    }
    tracker.suspend(|| warn!("interrupted again, aborting"));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_interrupt_cancels_without_aborting() {
        let cancel = CancellationToken::new();
        let tracker = Arc::new(ProgressTracker::hidden(1));

        let abort = watch_interrupts(stream::iter(vec![()]), cancel.clone(), tracker).await;

        assert!(!abort);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn second_interrupt_requests_abort() {
        let cancel = CancellationToken::new();
        let tracker = Arc::new(ProgressTracker::hidden(1));

        let abort = watch_interrupts(stream::iter(vec![(), ()]), cancel.clone(), tracker).await;

        assert!(abort);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn no_interrupt_leaves_batch_running() {
        let cancel = CancellationToken::new();
        let tracker = Arc::new(ProgressTracker::hidden(1));

        let abort = watch_interrupts(stream::empty::<()>(), cancel.clone(), tracker).await;

        assert!(!abort);
        assert!(!cancel.is_cancelled());
    }
}
