//! Bounded-concurrency batch downloads.
//!
//! [`DownloadCoordinator`] spawns one task per link and gates the
//! fetch-and-write step of each behind a semaphore, so at most
//! `concurrency` downloads hold network or storage I/O at once. Per-link
//! failures are converted into [`DownloadResult::Failed`] and never abort
//! the batch.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{DownloadError, SetupError};
use crate::fetcher::Fetcher;
use crate::models::{BatchOutcome, DownloadLink, DownloadResult};
use crate::progress::ProgressTracker;
use crate::storage::StorageSink;

/// Concurrency used by the CLI when none is given.
pub const DEFAULT_CONCURRENCY: usize = 20;

pub struct DownloadCoordinator {
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
}

impl DownloadCoordinator {
    /// # Errors
    ///
    /// Returns [`SetupError::InvalidConcurrency`] if `concurrency` is zero.
    pub fn new(fetcher: Arc<dyn Fetcher>, concurrency: usize) -> Result<Self, SetupError> {
        if concurrency < 1 {
            return Err(SetupError::InvalidConcurrency { value: concurrency });
        }
        Ok(Self {
            fetcher,
            concurrency,
        })
    }

    /// Downloads every link into `sink` and returns one result per link.
    ///
    /// `tracker` must have been created with `links.len()` as its total; it
    /// is closed before this returns.
    pub async fn run(
        &self,
        links: Vec<DownloadLink>,
        sink: Arc<dyn StorageSink>,
        tracker: Arc<ProgressTracker>,
    ) -> Result<BatchOutcome, SetupError> {
        self.run_until_cancelled(links, sink, tracker, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops admitting new downloads once
    /// `cancel` fires. Downloads already in flight finish normally; links that
    /// were never started settle as [`DownloadError::Cancelled`].
    #[instrument(skip_all, fields(links = links.len(), concurrency = self.concurrency))]
    pub async fn run_until_cancelled(
        &self,
        links: Vec<DownloadLink>,
        sink: Arc<dyn StorageSink>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome, SetupError> {
        if tracker.total() != links.len() {
            return Err(SetupError::TrackerMismatch {
                expected: tracker.total(),
                actual: links.len(),
            });
        }

        if links.is_empty() {
            tracker.close();
            info!("no links to download");
            return Ok(BatchOutcome::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles: Vec<(DownloadLink, JoinHandle<DownloadResult>)> =
            Vec::with_capacity(links.len());
        let mut results = Vec::with_capacity(links.len());

        let mut pending = links.into_iter();
        while let Some(link) = pending.next() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                let skipped: Vec<_> = std::iter::once(link).chain(pending.by_ref()).collect();
                warn!(skipped = skipped.len(), "batch cancelled, remaining links not started");
                for link in skipped {
                    let error = DownloadError::Cancelled {
                        url: link.as_str().to_string(),
                    };
                    tracker.record_completion(None);
                    results.push(DownloadResult::failed(&link, &error));
                }
                break;
            };

            let fetcher = Arc::clone(&self.fetcher);
            let sink = Arc::clone(&sink);
            let tracker = Arc::clone(&tracker);
            let task_link = link.clone();

            let handle = task::spawn(async move {
                let transferred = {
                    let _permit = permit;
                    transfer(&task_link, fetcher.as_ref(), sink.as_ref()).await
                };

                match transferred {
                    Ok((file_name, bytes)) => {
                        debug!(url = %task_link, file_name = %file_name, bytes, "saved");
                        tracker.record_completion(Some(&file_name));
                        DownloadResult::Saved {
                            url: task_link.as_str().to_string(),
                            file_name,
                            bytes,
                        }
                    }
                    Err(e) => {
                        tracker.suspend(|| warn!(url = %task_link, error = %e, "download failed"));
                        tracker.record_completion(None);
                        DownloadResult::failed(&task_link, &e)
                    }
                }
            });

            handles.push((link, handle));
        }

        debug!(tasks = handles.len(), "waiting for downloads to settle");

        let (spawned, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (link, joined) in spawned.iter().zip(join_all(handles).await) {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    // The task died before recording itself.
                    warn!(url = %link, error = %e, "download task panicked");
                    tracker.record_completion(None);
                    results.push(DownloadResult::Failed {
                        url: link.as_str().to_string(),
                        error: format!("task error: {e}"),
                    });
                }
            }
        }

        tracker.close();

        let outcome = BatchOutcome::new(results);
        info!(
            succeeded = outcome.success_count(),
            failed = outcome.failure_count(),
            total = outcome.total(),
            "batch complete"
        );
        Ok(outcome)
    }
}

/// Fetches one link and stores it under its derived file name.
async fn transfer(
    link: &DownloadLink,
    fetcher: &dyn Fetcher,
    sink: &dyn StorageSink,
) -> Result<(String, u64), DownloadError> {
    let body = fetcher.fetch(link.as_str()).await?;
    let file_name = link.file_name()?;
    let bytes = sink.write(&file_name, body).await?;
    Ok((file_name, bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;

    /// Serves bodies from a map after a delay, tracking how many fetches
    /// overlap.
    #[derive(Default)]
    struct MockFetcher {
        bodies: HashMap<String, Result<&'static [u8], u16>>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        panic_on: Option<String>,
    }

    impl MockFetcher {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn serve(mut self, url: &str, body: &'static [u8]) -> Self {
            self.bodies.insert(url.to_string(), Ok(body));
            self
        }

        fn fail(mut self, url: &str, status: u16) -> Self {
            self.bodies.insert(url.to_string(), Err(status));
            self
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.as_deref() == Some(url) {
                panic!("fetcher exploded");
            }

            match self.bodies.get(url) {
                Some(Ok(body)) => Ok(Bytes::from_static(*body)),
                Some(Err(status)) => Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: *status,
                }),
                None => Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    /// Records writes in memory.
    #[derive(Default)]
    struct MemorySink {
        files: Mutex<HashMap<String, Vec<u8>>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl StorageSink for MemorySink {
        async fn write(&self, file_name: &str, bytes: Bytes) -> Result<u64, DownloadError> {
            if self.reject.as_deref() == Some(file_name) {
                return Err(DownloadError::io(
                    file_name,
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                ));
            }
            self.files
                .lock()
                .unwrap()
                .insert(file_name.to_string(), bytes.to_vec());
            Ok(bytes.len() as u64)
        }
    }

    fn links(urls: &[&str]) -> Vec<DownloadLink> {
        urls.iter().copied().map(DownloadLink::from).collect()
    }

    fn numbered(n: usize) -> (MockFetcher, Vec<DownloadLink>) {
        let mut fetcher = MockFetcher::new(Duration::from_millis(20));
        let mut urls = Vec::new();
        for i in 0..n {
            let url = format!("https://data.example.com/KHTX/file_{i:03}");
            fetcher = fetcher.serve(&url, b"radar");
            urls.push(DownloadLink::new(url));
        }
        (fetcher, urls)
    }

    async fn run_batch(
        fetcher: Arc<MockFetcher>,
        links: Vec<DownloadLink>,
        concurrency: usize,
    ) -> (BatchOutcome, Arc<ProgressTracker>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let tracker = Arc::new(ProgressTracker::hidden(links.len()));
        let coordinator = DownloadCoordinator::new(fetcher, concurrency).unwrap();
        let outcome = coordinator
            .run(links, sink.clone(), Arc::clone(&tracker))
            .await
            .unwrap();
        (outcome, tracker, sink)
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(MockFetcher::default());
        let err = DownloadCoordinator::new(fetcher, 0).err().unwrap();
        assert!(matches!(err, SetupError::InvalidConcurrency { value: 0 }));
    }

    #[tokio::test]
    async fn empty_batch_returns_empty_outcome_and_closes_tracker() {
        let fetcher = Arc::new(MockFetcher::default());
        let (outcome, tracker, sink) = run_batch(Arc::clone(&fetcher), Vec::new(), 4).await;

        assert!(outcome.is_empty());
        assert_eq!(tracker.completed(), 0);
        assert!(tracker.is_closed());
        assert!(sink.files.lock().unwrap().is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tracker_sized_for_other_batch_is_rejected() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(MockFetcher::default());
        let coordinator = DownloadCoordinator::new(fetcher, 2).unwrap();
        let tracker = Arc::new(ProgressTracker::hidden(5));

        let err = coordinator
            .run(links(&["https://x/a"]), Arc::new(MemorySink::default()), tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::TrackerMismatch { expected: 5, actual: 1 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_successes_are_saved_and_counted() {
        let (fetcher, urls) = numbered(12);
        let (outcome, tracker, sink) = run_batch(Arc::new(fetcher), urls, 4).await;

        assert_eq!(outcome.total(), 12);
        assert_eq!(outcome.success_count(), 12);
        assert_eq!(tracker.completed(), 12);
        assert_eq!(tracker.excess(), 0);
        assert!(tracker.is_closed());
        assert_eq!(sink.files.lock().unwrap().len(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_fetches_never_exceed_cap() {
        let (fetcher, urls) = numbered(30);
        let fetcher = Arc::new(fetcher);
        let (outcome, _, _) = run_batch(Arc::clone(&fetcher), urls, 5).await;

        assert_eq!(outcome.success_count(), 30);
        assert!(fetcher.peak() <= 5, "peak {} exceeded cap", fetcher.peak());
        assert!(fetcher.peak() > 1, "downloads never overlapped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cap_of_one_downloads_strictly_serially() {
        let (fetcher, urls) = numbered(6);
        let fetcher = Arc::new(fetcher);
        let (outcome, tracker, _) = run_batch(Arc::clone(&fetcher), urls, 1).await;

        assert_eq!(outcome.success_count(), 6);
        assert_eq!(fetcher.peak(), 1);
        assert_eq!(tracker.completed(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn middle_failure_is_isolated() {
        let fetcher = MockFetcher::new(Duration::from_millis(5))
            .serve("https://x/A.gz", b"aaa")
            .fail("https://x/B.gz", 500)
            .serve("https://x/C.gz", b"c");
        let (outcome, tracker, sink) = run_batch(
            Arc::new(fetcher),
            links(&["https://x/A.gz", "https://x/B.gz", "https://x/C.gz"]),
            2,
        )
        .await;

        let saved: HashSet<_> = outcome.file_names().into_iter().collect();
        assert_eq!(saved, HashSet::from(["A.gz", "C.gz"]));
        assert_eq!(outcome.success_count(), 2);
        assert_eq!(outcome.failure_count(), 1);
        assert_eq!(tracker.completed(), 3);
        assert_eq!(tracker.status().split(' ').next(), Some("3/3"));

        let failed: Vec<_> = outcome.failures().map(DownloadResult::url).collect();
        assert_eq!(failed, vec!["https://x/B.gz"]);
        assert_eq!(sink.files.lock().unwrap()["A.gz"], b"aaa");
    }

    #[tokio::test]
    async fn write_and_naming_failures_are_isolated() {
        let fetcher = MockFetcher::new(Duration::ZERO)
            .serve("https://x/ok", b"1")
            .serve("https://x/locked", b"2")
            .serve("https://x/dir/", b"3");
        let sink = Arc::new(MemorySink {
            reject: Some("locked".to_string()),
            ..MemorySink::default()
        });
        let tracker = Arc::new(ProgressTracker::hidden(3));
        let coordinator = DownloadCoordinator::new(Arc::new(fetcher), 3).unwrap();

        let outcome = coordinator
            .run(
                links(&["https://x/ok", "https://x/locked", "https://x/dir/"]),
                sink,
                Arc::clone(&tracker),
            )
            .await
            .unwrap();

        assert_eq!(outcome.file_names(), vec!["ok"]);
        assert_eq!(outcome.failure_count(), 2);
        assert_eq!(tracker.completed(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_links_are_each_attempted() {
        let fetcher = MockFetcher::new(Duration::from_millis(5)).serve("https://x/same", b"s");
        let fetcher = Arc::new(fetcher);
        let (outcome, tracker, sink) = run_batch(
            Arc::clone(&fetcher),
            links(&["https://x/same", "https://x/same"]),
            2,
        )
        .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.file_names(), vec!["same", "same"]);
        assert_eq!(tracker.completed(), 2);
        assert_eq!(sink.files.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_task_still_settles() {
        let mut fetcher = MockFetcher::new(Duration::ZERO)
            .serve("https://x/fine", b"ok")
            .serve("https://x/boom", b"never");
        fetcher.panic_on = Some("https://x/boom".to_string());

        let (outcome, tracker, _) = run_batch(
            Arc::new(fetcher),
            links(&["https://x/fine", "https://x/boom"]),
            2,
        )
        .await;

        assert_eq!(outcome.total(), 2);
        assert_eq!(outcome.file_names(), vec!["fine"]);
        assert_eq!(tracker.completed(), 2);
        assert_eq!(tracker.excess(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rerun_yields_same_outcome_size() {
        let (fetcher, urls) = numbered(8);
        let fetcher = Arc::new(fetcher);

        let (first, _, _) = run_batch(Arc::clone(&fetcher), urls.clone(), 3).await;
        let (second, _, _) = run_batch(fetcher, urls, 3).await;

        assert_eq!(first.success_count(), second.success_count());
        assert_eq!(first.total(), second.total());
    }

    #[tokio::test]
    async fn cancelled_before_start_settles_every_link() {
        let (fetcher, urls) = numbered(4);
        let fetcher = Arc::new(fetcher);
        let coordinator = DownloadCoordinator::new(fetcher.clone(), 2).unwrap();
        let tracker = Arc::new(ProgressTracker::hidden(4));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = coordinator
            .run_until_cancelled(urls, Arc::new(MemorySink::default()), Arc::clone(&tracker), cancel)
            .await
            .unwrap();

        assert_eq!(outcome.total(), 4);
        assert_eq!(outcome.success_count(), 0);
        assert_eq!(tracker.completed(), 4);
        assert!(tracker.is_closed());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_mid_batch_lets_in_flight_finish() {
        let (fetcher, urls) = numbered(10);
        let fetcher = Arc::new(MockFetcher {
            delay: Duration::from_millis(100),
            ..fetcher
        });
        let coordinator = DownloadCoordinator::new(fetcher.clone(), 2).unwrap();
        let tracker = Arc::new(ProgressTracker::hidden(10));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = coordinator
            .run_until_cancelled(urls, Arc::new(MemorySink::default()), Arc::clone(&tracker), cancel)
            .await
            .unwrap();

        assert_eq!(outcome.total(), 10);
        assert_eq!(outcome.success_count(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completed(), 10);
        assert!(
            outcome
                .failures()
                .all(|r| matches!(r, DownloadResult::Failed { error, .. } if error.starts_with("cancelled")))
        );
    }
}
