//! Concurrent downloader for NEXRAD archive files listed on the NOAA
//! bulk data inventory page.

pub mod downloader;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod models;
pub mod progress;
pub mod storage;

pub use downloader::{DEFAULT_CONCURRENCY, DownloadCoordinator};
pub use error::{DownloadError, QueryError, SetupError};
pub use extract::{dedup_links, extract};
pub use fetcher::{Fetcher, FetcherConfig, HttpFetcher};
pub use models::{BatchOutcome, BatchReport, DownloadLink, DownloadResult, SourceQuery};
pub use progress::{ProgressState, ProgressTracker};
pub use storage::{DirectorySink, StorageSink};
