//! Concurrent analyzer execution.
//!
//! Images are prepared sequentially by the caller; analyzers then fan
//! out, one blocking task each, over the same shared images. A failing
//! or timed-out analyzer occupies its own slot in the output without
//! affecting siblings, and the output is assembled in request order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shale_core::error::{Result, ShaleError};

use crate::analyze::registry;
use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult};

/// Default per-analyzer deadline.
pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_secs(300);

/// Run every named analyzer against one image, concurrently.
///
/// Returns one slot per requested name, in request order.
pub async fn analyze_all(
    names: &[String],
    image: Arc<Image>,
    timeout: Duration,
) -> Vec<(String, Result<AnalyzeResult>)> {
    let tasks = names.iter().map(|name| {
        let name = name.clone();
        let image = Arc::clone(&image);
        async move {
            let analyzer_name = name.clone();
            let result = run_one(&name, timeout, move || {
                registry::lookup(&analyzer_name)?.analyze(&image)
            })
            .await;
            (name, result)
        }
    });
    join_all(tasks).await
}

/// Run every named analyzer as a pairwise diff, concurrently.
pub async fn diff_all(
    names: &[String],
    image1: Arc<Image>,
    image2: Arc<Image>,
    timeout: Duration,
) -> Vec<(String, Result<DiffResult>)> {
    let tasks = names.iter().map(|name| {
        let name = name.clone();
        let image1 = Arc::clone(&image1);
        let image2 = Arc::clone(&image2);
        async move {
            let analyzer_name = name.clone();
            let result = run_one(&name, timeout, move || {
                registry::lookup(&analyzer_name)?.diff(&image1, &image2)
            })
            .await;
            (name, result)
        }
    });
    join_all(tasks).await
}

/// Execute one analyzer body on the blocking pool under a deadline.
async fn run_one<T, F>(name: &str, timeout: Duration, body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(body);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            if join_error.is_cancelled() {
                Err(ShaleError::Cancelled)
            } else {
                Err(ShaleError::Internal(format!(
                    "analyzer '{}' panicked: {}",
                    name, join_error
                )))
            }
        }
        Err(_elapsed) => {
            tracing::warn!(analyzer = %name, ?timeout, "Analyzer timed out");
            Err(ShaleError::Timeout {
                name: name.to_string(),
                seconds: timeout.as_secs(),
            })
        }
    }
}
