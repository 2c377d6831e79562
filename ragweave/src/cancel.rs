//! Cancellation handles for long-running operations.
//!
//! Every async operation in this crate is cancelled by dropping its future.
//! [`cancellable`] ties that to a shared [`CancellationToken`] so a caller can
//! abort a retrieval, an index build or a stream from elsewhere.

use std::future::Future;

use futures::StreamExt;
pub use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};
use crate::models::TextStream;

/// Run `fut` until it finishes or `token` fires, whichever comes first.
///
/// # Errors
///
/// Returns [`RagError::Cancelled`] if the token fired first; the inner future
/// is dropped, aborting any in-flight model or store call.
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(RagError::Cancelled);
    }
    tokio::select! {
        biased;
        () = token.cancelled() => Err(RagError::Cancelled),
        result = fut => result,
    }
}

/// Wrap a delta stream so it ends with [`RagError::Cancelled`] once `token` fires.
pub fn cancellable_stream(token: CancellationToken, stream: TextStream) -> TextStream {
    futures::stream::unfold((token, Some(stream)), |(token, stream)| async move {
        let mut stream = stream?;
        tokio::select! {
            biased;
            () = token.cancelled() => Some((Err(RagError::Cancelled), (token, None))),
            item = stream.next() => item.map(|item| (item, (token, Some(stream)))),
        }
    })
    .boxed()
}
