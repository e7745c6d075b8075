use std::{future::Future, time::Duration};

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::SocketError;

static BACKGROUND: OnceCell<Runtime> = OnceCell::new();

fn background() -> Result<&'static Runtime, SocketError> {
    BACKGROUND.get_or_try_init(|| {
        log::debug!("starting background socket runtime");
        Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dualsock-io")
            .enable_all()
            .build()
            .map_err(SocketError::SocketFault)
    })
}

/// The runtime a new socket registers with: the caller's, or the background
/// one when the caller is a plain thread.
pub(crate) fn current_or_background() -> Result<Handle, SocketError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => Ok(background()?.handle().clone()),
    }
}

/// Drives `future` to completion on `handle` from a synchronous caller.
pub(crate) fn block_on<F: Future>(handle: &Handle, future: F) -> Result<F::Output, SocketError> {
    if Handle::try_current().is_ok() {
        return Err(SocketError::InvalidArgument(
            "blocking socket call made from inside an async runtime",
        ));
    }
    Ok(handle.block_on(future))
}

pub(crate) async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    future: F,
) -> Result<T, SocketError>
where
    F: Future<Output = Result<T, SocketError>>,
{
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(SocketError::TimedOut),
        },
        None => future.await,
    }
}
