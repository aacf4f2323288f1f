use std::future::Future;

/// Drives an SDK future from the synchronous adapter traits.
///
/// Must be called from a multi-threaded tokio runtime, which is what the
/// Lambda binaries run on.
pub fn block_on_sdk<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
