//! Utilities used in [`pcp-client`][`crate`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

/// A join handle that owns the task it is running, and aborts it when
/// dropped.
#[derive(Debug)]
pub(crate) struct AbortingJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> From<JoinHandle<T>> for AbortingJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Future for AbortingJoinHandle<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
