use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{
    future::{self, BoxFuture},
    FutureExt,
};
use tokio::sync::oneshot;

use crate::error::TunnelError;

/// Resolves once a tunnel operation has finished.
///
/// Writes hand one of these back immediately; awaiting it is optional.
#[must_use = "completions report write failures only when awaited"]
pub struct Completion {
    inner: BoxFuture<'static, Result<(), TunnelError>>,
}

/// Producer side of a [`Completion`]. Dropping it unresolved fails the
/// completion with [`TunnelError::Closed`].
pub struct Completer {
    tx: oneshot::Sender<Result<(), TunnelError>>,
}

pub fn completion() -> (Completer, Completion) {
    let (tx, rx) = oneshot::channel();
    let inner = async move { rx.await.unwrap_or(Err(TunnelError::Closed)) }.boxed();
    (Completer { tx }, Completion { inner })
}

impl Completer {
    pub fn complete(self, result: Result<(), TunnelError>) {
        let _ = self.tx.send(result);
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, err: TunnelError) {
        self.complete(Err(err));
    }
}

impl Completion {
    pub fn ready(result: Result<(), TunnelError>) -> Self {
        Self {
            inner: future::ready(result).boxed(),
        }
    }

    pub fn succeeded() -> Self {
        Self::ready(Ok(()))
    }

    pub fn failed(err: TunnelError) -> Self {
        Self::ready(Err(err))
    }

    /// Succeeds when every part succeeds; fails as soon as one part fails.
    pub fn all(parts: Vec<Completion>) -> Self {
        match parts.len() {
            0 => Self::succeeded(),
            1 => parts.into_iter().next().unwrap_or_else(Self::succeeded),
            _ => Self {
                inner: future::try_join_all(parts).map(|res| res.map(|_| ())).boxed(),
            },
        }
    }
}

impl Future for Completion {
    type Output = Result<(), TunnelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("abandoned", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn aggregate_waits_for_every_part() {
        let (first, first_done) = completion();
        let (second, second_done) = completion();
        let mut all = Completion::all(vec![first_done, second_done]);

        first.succeed();
        let pending = tokio::time::timeout(Duration::from_millis(50), &mut all).await;
        assert!(pending.is_err());
        second.succeed();
        assert!(all.await.is_ok());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn aggregate_fails_fast() {
        let (first, first_done) = completion();
        let (_second, second_done) = completion();
        let all = Completion::all(vec![first_done, second_done]);

        first.fail(TunnelError::NotConnected);
        assert!(matches!(all.await, Err(TunnelError::NotConnected)));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn dropped_completer_reports_closed() {
        let (completer, done) = completion();
        drop(completer);
        assert!(matches!(done.await, Err(TunnelError::Closed)));
    }
}
