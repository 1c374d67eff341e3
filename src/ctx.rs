//! Deadlines and cancellation.
//!
//! Every suspending operation in the crate takes a [`Ctx`]. A `Ctx` carries
//! an optional deadline and an optional cancellation signal; deriving a
//! child context never extends the parent's deadline.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CtxError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancels the associated [`Ctx`] (and everything derived from it).
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Ctx {
    /// A context without deadline or cancellation.
    pub fn background() -> Ctx {
        Ctx::default()
    }

    pub fn with_timeout(&self, timeout: Duration) -> Ctx {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, at: Instant) -> Ctx {
        let deadline = match self.deadline {
            Some(cur) => Some(cur.min(at)),
            None => Some(at),
        };
        Ctx {
            deadline,
            cancel: self.cancel.clone(),
        }
    }

    /// Derives a context that is additionally cancelled by the returned
    /// handle. The parent's cancellation still applies.
    pub fn with_cancel(&self) -> (Ctx, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let parent = self.cancel.clone();
        let ctx = Ctx {
            deadline: self.deadline,
            cancel: Some(merge(parent, rx)),
        };
        (ctx, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check whether this context is already dead.
    pub fn err(&self) -> Option<CtxError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some(CtxError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(CtxError::DeadlineExceeded);
            }
        }
        None
    }

    /// Resolves once the context is cancelled or its deadline passes;
    /// pending forever on a background context.
    pub async fn done(&self) -> CtxError {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // The handle is gone, cancellation can never fire.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancelled => CtxError::Cancelled,
            _ = sleep_until_opt(self.deadline) => CtxError::DeadlineExceeded,
        }
    }

    /// Runs `fut` to completion unless the context dies first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, CtxError>
    where
        F: Future,
    {
        tokio::select! {
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Merges an optional parent cancellation signal into a child signal: the
/// merged receiver reads `true` as soon as either does.
fn merge(
    parent: Option<watch::Receiver<bool>>,
    child: watch::Receiver<bool>,
) -> watch::Receiver<bool> {
    let parent = match parent {
        Some(parent) => parent,
        None => return child,
    };
    let (tx, rx) = watch::channel(*parent.borrow() || *child.borrow());
    tokio::spawn(async move {
        let mut parent = parent;
        let mut child = child;
        loop {
            if *parent.borrow() || *child.borrow() {
                let _ = tx.send(true);
                return;
            }
            tokio::select! {
                res = parent.changed() => {
                    if res.is_err() {
                        // Parent handle gone; only the child can fire now.
                        loop {
                            if *child.borrow() {
                                let _ = tx.send(true);
                                return;
                            }
                            if child.changed().await.is_err() {
                                return;
                            }
                        }
                    }
                }
                res = child.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
            if tx.is_closed() {
                return;
            }
        }
    });
    rx
}
