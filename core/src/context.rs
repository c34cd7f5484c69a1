//! Cancellation and deadlines for blocking calls.
//!
//! Every executor, authenticator and iterator call takes a `Context`. A
//! context can be cancelled explicitly, carry a deadline, or both. Contexts
//! derived with `with_timeout`/`with_deadline` are cancelled together with
//! their parent but never cancel it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// How often a blocked wait looks at the token again.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context expiring `timeout` from now (or at the parent's
    /// deadline, whichever comes first).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context that can be cancelled independently of this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Canceled` or `DeadlineExceeded` once the context has ended.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::canceled());
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Error::deadline_exceeded()),
            _ => None,
        }
    }

    /// Waits for the next value on `rx` until this context ends.
    ///
    /// `Ok(None)` means every sender is gone.
    pub(crate) fn recv<T>(&self, rx: &Receiver<T>) -> Result<Option<T>, Error> {
        loop {
            if let Some(err) = self.err() {
                return Err(err);
            }
            let wait = match self.remaining() {
                Some(left) => left.min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            match rx.recv_timeout(wait) {
                Ok(value) => return Ok(Some(value)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Runs `work` on a named thread and waits for it while this context
    /// lives. An ended context returns at once and leaves the thread to
    /// finish on its own; its result is dropped.
    pub(crate) fn run<T, F>(&self, name: &str, work: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(work());
            })
            .map_err(Error::network)?;
        match self.recv(&rx)? {
            Some(value) => Ok(value),
            None => Err(Error::bad_response(format!("{name} exited without a result"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn background_never_ends() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_reports_canceled() {
        let ctx = Context::background();
        ctx.cancel();
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::Canceled));
    }

    #[test]
    fn cancelling_parent_cancels_child_only_downwards() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(parent.err().is_none());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn elapsed_deadline_reports_deadline_exceeded() {
        let ctx = Context::background().with_deadline(Instant::now());
        assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn run_returns_the_work_result() {
        let ctx = Context::background();
        assert_eq!(ctx.run("adder", || 40 + 2).unwrap(), 42);
    }

    #[test]
    fn run_gives_up_when_cancelled() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = ctx
            .run("sleeper", || thread::sleep(Duration::from_secs(5)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn recv_honours_the_deadline() {
        let (_tx, rx) = mpsc::channel::<()>();
        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        let err = ctx.recv(&rx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn recv_reports_closed_channel() {
        let (tx, rx) = mpsc::channel::<u8>();
        tx.send(7).unwrap();
        drop(tx);
        let ctx = Context::background();
        assert_eq!(ctx.recv(&rx).unwrap(), Some(7));
        assert_eq!(ctx.recv(&rx).unwrap(), None);
    }
}
