// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("function exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("timed function aborted without a result")]
    Aborted,
}

/// Run `function` on a worker thread, waiting at most `timeout` for its
/// result.
///
/// On timeout the worker is not cancelled; it keeps running detached, and
/// its eventual result is discarded.
pub fn timed<F, T>(timeout: Duration, function: F) -> Result<T, TimerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    let _worker = thread::spawn(move || {
        let out = function();
        let _ = sender.send(out);
    });

    match receiver.recv_timeout(timeout) {
        Ok(out) => Ok(out),
        Err(RecvTimeoutError::Timeout) => Err(TimerError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(TimerError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_returns_result() {
        let out = timed(Duration::from_secs(5), || 7);
        assert!(matches!(out, Ok(7)));
    }

    #[test]
    fn test_timed_times_out() {
        let timeout = Duration::from_millis(50);

        let out = timed(timeout, || {
            thread::sleep(Duration::from_secs(60));
        });

        assert!(matches!(out, Err(TimerError::Timeout(..))));
    }

    #[test]
    fn test_timed_worker_panic() {
        let out: Result<(), _> = timed(Duration::from_secs(5), || {
            panic!("worker died");
        });

        assert!(matches!(out, Err(TimerError::Aborted)));
    }
}
