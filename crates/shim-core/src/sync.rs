//! A cell that can be waited on (with timeout) for a value to be set,
//! exactly once, and replays its value to any number of late readers.
//!
//! Used for the exit-status signal and the I/O-drained signal: both are
//! single-fire latches.

use std::sync::Arc;
use std::time::Duration;

pub struct WaitableCell<T> {
    inner: Arc<WaitableCellImpl<T>>,
}

struct WaitableCellImpl<T> {
    notify: tokio::sync::Notify,
    cell: tokio::sync::OnceCell<T>,
}

// Safe because all access to `cell` happens through `OnceCell`'s own
// synchronization; there is no interior mutability we expose unguarded.
unsafe impl<T> Send for WaitableCell<T> {}
unsafe impl<T> Sync for WaitableCell<T> {}

impl<T> Default for WaitableCell<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(WaitableCellImpl {
                notify: tokio::sync::Notify::new(),
                cell: tokio::sync::OnceCell::new(),
            }),
        }
    }
}

impl<T> Clone for WaitableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WaitableCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value. No-op (returns the value back as `Err`) if already set.
    pub fn set(&self, val: impl Into<T>) -> Result<(), T> {
        let val = val.into();
        match self.inner.cell.set(val) {
            Ok(()) => {
                self.inner.notify.notify_waiters();
                Ok(())
            }
            Err(tokio::sync::SetError::AlreadyInitializedError(val)) => Err(val),
            Err(tokio::sync::SetError::InitializingError(val)) => Err(val),
        }
    }

    /// If still empty when the returned guard drops, sets the value to `f()`.
    /// Used to guarantee a latch always fires even on an early return/panic
    /// unwind path (e.g. "make sure we have an exit code no matter what").
    pub fn set_guard_with<R: Into<T>>(&self, f: impl FnOnce() -> R) -> impl Drop {
        WaitableCellSetGuard {
            f: Some(f),
            cell: self.clone(),
        }
    }

    pub async fn wait(&self) -> &T {
        loop {
            match self.inner.cell.get() {
                Some(val) => return val,
                None => self.inner.notify.notified().await,
            }
        }
    }

    pub fn try_wait(&self) -> Option<&T> {
        self.inner.cell.get()
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<&T> {
        if timeout.is_zero() {
            self.try_wait()
        } else {
            tokio::time::timeout(timeout, self.wait()).await.ok()
        }
    }
}

struct WaitableCellSetGuard<T, R: Into<T>, F: FnOnce() -> R> {
    f: Option<F>,
    cell: WaitableCell<T>,
}

impl<T, R: Into<T>, F: FnOnce() -> R> Drop for WaitableCellSetGuard<T, R, F> {
    fn drop(&mut self) {
        let _ = self.cell.set(self.f.take().unwrap()());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::WaitableCell;

    #[tokio::test]
    async fn basic() {
        let cell = WaitableCell::<i32>::new();
        cell.set(42).unwrap();
        assert_eq!(&42, cell.wait().await);
    }

    #[tokio::test]
    async fn unset_timeout_is_none() {
        let cell = WaitableCell::<i32>::new();
        assert_eq!(None, cell.wait_timeout(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn double_set_keeps_first() {
        let cell = WaitableCell::<i32>::new();
        assert_eq!(Ok(()), cell.set(42));
        assert_eq!(Err(24), cell.set(24));
        assert_eq!(&42, cell.wait().await);
    }

    #[tokio::test]
    async fn guard_sets_default_on_drop() {
        let cell = WaitableCell::<i32>::new();
        {
            let _guard = cell.set_guard_with(|| 42);
        }
        assert_eq!(&42, cell.wait().await);
    }

    #[tokio::test]
    async fn guard_is_noop_if_already_set() {
        let cell = WaitableCell::<i32>::new();
        {
            let _guard = cell.set_guard_with(|| 42);
            let _ = cell.set(24);
        }
        assert_eq!(&24, cell.wait().await);
    }

    #[tokio::test]
    async fn late_reader_sees_replayed_value() {
        let cell = WaitableCell::<i32>::new();
        let cloned = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let _ = cloned.set(7);
        });
        assert_eq!(&7, cell.wait().await);
        // second, later reader still observes it
        assert_eq!(&7, cell.wait().await);
    }
}
