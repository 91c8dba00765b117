//! Reactive state holders.
//!
//! Each pipeline component exposes its observable state (`is_open`,
//! `is_streaming`, `throwable`) as an [`Observable`]: a current value plus a
//! broadcast of every distinct transition. Consumers `subscribe()` and get
//! the current value immediately, then future transitions as they happen.

use tokio::sync::watch;

use crate::error::Error;

/// A value plus a channel of its transitions. Cloning an `Observable` shares
/// the same underlying cell; only the owner (returned by [`Observable::new`])
/// should call [`Observable::set`].
#[derive(Clone)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
    rx: watch::Receiver<T>,
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, rx) = watch::channel(initial);
        Observable { tx, rx }
    }

    /// Returns the current value without subscribing.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Sets a new value. A no-op (no transition fires) if `value` equals the
    /// current value, matching "callbacks fire once per distinct transition"
    /// (spec.md §7).
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// A receiver that yields the current value, then every future distinct
    /// transition.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Awaits the next distinct transition away from `value`.
    pub async fn wait_until_not(&self, value: T) -> T {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() != value {
                return rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Aggregates the most recent error reported by a component, if any. A
/// pipeline folds the `throwable`s of its sources, outputs, and endpoints
/// into one [`Observable<Option<Throwable>>`] per spec.md §7.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Throwable {
    pub message: String,
}

impl From<&Error> for Throwable {
    fn from(e: &Error) -> Self {
        Throwable { message: e.to_string() }
    }
}

pub type ThrowableCell = Observable<Option<Throwable>>;

pub fn new_throwable_cell() -> ThrowableCell {
    Observable::new(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_sets_do_not_fire() {
        let o = Observable::new(false);
        let mut rx = o.subscribe();
        assert_eq!(*rx.borrow(), false);
        o.set(false);
        // No transition queued; changed() would hang forever if awaited, so
        // just assert the generation counter didn't move via has_changed().
        assert!(!rx.has_changed().unwrap());
        o.set(true);
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), true);
    }

    #[tokio::test]
    async fn wait_until_not_resolves_on_transition() {
        let o: Observable<bool> = Observable::new(false);
        let o2 = o.clone();
        let task = tokio::spawn(async move { o2.wait_until_not(false).await });
        tokio::task::yield_now().await;
        o.set(true);
        assert_eq!(task.await.unwrap(), true);
    }
}
