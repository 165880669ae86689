//! Latched change notifier.
//!
//! A [`Watch`] stores the latest value of some state and lets any number of
//! observers run a callback for the current value and every change after it.
//! Observation stops when the observer future is dropped, which is how
//! session teardown cancels the listeners it spawned.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// A latched value observers can await changes of.
///
/// The value starts unset; observers see nothing until the first
/// [`set`](Watch::set). Every `set` or [`update`](Watch::update) wakes all
/// listeners with a clone of the fresh value.
#[derive(Debug)]
pub struct Watch<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Watch<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Default for Watch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Watch<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the value and wake listeners.
    pub fn set(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Mutate the value in place and wake listeners.
    ///
    /// If no value was set yet, `init` provides the starting point.
    pub fn update(&self, init: impl FnOnce() -> T, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(|slot| {
            let value = slot.get_or_insert_with(init);
            f(value);
        });
    }

    /// The current value, if one was set.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// A raw receiver over the latched slot, for callers that need to mix
    /// change waits with other events in a `select!`.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }

    /// Run `f` with the current value (if set) and with every value after a
    /// change, until `f` fails or this future is dropped.
    pub async fn listen<F, Fut, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                f(value).await?;
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_listen_sees_latched_value() {
        let watch = Watch::new();
        watch.set(7u32);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let watch = watch.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let _: Result<(), Infallible> = watch
                    .listen(|v| {
                        seen.lock().unwrap().push(v);
                        async { Ok(()) }
                    })
                    .await;
            })
        };

        tokio::task::yield_now().await;
        watch.set(8);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        listener.abort();

        let seen = seen.lock().unwrap();
        assert_eq!(&*seen, &[7, 8]);
    }

    #[tokio::test]
    async fn test_update_initializes_empty_value() {
        let watch: Watch<Vec<u32>> = Watch::new();
        assert_eq!(watch.get(), None);

        watch.update(Vec::new, |v| v.push(3));
        assert_eq!(watch.get(), Some(vec![3]));

        watch.update(Vec::new, |v| v.push(4));
        assert_eq!(watch.get(), Some(vec![3, 4]));
    }

    #[tokio::test]
    async fn test_listener_error_stops_listen() {
        let watch = Watch::new();
        watch.set(1u32);

        let res: Result<(), &str> = watch.listen(|_| async { Err("stop") }).await;
        assert_eq!(res, Err("stop"));
    }
}
