use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, String>,
    /// Parked `wait` calls, per key. Drained by the `set` that fills the key.
    waiters: HashMap<String, Vec<oneshot::Sender<String>>>,
    closed: bool,
}

/// The coordination store of one application.
///
/// `wait` registers under the same lock `set` takes, so a value set between
/// the presence check and the registration cannot be missed.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    inner: Mutex<Inner>,
}

impl Inner {
    /// Drops senders whose `wait` caller went away, and keys left without
    /// any waiter.
    fn prune_waiters(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|waiter| !waiter.is_closed());
            !waiters.is_empty()
        });
    }
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("key-value store lock poisoned".to_owned()))?;

        if inner.closed {
            return Err(Error::Connection("application has terminated".to_owned()));
        }

        Ok(inner)
    }

    pub fn get(&self, key: &str) -> Result<String> {
        self.lock()?
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key {key:?}")))
    }

    /// Stores `value` and hands it to every pending `wait` on `key`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock()?;

        inner.entries.insert(key.to_owned(), value.to_owned());

        if let Some(waiters) = inner.waiters.remove(key) {
            debug!(key, waiters = waiters.len(), "waking waiters");
            for waiter in waiters {
                // The waiting caller may have gone away.
                let _ = waiter.send(value.to_owned());
            }
        }
        inner.prune_waiters();

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entries.remove(key);
        inner.prune_waiters();
        Ok(())
    }

    /// Returns the value of `key`, suspending until it is set if absent.
    pub async fn wait(&self, key: &str) -> Result<String> {
        let receiver = {
            let mut inner = self.lock()?;

            if let Some(value) = inner.entries.get(key) {
                return Ok(value.clone());
            }

            let (sender, receiver) = oneshot::channel();
            let waiters = inner.waiters.entry(key.to_owned()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(sender);
            receiver
        };

        // The sender is only dropped without a value when the store closes.
        receiver
            .await
            .map_err(|_| Error::Connection("application has terminated".to_owned()))
    }

    pub fn to_map(&self) -> Result<HashMap<String, String>> {
        Ok(self.lock()?.entries.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    #[cfg(test)]
    pub(crate) fn pending_waiters(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.waiters.values().map(Vec::len).sum())
            .unwrap_or_default()
    }

    /// Discards every entry and fails all pending and future calls.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            inner.entries.clear();
            inner.waiters.clear();
        }
    }
}
