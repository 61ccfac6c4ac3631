//! Typed bindings for programs consuming the mapper.
//!
//! The bus occasionally answers with a busy indication while the mapper is
//! chewing through a burst of traffic; every query here retries those with a
//! bounded backoff before giving up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dbus::message::{MatchRule, SignalArgs};
use dbus::nonblock::stdintf::org_freedesktop_dbus::ObjectManagerInterfacesAdded;
use dbus::nonblock::{Proxy, SyncConnection};
use log::debug;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::{is_busy_error, CALL_TIMEOUT, MAPPER_IFACE, MAPPER_NAME, MAPPER_PATH, NOT_FOUND_ERROR};

/// Retry profile for ordinary queries.
pub const DEFAULT_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// [`MapperClient::wait`] expects to poll across service startups, so it is
/// more patient.
pub const WAIT_RETRIES: u32 = 20;
pub const WAIT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Runs `call` until it stops answering busy, up to `retries` attempts with
/// `interval` between them. Any other error returns immediately.
pub async fn retry_busy<T, F, Fut>(retries: u32, interval: Duration, mut call: F) -> Result<T, dbus::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, dbus::Error>>,
{
    let mut attempts = 0;
    loop {
        match call().await {
            Err(e) if is_busy_error(&e) => {
                attempts += 1;
                if attempts >= retries {
                    return Err(e);
                }
                debug!("mapper busy, retrying ({}/{})", attempts, retries);
                sleep(interval).await;
            }
            result => return result,
        }
    }
}

/// Typed client for the mapper's query interface.
#[derive(Clone)]
pub struct MapperClient {
    conn: Arc<SyncConnection>,
    retries: u32,
    retry_interval: Duration,
}

impl MapperClient {
    pub fn new(conn: Arc<SyncConnection>) -> Self {
        MapperClient { conn, retries: DEFAULT_RETRIES, retry_interval: DEFAULT_RETRY_INTERVAL }
    }

    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    fn proxy(&self) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(MAPPER_NAME, MAPPER_PATH, CALL_TIMEOUT, self.conn.clone())
    }

    async fn retry_call<T, F, Fut>(&self, call: F) -> Result<T, dbus::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, dbus::Error>>,
    {
        retry_busy(self.retries, self.retry_interval, call).await
    }

    pub async fn get_object(
        &self,
        path: &str,
        interfaces: &[String],
    ) -> Result<HashMap<String, Vec<String>>, dbus::Error> {
        self.retry_call(|| {
            let proxy = self.proxy();
            let args = (path.to_string(), interfaces.to_vec());
            async move {
                let (services,): (HashMap<String, Vec<String>>,) =
                    proxy.method_call(MAPPER_IFACE, "GetObject", args).await?;
                Ok(services)
            }
        })
        .await
    }

    pub async fn get_subtree(
        &self,
        subtree: &str,
        depth: i32,
        interfaces: &[String],
    ) -> Result<HashMap<String, HashMap<String, Vec<String>>>, dbus::Error> {
        self.retry_call(|| {
            let proxy = self.proxy();
            let args = (subtree.to_string(), depth, interfaces.to_vec());
            async move {
                let (objects,): (HashMap<String, HashMap<String, Vec<String>>>,) =
                    proxy.method_call(MAPPER_IFACE, "GetSubTree", args).await?;
                Ok(objects)
            }
        })
        .await
    }

    pub async fn get_subtree_paths(
        &self,
        subtree: &str,
        depth: i32,
        interfaces: &[String],
    ) -> Result<Vec<String>, dbus::Error> {
        self.retry_call(|| {
            let proxy = self.proxy();
            let args = (subtree.to_string(), depth, interfaces.to_vec());
            async move {
                let (paths,): (Vec<String>,) =
                    proxy.method_call(MAPPER_IFACE, "GetSubTreePaths", args).await?;
                Ok(paths)
            }
        })
        .await
    }

    pub async fn get_ancestors(
        &self,
        path: &str,
        interfaces: &[String],
    ) -> Result<HashMap<String, HashMap<String, Vec<String>>>, dbus::Error> {
        self.retry_call(|| {
            let proxy = self.proxy();
            let args = (path.to_string(), interfaces.to_vec());
            async move {
                let (ancestors,): (HashMap<String, HashMap<String, Vec<String>>>,) =
                    proxy.method_call(MAPPER_IFACE, "GetAncestors", args).await?;
                Ok(ancestors)
            }
        })
        .await
    }

    /// Resolves once every path in `waitlist` is known to the mapper.
    /// Re-polls whenever the bus topology moves, so it also works for
    /// objects that appear long after the call starts.
    pub async fn wait(&self, waitlist: &[String]) -> Result<(), dbus::Error> {
        let notify = Arc::new(Notify::new());
        let mut matches = Vec::new();
        let rules = vec![
            MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged"),
            ObjectManagerInterfacesAdded::match_rule(None, None),
        ];
        for rule in rules {
            let notify = notify.clone();
            matches.push(self.conn.add_match(rule).await?.msg_cb(move |_| {
                notify.notify_one();
                true
            }));
        }

        let waiter = self.clone().with_retries(WAIT_RETRIES, WAIT_RETRY_INTERVAL);
        let mut outstanding: Vec<String> = waitlist.to_vec();
        let result = loop {
            let mut remaining = Vec::new();
            let mut failed = None;
            for path in outstanding {
                match waiter.get_object(&path, &[]).await {
                    Ok(_) => debug!("{} appeared", path),
                    Err(e) if e.name() == Some(NOT_FOUND_ERROR) => remaining.push(path),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failed {
                break Err(e);
            }
            if remaining.is_empty() {
                break Ok(());
            }
            outstanding = remaining;
            notify.notified().await;
        };

        for m in matches {
            let _ = self.conn.remove_match(m.token()).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy() -> dbus::Error {
        dbus::Error::new_custom("org.freedesktop.DBus.Error.ObjectPathInUse", "busy")
    }

    #[tokio::test(start_paused = true)]
    async fn busy_replies_are_retried() {
        let calls = Cell::new(0u32);
        let result = retry_busy(5, Duration::from_millis(200), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n < 3 { Err(busy()) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry_busy(5, Duration::from_millis(200), || {
            calls.set(calls.get() + 1);
            async { Err(busy()) }
        })
        .await;
        assert!(is_busy_error(&result.unwrap_err()));
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_pass_through() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry_busy(5, Duration::from_millis(200), || {
            calls.set(calls.get() + 1);
            async {
                Err(dbus::Error::new_custom("org.freedesktop.DBus.Error.FileNotFound", "missing"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().name(), Some("org.freedesktop.DBus.Error.FileNotFound"));
        assert_eq!(calls.get(), 1);
    }
}
