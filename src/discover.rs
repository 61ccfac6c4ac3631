//! Asynchronous discovery of one service's object tree.
//!
//! The walker introspects from the root, following child nodes until a node
//! exports the object manager interface, whose GetManagedObjects reply is
//! authoritative for the subtree below it. Nodes exporting the associations
//! interface get their `associations` property fetched alongside. All
//! outstanding requests share one scoreboard; the walk completes when it
//! drains and aborts on the first unclassified error.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbus::arg::RefArg;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{Introspectable, ObjectManager, Properties};
use dbus::nonblock::{Proxy, SyncConnection};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;

use crate::assoc::Association;
use crate::config::MapperConfig;
use crate::introspect::{parse_introspection, IntrospectError};
use crate::mapper::{DiscoveredObject, DiscoveredObjects};
use crate::pathtree::canonical_path;
use crate::{is_no_properties_error, ASSOCIATIONS_IFACE, CALL_TIMEOUT, OBJECT_MANAGER_IFACE};

/// A GetManagedObjects reply reduced to what the mapper keeps:
/// `path → interface → association payload` (the payload list is empty for
/// everything but the associations interface).
pub type ManagedObjects = HashMap<String, HashMap<String, Vec<Association>>>;

/// Why a service's walk was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{service} {path}: {source}")]
    Call {
        service: String,
        path: String,
        #[source]
        source: dbus::Error,
    },
    #[error("{service} {path}: {source}")]
    Parse {
        service: String,
        path: String,
        #[source]
        source: IntrospectError,
    },
}

impl DiscoveryError {
    fn call(service: &str, path: &str, source: dbus::Error) -> Self {
        DiscoveryError::Call { service: service.to_string(), path: path.to_string(), source }
    }

    fn parse(service: &str, path: &str, source: IntrospectError) -> Self {
        DiscoveryError::Parse { service: service.to_string(), path: path.to_string(), source }
    }

    /// True for failures worth retrying the whole walk once: the peer was
    /// restarting or the bus dropped the call.
    pub fn is_transient(&self) -> bool {
        match self {
            DiscoveryError::Call { source, .. } => crate::is_transient_error(source),
            DiscoveryError::Parse { .. } => false,
        }
    }
}

/// The bus operations the walker needs, behind a seam so the walk logic can
/// be exercised against an in-memory tree.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn introspect(&self, service: &str, path: &str) -> Result<String, dbus::Error>;
    async fn get_managed_objects(
        &self,
        service: &str,
        path: &str,
    ) -> Result<ManagedObjects, dbus::Error>;
    async fn get_associations(
        &self,
        service: &str,
        path: &str,
    ) -> Result<Vec<Association>, dbus::Error>;
}

/// Live implementation of [`ObjectSource`].
pub struct BusSource {
    conn: Arc<SyncConnection>,
    timeout: Duration,
}

impl BusSource {
    pub fn new(conn: Arc<SyncConnection>) -> Self {
        BusSource { conn, timeout: CALL_TIMEOUT }
    }

    fn proxy<'a>(&self, service: &'a str, path: &'a str) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(service, path, self.timeout, self.conn.clone())
    }
}

#[async_trait]
impl ObjectSource for BusSource {
    async fn introspect(&self, service: &str, path: &str) -> Result<String, dbus::Error> {
        self.proxy(service, path).introspect().await
    }

    async fn get_managed_objects(
        &self,
        service: &str,
        path: &str,
    ) -> Result<ManagedObjects, dbus::Error> {
        let objects = self.proxy(service, path).get_managed_objects().await?;
        let mut out = ManagedObjects::new();
        for (object, interfaces) in objects {
            let mut entry = HashMap::new();
            for (interface, properties) in interfaces {
                let associations = if interface == ASSOCIATIONS_IFACE {
                    match properties.get("associations") {
                        Some(value) => read_associations(value.0.as_ref()).ok_or_else(|| {
                            dbus::Error::new_custom(
                                "org.freedesktop.DBus.Error.InvalidSignature",
                                "malformed associations property",
                            )
                        })?,
                        None => Vec::new(),
                    }
                } else {
                    Vec::new()
                };
                entry.insert(interface, associations);
            }
            out.insert(object.to_string(), entry);
        }
        Ok(out)
    }

    async fn get_associations(
        &self,
        service: &str,
        path: &str,
    ) -> Result<Vec<Association>, dbus::Error> {
        let proxy = self.proxy(service, path);
        let triples: Vec<(String, String, String)> =
            proxy.get(ASSOCIATIONS_IFACE, "associations").await?;
        Ok(triples
            .into_iter()
            .map(|(forward, reverse, endpoint)| Association { forward, reverse, endpoint })
            .collect())
    }
}

/// Decodes an `a(sss)` associations value out of a message argument.
pub fn read_associations(value: &dyn RefArg) -> Option<Vec<Association>> {
    let mut out = Vec::new();
    for entry in value.as_iter()? {
        let mut fields = entry.as_iter()?;
        let forward = fields.next()?.as_str()?.to_string();
        let reverse = fields.next()?.as_str()?.to_string();
        let endpoint = fields.next()?.as_str()?.to_string();
        out.push(Association { forward, reverse, endpoint });
    }
    Some(out)
}

enum Step {
    Introspect(String, Result<String, dbus::Error>),
    Managed(String, Result<ManagedObjects, dbus::Error>),
    Associations(String, Result<Vec<Association>, dbus::Error>),
}

fn introspect_step<'a, S: ObjectSource>(
    source: &'a S,
    service: &'a str,
    path: String,
) -> BoxFuture<'a, Step> {
    Box::pin(async move {
        let reply = source.introspect(service, &path).await;
        Step::Introspect(path, reply)
    })
}

fn managed_step<'a, S: ObjectSource>(
    source: &'a S,
    service: &'a str,
    path: String,
) -> BoxFuture<'a, Step> {
    Box::pin(async move {
        let reply = source.get_managed_objects(service, &path).await;
        Step::Managed(path, reply)
    })
}

fn associations_step<'a, S: ObjectSource>(
    source: &'a S,
    service: &'a str,
    path: String,
) -> BoxFuture<'a, Step> {
    Box::pin(async move {
        let reply = source.get_associations(service, &path).await;
        Step::Associations(path, reply)
    })
}

/// Walks `service`'s tree from `root` and returns everything the configured
/// namespaces admit. Aborts on the first unclassified error; partial results
/// are discarded by the caller.
pub async fn find_dbus_interfaces<S: ObjectSource>(
    source: &S,
    service: &str,
    root: &str,
    config: &MapperConfig,
) -> Result<DiscoveredObjects, DiscoveryError> {
    let mut results = DiscoveredObjects::new();
    let mut seen = HashSet::new();
    let mut pending: FuturesUnordered<BoxFuture<'_, Step>> = FuturesUnordered::new();

    let root = canonical_path(root);
    seen.insert(root.clone());
    pending.push(introspect_step(source, service, root));

    while let Some(step) = pending.next().await {
        match step {
            Step::Introspect(path, reply) => {
                let data = reply.map_err(|e| DiscoveryError::call(service, &path, e))?;
                let node =
                    parse_introspection(&data).map_err(|e| DiscoveryError::parse(service, &path, e))?;
                let interfaces: BTreeSet<String> =
                    node.interfaces.into_iter().filter(|i| config.ingest_match(i)).collect();
                let has_manager = interfaces.contains(OBJECT_MANAGER_IFACE);
                let has_associations = interfaces.contains(ASSOCIATIONS_IFACE);
                results.insert(
                    path.clone(),
                    DiscoveredObject { interfaces, associations: Vec::new() },
                );

                if has_associations {
                    pending.push(associations_step(source, service, path.clone()));
                }
                if has_manager {
                    // the reply enumerates the whole subtree; no recursion
                    pending.push(managed_step(source, service, path));
                } else {
                    let mut children = node.children;
                    children.sort();
                    for child in children {
                        let child_path = canonical_path(&format!("{}/{}", path, child));
                        if !config.path_match(&child_path) || seen.contains(&child_path) {
                            continue;
                        }
                        seen.insert(child_path.clone());
                        pending.push(introspect_step(source, service, child_path));
                    }
                }
            }
            Step::Managed(path, reply) => {
                let objects = reply.map_err(|e| DiscoveryError::call(service, &path, e))?;
                for (object, interfaces) in objects {
                    let object = canonical_path(&object);
                    let mut discovered = DiscoveredObject::default();
                    for (interface, associations) in interfaces {
                        if !config.ingest_match(&interface) {
                            continue;
                        }
                        if interface == ASSOCIATIONS_IFACE {
                            discovered.associations.extend(associations);
                        }
                        discovered.interfaces.insert(interface);
                    }
                    seen.insert(object.clone());
                    results.insert(object, discovered);
                }
            }
            Step::Associations(path, reply) => match reply {
                Ok(associations) => {
                    if let Some(object) = results.get_mut(&path) {
                        object.associations = associations;
                    }
                }
                // the interface is exported without backing properties
                Err(e) if is_no_properties_error(&e) => (),
                Err(e) => return Err(DiscoveryError::call(service, &path, e)),
            },
        }
    }
    Ok(results)
}

/// One walk of `service`, retried once when the failure looks transient.
pub async fn discover_service<S: ObjectSource>(
    source: &S,
    service: &str,
    config: &MapperConfig,
) -> Result<DiscoveredObjects, DiscoveryError> {
    match find_dbus_interfaces(source, service, "/", config).await {
        Err(e) if e.is_transient() => {
            debug!("{} walk failed ({}), retrying once", service, e);
            find_dbus_interfaces(source, service, "/", config).await
        }
        result => result,
    }
}
