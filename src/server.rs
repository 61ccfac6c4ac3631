//! The daemon: connection bring-up, the exported mapper object, signal
//! subscriptions and discovery orchestration.
//!
//! State mutation happens behind the mapper mutex; the bus side effects each
//! mutation produced are applied afterwards, with the state lock released.
//! Method handlers only ever read, so queries stay cheap while walks and
//! signals reshape the cache.

use std::sync::{Arc, Mutex};

use dbus::arg::{PropMap, RefArg, Variant};
use dbus::channel::{MatchingReceiver, Sender};
use dbus::message::{MatchRule, SignalArgs};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{
    ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::{Message, Path};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use dbus_tokio::connection;
use futures::future;
use log::{debug, info, warn};

use crate::config::MapperConfig;
use crate::discover::{self, read_associations, BusSource};
use crate::mapper::{Effect, Mapper, MapperError};
use crate::{
    ASSOCIATIONS_IFACE, ASSOC_IFACE, CALL_TIMEOUT, MANAGER_PATH, MAPPER_IFACE, MAPPER_NAME,
    MAPPER_PATH, MAPPER_PRIVATE_IFACE, NOT_FOUND_ERROR,
};

/// Endpoints list behind one materialized association object.
struct AssociationObject {
    endpoints: Vec<String>,
}

type MapperHandle = Arc<Mutex<Mapper>>;

fn method_err(e: MapperError) -> MethodErr {
    match &e {
        MapperError::NotFound(_) => MethodErr::from((NOT_FOUND_ERROR, e.to_string())),
    }
}

struct MapperServer {
    conn: Arc<SyncConnection>,
    config: MapperConfig,
    mapper: MapperHandle,
    crossroads: Arc<Mutex<Crossroads>>,
    assoc_token: IfaceToken<AssociationObject>,
}

impl MapperServer {
    /// Runs `f` against the state, then applies whatever bus side effects
    /// the mutation produced. The state lock is released before any effect
    /// touches the crossroads or the connection.
    fn with_mapper<R>(&self, f: impl FnOnce(&mut Mapper) -> R) -> R {
        let (result, effects) = {
            let mut mapper = self.mapper.lock().unwrap();
            let result = f(&mut mapper);
            (result, mapper.take_effects())
        };
        self.apply_effects(effects);
        result
    }

    fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::AssociationCreated { path, endpoints } => {
                    debug!("exporting association object at {}", path);
                    let mut cr = self.crossroads.lock().unwrap();
                    cr.insert(Path::from(path), &[self.assoc_token], AssociationObject { endpoints });
                }
                Effect::AssociationUpdated { path, endpoints } => {
                    {
                        let mut cr = self.crossroads.lock().unwrap();
                        if let Some(object) =
                            cr.data_mut::<AssociationObject>(&Path::from(path.clone()))
                        {
                            object.endpoints = endpoints.clone();
                        }
                    }
                    let mut changed = PropMap::new();
                    changed.insert(
                        "endpoints".to_string(),
                        Variant(Box::new(endpoints) as Box<dyn RefArg>),
                    );
                    let signal = PropertiesPropertiesChanged {
                        interface_name: ASSOC_IFACE.to_string(),
                        changed_properties: changed,
                        invalidated_properties: Vec::new(),
                    };
                    let _ = self.conn.send(signal.to_emit_message(&Path::from(path)));
                }
                Effect::AssociationDestroyed { path } => {
                    debug!("removing association object at {}", path);
                    let mut cr = self.crossroads.lock().unwrap();
                    let _ = cr.remove::<AssociationObject>(&Path::from(path));
                }
                Effect::DiscoveryComplete { owner } => {
                    let msg = Message::signal(
                        &Path::from(MAPPER_PATH),
                        &MAPPER_PRIVATE_IFACE.into(),
                        &"IntrospectionComplete".into(),
                    )
                    .append1(owner);
                    let _ = self.conn.send(msg);
                }
            }
        }
    }

    fn interfaces_added(&self, msg: &Message, args: ObjectManagerInterfacesAdded) {
        let (sender, manager) = match (msg.sender(), msg.path()) {
            (Some(sender), Some(path)) => (sender.to_string(), path.to_string()),
            _ => return,
        };
        let mut interfaces = Vec::new();
        let mut associations = Vec::new();
        for (interface, properties) in &args.interfaces {
            if interface == ASSOCIATIONS_IFACE {
                if let Some(value) = properties.get("associations") {
                    match read_associations(value.0.as_ref()) {
                        Some(parsed) => associations = parsed,
                        None => {
                            warn!(
                                "malformed associations payload from {} at {}",
                                sender, args.object
                            );
                            return;
                        }
                    }
                }
            }
            interfaces.push(interface.clone());
        }
        self.with_mapper(|m| {
            m.interfaces_added(&sender, &args.object, &manager, interfaces, associations)
        });
    }

    fn interfaces_removed(&self, msg: &Message, args: ObjectManagerInterfacesRemoved) {
        let (sender, manager) = match (msg.sender(), msg.path()) {
            (Some(sender), Some(path)) => (sender.to_string(), path.to_string()),
            _ => return,
        };
        self.with_mapper(|m| {
            m.interfaces_removed(&sender, &args.object, &manager, args.interfaces.clone())
        });
    }

    fn properties_changed(&self, msg: &Message, args: PropertiesPropertiesChanged) {
        if args.interface_name != ASSOCIATIONS_IFACE {
            return;
        }
        let (sender, object) = match (msg.sender(), msg.path()) {
            (Some(sender), Some(path)) => (sender.to_string(), path.to_string()),
            _ => return,
        };
        let associations = match args.changed_properties.get("associations") {
            Some(value) => match read_associations(value.0.as_ref()) {
                Some(parsed) => parsed,
                None => {
                    warn!("malformed associations payload from {} at {}", sender, object);
                    return;
                }
            },
            None => return,
        };
        self.with_mapper(|m| {
            m.properties_changed(&sender, &object, &args.interface_name, associations)
        });
    }
}

/// One service's walk, folded into the state when it settles.
async fn discover_one(server: &MapperServer, service: &str) {
    debug!("discovering objects owned by {}", service);
    let source = BusSource::new(server.conn.clone());
    match discover::discover_service(&source, service, &server.config).await {
        Ok(objects) => {
            debug!("{} discovery found {} paths", service, objects.len());
            server.with_mapper(|m| m.discovery_complete(service, objects));
        }
        Err(e) => {
            warn!("discovery failure on {}", e);
            server.with_mapper(|m| m.discovery_failed(service));
        }
    }
}

fn spawn_discovery(server: &Arc<MapperServer>, service: String) {
    let server = server.clone();
    tokio::spawn(async move {
        discover_one(&server, &service).await;
    });
}

fn handle_name_owner_changed(server: &Arc<MapperServer>, name: String, old: String, new: String) {
    let start = server.with_mapper(|m| {
        let start = m.name_owner_changed(&name, &old, &new);
        if start {
            m.begin_discovery(&name, &new);
        }
        start
    });
    if start {
        spawn_discovery(server, name);
    }
}

async fn subscribe_signals(server: &Arc<MapperServer>) -> Result<Vec<MsgMatch>, dbus::Error> {
    let mut matches = Vec::new();

    let rule = MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged");
    let handler = server.clone();
    matches.push(server.conn.add_match(rule).await?.cb(
        move |_, (name, old, new): (String, String, String)| {
            handle_name_owner_changed(&handler, name, old, new);
            true
        },
    ));

    let rule = ObjectManagerInterfacesAdded::match_rule(None, None);
    let handler = server.clone();
    matches.push(server.conn.add_match(rule).await?.cb(
        move |msg, args: ObjectManagerInterfacesAdded| {
            handler.interfaces_added(&msg, args);
            true
        },
    ));

    let rule = ObjectManagerInterfacesRemoved::match_rule(None, None);
    let handler = server.clone();
    matches.push(server.conn.add_match(rule).await?.cb(
        move |msg, args: ObjectManagerInterfacesRemoved| {
            handler.interfaces_removed(&msg, args);
            true
        },
    ));

    // filtered down to the associations interface in the handler
    let rule = PropertiesPropertiesChanged::match_rule(None, None);
    let handler = server.clone();
    matches.push(server.conn.add_match(rule).await?.cb(
        move |msg, args: PropertiesPropertiesChanged| {
            handler.properties_changed(&msg, args);
            true
        },
    ));

    Ok(matches)
}

/// Enumerates the bus and walks every well-known name on it, returning once
/// all walks have settled one way or the other.
async fn initial_discovery(server: &Arc<MapperServer>) -> Result<(), dbus::Error> {
    let bus = Proxy::new(
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        CALL_TIMEOUT,
        server.conn.clone(),
    );
    let (names,): (Vec<String>,) =
        bus.method_call("org.freedesktop.DBus", "ListNames", ()).await?;

    let mut walks = Vec::new();
    for name in names {
        if crate::is_unique_name(&name) || name == MAPPER_NAME {
            continue;
        }
        let (unique,): (String,) = match bus
            .method_call("org.freedesktop.DBus", "GetNameOwner", (name.as_str(),))
            .await
        {
            Ok(owner) => owner,
            Err(e) => {
                debug!("GetNameOwner({}) failed: {}", name, e);
                continue;
            }
        };
        server.with_mapper(|m| m.begin_discovery(&name, &unique));
        let walker = server.clone();
        walks.push(tokio::spawn(async move {
            discover_one(&walker, &name).await;
        }));
    }
    for walk in walks {
        let _ = walk.await;
    }
    Ok(())
}

fn register_mapper(cr: &mut Crossroads) -> IfaceToken<MapperHandle> {
    cr.register(MAPPER_IFACE, |b: &mut IfaceBuilder<MapperHandle>| {
        b.method(
            "GetObject",
            ("path", "interfaces"),
            ("services",),
            |_, mapper, (path, interfaces): (String, Vec<String>)| {
                let mapper = mapper.lock().unwrap();
                mapper.get_object(&path, &interfaces).map(|r| (r,)).map_err(method_err)
            },
        );
        b.method(
            "GetSubTree",
            ("subtree", "depth", "interfaces"),
            ("objects",),
            |_, mapper, (subtree, depth, interfaces): (String, i32, Vec<String>)| {
                let mapper = mapper.lock().unwrap();
                mapper.get_subtree(&subtree, depth, &interfaces).map(|r| (r,)).map_err(method_err)
            },
        );
        b.method(
            "GetSubTreePaths",
            ("subtree", "depth", "interfaces"),
            ("paths",),
            |_, mapper, (subtree, depth, interfaces): (String, i32, Vec<String>)| {
                let mapper = mapper.lock().unwrap();
                mapper
                    .get_subtree_paths(&subtree, depth, &interfaces)
                    .map(|r| (r,))
                    .map_err(method_err)
            },
        );
        b.method(
            "GetAncestors",
            ("path", "interfaces"),
            ("ancestors",),
            |_, mapper, (path, interfaces): (String, Vec<String>)| {
                let mapper = mapper.lock().unwrap();
                mapper.get_ancestors(&path, &interfaces).map(|r| (r,)).map_err(method_err)
            },
        );
    })
}

fn register_private(cr: &mut Crossroads) -> IfaceToken<MapperHandle> {
    cr.register(MAPPER_PRIVATE_IFACE, |b: &mut IfaceBuilder<MapperHandle>| {
        b.signal::<(String,), _>("IntrospectionComplete", ("name",));
    })
}

fn register_association(cr: &mut Crossroads) -> IfaceToken<AssociationObject> {
    cr.register(ASSOC_IFACE, |b: &mut IfaceBuilder<AssociationObject>| {
        b.property("endpoints")
            .emits_changed_true()
            .get(|_, object| Ok(object.endpoints.clone()));
    })
}

/// Connects to the system bus and serves the mapper until the connection
/// dies.
pub async fn run(config: MapperConfig) -> Result<(), dbus::Error> {
    let (resource, conn) = connection::new_system_sync()?;
    // If this task ever finishes, we lost the connection.
    tokio::spawn(async {
        let err = resource.await;
        panic!("Lost connection to D-Bus: {}", err);
    });
    serve(config, conn).await
}

/// Serves the mapper on an established connection. The well-known name is
/// claimed only once every service found at startup has been walked, so
/// clients never observe a partially discovered cache.
pub async fn serve(config: MapperConfig, conn: Arc<SyncConnection>) -> Result<(), dbus::Error> {
    info!("object mapper starting, discovery in progress");

    let mut mapper = Mapper::new(config.clone(), MAPPER_NAME);
    mapper.set_unique_name(&conn.unique_name());

    let mut cr = Crossroads::new();
    cr.set_object_manager_support(Some(conn.clone()));
    let assoc_token = register_association(&mut cr);
    let mapper_token = register_mapper(&mut cr);
    let private_token = register_private(&mut cr);
    let manager_token: IfaceToken<()> = cr.object_manager();

    let mapper = Arc::new(Mutex::new(mapper));
    cr.insert(Path::from(MAPPER_PATH), &[mapper_token, private_token], mapper.clone());
    cr.insert(Path::from(MANAGER_PATH), &[manager_token], ());

    let server = Arc::new(MapperServer {
        conn: conn.clone(),
        config,
        mapper,
        crossroads: Arc::new(Mutex::new(cr)),
        assoc_token,
    });

    // the mapper's own object manager is part of the namespace it serves
    server.with_mapper(|m| m.add_new_objmgr(MANAGER_PATH, MAPPER_NAME));

    let _matches = subscribe_signals(&server).await?;

    {
        let cr = server.crossroads.clone();
        conn.start_receive(
            MatchRule::new_method_call(),
            Box::new(move |msg, conn| {
                let mut cr = cr.lock().unwrap();
                let _ = cr.handle_message(msg, conn);
                true
            }),
        );
    }

    initial_discovery(&server).await?;

    conn.request_name(MAPPER_NAME, false, true, false).await?;
    info!("object mapper discovery complete");

    future::pending::<()>().await;
    unreachable!()
}
