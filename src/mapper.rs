//! The mapper state machine.
//!
//! Everything here is synchronous and bus-free: discovery results and bus
//! signals come in as plain values, queries read the cache, and bus-visible
//! side effects leave as [`Effect`] records for the serving layer to apply.
//! The serving layer keeps one instance behind a mutex, which serializes all
//! mutation the same way the bus serializes the signals driving it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::{debug, warn};

use crate::assoc::{Association, AssociationIndex, Direction, EdgeRef};
use crate::config::MapperConfig;
use crate::pathtree::{canonical_path, path_elements, PathTree};
use crate::{ASSOCIATIONS_IFACE, ASSOC_IFACE, OBJECT_MANAGER_IFACE};

/// Interfaces exported at one path, keyed by owning service. An owner never
/// maps to an empty set; the entry is dropped instead.
pub type CacheEntry = BTreeMap<String, BTreeSet<String>>;

/// Interfaces found at one path for one service, with any association
/// payload already parsed out of the property data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredObject {
    pub interfaces: BTreeSet<String>,
    pub associations: Vec<Association>,
}

/// Result of walking one service's tree.
pub type DiscoveredObjects = HashMap<String, DiscoveredObject>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapperError {
    #[error("path or object not found: {0}")]
    NotFound(String),
}

/// Bus-visible side effect recorded by a mutation. Applied by the serving
/// layer after the state lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Export a new association object.
    AssociationCreated { path: String, endpoints: Vec<String> },
    /// Change the endpoints of an exported association object, announcing
    /// the change with PropertiesChanged.
    AssociationUpdated { path: String, endpoints: Vec<String> },
    /// Remove an exported association object.
    AssociationDestroyed { path: String },
    /// Emit IntrospectionComplete for a service whose initial discovery has
    /// been fully reconciled.
    DiscoveryComplete { owner: String },
}

/// A signal postponed because its sender's initial discovery is still in
/// flight. Replayed in arrival order once the discovery result has been
/// applied.
#[derive(Debug, Clone)]
pub enum DeferredSignal {
    InterfacesAdded {
        object: String,
        manager: String,
        interfaces: BTreeSet<String>,
        associations: Vec<Association>,
    },
    InterfacesRemoved {
        object: String,
        manager: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        object: String,
        associations: Vec<Association>,
    },
}

/// Deferring more than this many signals for one owner aborts that owner's
/// discovery; its next appearance on the bus starts a fresh walk.
pub const DEFER_LIMIT: usize = 1024;

#[derive(Debug)]
pub struct Mapper {
    config: MapperConfig,
    name: String,
    cache: PathTree<CacheEntry>,
    index: AssociationIndex,
    /// Endpoints of every materialized association object, by path. This is
    /// the authoritative copy; the exported objects mirror it.
    assoc_objects: BTreeMap<String, BTreeSet<String>>,
    /// unique connection name → well-known name
    bus_map: HashMap<String, String>,
    defer_signals: HashMap<String, Vec<DeferredSignal>>,
    effects: Vec<Effect>,
}

fn has_interfaces(entry: &CacheEntry) -> bool {
    entry.values().any(|ifaces| !ifaces.is_empty())
}

impl Mapper {
    pub fn new(config: MapperConfig, name: &str) -> Self {
        Mapper {
            config,
            name: name.to_string(),
            cache: PathTree::new(),
            index: AssociationIndex::new(),
            assoc_objects: BTreeMap::new(),
            bus_map: HashMap::new(),
            defer_signals: HashMap::new(),
            effects: Vec::new(),
        }
    }

    /// Records the mapper's own connection so its signals normalize to
    /// itself and get dropped.
    pub fn set_unique_name(&mut self, unique: &str) {
        self.bus_map.insert(unique.to_string(), self.name.clone());
    }

    /// Drains the side effects recorded since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Resolves a signal sender to a well-known name. Returns `None` for the
    /// mapper's own traffic and for senders that cannot be normalized, both
    /// of which are dropped silently.
    fn normalize_sender(&self, sender: &str) -> Option<String> {
        let name = if crate::is_unique_name(sender) {
            self.bus_map.get(sender)?.as_str()
        } else {
            sender
        };
        if name == self.name {
            None
        } else {
            Some(name.to_string())
        }
    }

    // ---- discovery lifecycle ----

    /// Registers an owner about to be walked: its signals defer until
    /// [`Mapper::discovery_complete`].
    pub fn begin_discovery(&mut self, service: &str, unique: &str) {
        self.bus_map.insert(unique.to_string(), service.to_string());
        self.defer_signals.insert(service.to_string(), Vec::new());
    }

    pub fn discovering(&self, service: &str) -> bool {
        self.defer_signals.contains_key(service)
    }

    /// Applies a finished walk: the result first, as if it had arrived when
    /// the walk started, then the deferred signals in arrival order, then
    /// the completion notification.
    pub fn discovery_complete(&mut self, service: &str, objects: DiscoveredObjects) {
        if !self.defer_signals.contains_key(service) {
            // dropped mid-walk, e.g. the name changed hands
            return;
        }
        self.add_items(service, objects);
        let pending = self.defer_signals.remove(service).unwrap_or_default();
        for signal in pending {
            self.replay(service, signal);
        }
        self.effects.push(Effect::DiscoveryComplete { owner: service.to_string() });
    }

    /// Drops all traces of a failed walk so the owner's next appearance
    /// triggers a fresh one.
    pub fn discovery_failed(&mut self, service: &str) {
        self.defer_signals.remove(service);
        self.bus_map.retain(|_, known| known != service);
    }

    fn defer(&mut self, owner: &str, signal: DeferredSignal) {
        let queue = self.defer_signals.entry(owner.to_string()).or_default();
        if queue.len() >= DEFER_LIMIT {
            warn!("deferred signal overflow for {}, abandoning discovery", owner);
            self.discovery_failed(owner);
            return;
        }
        queue.push(signal);
    }

    fn replay(&mut self, owner: &str, signal: DeferredSignal) {
        match signal {
            DeferredSignal::InterfacesAdded { object, manager, interfaces, associations } => {
                self.apply_interfaces_added(owner, &object, &manager, &interfaces, &associations)
            }
            DeferredSignal::InterfacesRemoved { object, manager, interfaces } => {
                self.apply_interfaces_removed(owner, &object, &manager, &interfaces)
            }
            DeferredSignal::PropertiesChanged { object, associations } => {
                self.apply_properties_changed(owner, &object, associations)
            }
        }
    }

    // ---- signal handlers ----

    /// NameOwnerChanged from the bus daemon. Returns true when the serving
    /// layer should start a discovery walk for `(name, new)`; the caller
    /// registers the walk with [`Mapper::begin_discovery`] before yielding.
    pub fn name_owner_changed(&mut self, name: &str, old: &str, new: &str) -> bool {
        if crate::is_unique_name(name) || name == self.name {
            return false;
        }
        if !old.is_empty() {
            self.defer_signals.remove(name);
            self.bus_map.remove(old);
            self.evict_owner(name);
        }
        !new.is_empty()
    }

    /// InterfacesAdded from some peer's object manager at `manager`.
    pub fn interfaces_added(
        &mut self,
        sender: &str,
        object: &str,
        manager: &str,
        interfaces: Vec<String>,
        associations: Vec<Association>,
    ) {
        let owner = match self.normalize_sender(sender) {
            Some(owner) => owner,
            None => return,
        };
        let interfaces: BTreeSet<String> =
            interfaces.into_iter().filter(|i| self.config.interface_match(i)).collect();
        if interfaces.is_empty() {
            return;
        }
        if self.discovering(&owner) {
            self.defer(
                &owner,
                DeferredSignal::InterfacesAdded {
                    object: object.to_string(),
                    manager: manager.to_string(),
                    interfaces,
                    associations,
                },
            );
        } else {
            self.apply_interfaces_added(&owner, object, manager, &interfaces, &associations);
        }
    }

    fn apply_interfaces_added(
        &mut self,
        owner: &str,
        object: &str,
        manager: &str,
        interfaces: &BTreeSet<String>,
        associations: &[Association],
    ) {
        // no signal is ever sent for the object manager interface itself
        self.add_new_objmgr(manager, owner);
        let object = canonical_path(object);
        let old = self.interfaces_get(&object, owner);
        let new: BTreeSet<String> = old.union(interfaces).cloned().collect();
        self.update_interfaces(&object, owner, &old, &new, Some(associations));
    }

    /// InterfacesRemoved from some peer's object manager at `manager`.
    pub fn interfaces_removed(
        &mut self,
        sender: &str,
        object: &str,
        manager: &str,
        interfaces: Vec<String>,
    ) {
        let owner = match self.normalize_sender(sender) {
            Some(owner) => owner,
            None => return,
        };
        let interfaces: Vec<String> =
            interfaces.into_iter().filter(|i| self.config.interface_match(i)).collect();
        if interfaces.is_empty() {
            return;
        }
        if self.discovering(&owner) {
            self.defer(
                &owner,
                DeferredSignal::InterfacesRemoved {
                    object: object.to_string(),
                    manager: manager.to_string(),
                    interfaces,
                },
            );
        } else {
            self.apply_interfaces_removed(&owner, object, manager, &interfaces);
        }
    }

    fn apply_interfaces_removed(
        &mut self,
        owner: &str,
        object: &str,
        manager: &str,
        interfaces: &[String],
    ) {
        self.add_new_objmgr(manager, owner);
        let object = canonical_path(object);
        let old = self.interfaces_get(&object, owner);
        let new: BTreeSet<String> =
            old.iter().filter(|i| !interfaces.contains(*i)).cloned().collect();
        self.update_interfaces(&object, owner, &old, &new, None);
    }

    /// PropertiesChanged carrying a new associations list for `object`.
    pub fn properties_changed(
        &mut self,
        sender: &str,
        object: &str,
        interface: &str,
        associations: Vec<Association>,
    ) {
        let owner = match self.normalize_sender(sender) {
            Some(owner) => owner,
            None => return,
        };
        if interface != ASSOCIATIONS_IFACE || !self.config.interface_match(interface) {
            return;
        }
        if self.discovering(&owner) {
            self.defer(
                &owner,
                DeferredSignal::PropertiesChanged { object: object.to_string(), associations },
            );
        } else {
            self.apply_properties_changed(&owner, object, associations);
        }
    }

    fn apply_properties_changed(&mut self, owner: &str, object: &str, associations: Vec<Association>) {
        let object = canonical_path(object);
        let owners = [owner.to_string()];
        let old = self.index.get_associations(&object, Some(&owners), Direction::Forward);
        self.update_associations(&object, owner, &old, &associations, &[], &[]);
    }

    fn evict_owner(&mut self, owner: &str) {
        let mut snapshot: Vec<(String, BTreeSet<String>)> = Vec::new();
        if let Some(entry) = self.cache.get("/") {
            if let Some(ifaces) = entry.get(owner) {
                snapshot.push(("/".to_string(), ifaces.clone()));
            }
        }
        if let Some(items) = self.cache.items("/", 0) {
            for (path, entry) in items {
                if let Some(ifaces) = entry.get(owner) {
                    snapshot.push((path, ifaces.clone()));
                }
            }
        }
        for (path, old) in snapshot {
            self.update_interfaces(&path, owner, &old, &BTreeSet::new(), None);
        }
        debug!("evicted {} from the cache", owner);
    }

    // ---- cache core ----

    fn interfaces_get(&self, path: &str, owner: &str) -> BTreeSet<String> {
        self.cache.get(path).and_then(|entry| entry.get(owner)).cloned().unwrap_or_default()
    }

    /// Makes sure the object manager emitting a signal is itself recorded;
    /// peers never announce that interface through their own signals.
    pub fn add_new_objmgr(&mut self, path: &str, owner: &str) {
        let path = canonical_path(path);
        let old = self.interfaces_get(&path, owner);
        if old.contains(OBJECT_MANAGER_IFACE) {
            return;
        }
        let mut new = old.clone();
        new.insert(OBJECT_MANAGER_IFACE.to_string());
        self.update_interfaces(&path, owner, &old, &new, None);
    }

    /// Folds a finished walk into the cache.
    pub fn add_items(&mut self, owner: &str, objects: DiscoveredObjects) {
        for (path, object) in objects {
            if object.interfaces.is_empty() {
                continue;
            }
            self.update_interfaces(
                &canonical_path(&path),
                owner,
                &BTreeSet::new(),
                &object.interfaces,
                Some(&object.associations),
            );
        }
    }

    /// The single mutation primitive: moves `owner`'s interface set at
    /// `path` from `old` to `new`, upholding the pruning invariants, and
    /// reconciles the association graph with whatever changed.
    ///
    /// `associations` is the payload of the associations interface when one
    /// accompanied `new`; it is consulted only when that interface is in
    /// `new \ old`. Changes to an already-known associations property arrive
    /// through PropertiesChanged instead.
    pub fn update_interfaces(
        &mut self,
        path: &str,
        owner: &str,
        old: &BTreeSet<String>,
        new: &BTreeSet<String>,
        associations: Option<&[Association]>,
    ) {
        let path = canonical_path(path);
        let added: Vec<String> = new.difference(old).cloned().collect();
        let removed: Vec<String> = old.difference(new).cloned().collect();

        let (created, destroyed, entry_empty) = {
            let entry = self.cache.setdefault(&path);
            let created = !has_interfaces(entry);
            let ifaces = entry.entry(owner.to_string()).or_default();
            for iface in &added {
                ifaces.insert(iface.clone());
            }
            for iface in &removed {
                ifaces.remove(iface);
            }
            if ifaces.is_empty() {
                entry.remove(owner);
            }
            let destroyed = !has_interfaces(entry);
            (created, destroyed, entry.is_empty())
        };
        if entry_empty {
            if self.cache.has_children(&path) {
                // still referenced from further down the tree
                self.cache.demote(&path);
            } else {
                self.cache.remove(&path);
            }
        }

        let new_assoc: Vec<Association> = if added.iter().any(|i| i == ASSOCIATIONS_IFACE) {
            associations.map(|a| a.to_vec()).unwrap_or_default()
        } else {
            Vec::new()
        };
        let owners = [owner.to_string()];
        let old_assoc: Vec<Association> = if removed.iter().any(|i| i == ASSOCIATIONS_IFACE) {
            self.index.get_associations(&path, Some(&owners), Direction::Forward)
        } else {
            Vec::new()
        };
        let created: Vec<String> = if created { vec![path.clone()] } else { Vec::new() };
        let destroyed: Vec<String> = if destroyed { vec![path.clone()] } else { Vec::new() };
        self.update_associations(&path, owner, &old_assoc, &new_assoc, &created, &destroyed);
    }

    // ---- association engine ----

    /// Reconciles the association graph after `owner`'s published edge set
    /// at `path` moved from `old` to `new`, and after the paths in
    /// `created` / `destroyed` flipped existence in the cache.
    pub fn update_associations(
        &mut self,
        path: &str,
        owner: &str,
        old: &[Association],
        new: &[Association],
        created: &[String],
        destroyed: &[String],
    ) {
        let old_set: HashSet<&Association> = old.iter().collect();
        let new_set: HashSet<&Association> = new.iter().collect();

        for assoc in new.iter().filter(|a| !old_set.contains(*a)) {
            if assoc.endpoint.is_empty() {
                // skip associations without an endpoint
                continue;
            }
            self.index.append(
                Direction::Forward,
                path,
                owner,
                EdgeRef { other: assoc.endpoint.clone(), relation: assoc.reverse.clone() },
            );
            self.index.append(
                Direction::Reverse,
                &assoc.endpoint,
                owner,
                EdgeRef { other: path.to_string(), relation: assoc.forward.clone() },
            );

            if !self.path_has_interfaces(&assoc.endpoint) {
                // materialize later, when the endpoint shows up
                continue;
            }
            let forward_path = format!("{}/{}", path, assoc.forward);
            let reverse_path = format!("{}/{}", assoc.endpoint, assoc.reverse);
            self.update_association(&forward_path, &[], &[assoc.endpoint.clone()]);
            self.update_association(&reverse_path, &[], &[path.to_string()]);
        }

        for assoc in old.iter().filter(|a| !new_set.contains(*a)) {
            self.index.remove(
                Direction::Forward,
                path,
                owner,
                &EdgeRef { other: assoc.endpoint.clone(), relation: assoc.reverse.clone() },
            );
            self.index.remove(
                Direction::Reverse,
                &assoc.endpoint,
                owner,
                &EdgeRef { other: path.to_string(), relation: assoc.forward.clone() },
            );
            let forward_path = format!("{}/{}", path, assoc.forward);
            let reverse_path = format!("{}/{}", assoc.endpoint, assoc.reverse);
            self.update_association(&forward_path, &[assoc.endpoint.clone()], &[]);
            self.update_association(&reverse_path, &[path.to_string()], &[]);
        }

        for p in created {
            let arriving = self.index.get_associations(p, None, Direction::Reverse);
            for assoc in arriving {
                let forward_path = format!("{}/{}", p, assoc.forward);
                let reverse_path = format!("{}/{}", assoc.endpoint, assoc.reverse);
                self.update_association(&forward_path, &[], &[assoc.endpoint.clone()]);
                self.update_association(&reverse_path, &[], &[p.clone()]);
            }
        }

        for p in destroyed {
            let leaving = self.index.get_associations(p, None, Direction::Reverse);
            for assoc in leaving {
                let forward_path = format!("{}/{}", p, assoc.forward);
                let reverse_path = format!("{}/{}", assoc.endpoint, assoc.reverse);
                self.update_association(&forward_path, &[assoc.endpoint.clone()], &[]);
                self.update_association(&reverse_path, &[p.clone()], &[]);
            }
        }
    }

    fn path_has_interfaces(&self, path: &str) -> bool {
        self.cache.get(path).map(has_interfaces).unwrap_or(false)
    }

    /// Applies an endpoint delta to the materialized object at `path`,
    /// creating or destroying the object when its endpoint set starts or
    /// stops being empty.
    fn update_association(&mut self, path: &str, removed: &[String], added: &[String]) {
        let cur: BTreeSet<String> = self.assoc_objects.get(path).cloned().unwrap_or_default();
        let mut next = cur.clone();
        for endpoint in added {
            next.insert(endpoint.clone());
        }
        for endpoint in removed {
            next.remove(endpoint);
        }
        if cur == next {
            return;
        }

        let mapper_name = self.name.clone();
        let assoc_iface: BTreeSet<String> =
            std::iter::once(ASSOC_IFACE.to_string()).collect();
        if cur.is_empty() {
            self.assoc_objects.insert(path.to_string(), next.clone());
            self.effects.push(Effect::AssociationCreated {
                path: path.to_string(),
                endpoints: next.into_iter().collect(),
            });
            self.update_interfaces(path, &mapper_name, &BTreeSet::new(), &assoc_iface, None);
        } else if next.is_empty() {
            self.assoc_objects.remove(path);
            self.effects.push(Effect::AssociationDestroyed { path: path.to_string() });
            self.update_interfaces(path, &mapper_name, &assoc_iface, &BTreeSet::new(), None);
        } else {
            self.assoc_objects.insert(path.to_string(), next.clone());
            self.effects.push(Effect::AssociationUpdated {
                path: path.to_string(),
                endpoints: next.into_iter().collect(),
            });
        }
    }

    /// Endpoints of the materialized association object at `path`, if one
    /// exists.
    pub fn association_endpoints(&self, path: &str) -> Option<Vec<String>> {
        self.assoc_objects.get(path).map(|e| e.iter().cloned().collect())
    }

    // ---- queries ----

    fn filter_entry(entry: &CacheEntry, interfaces: &[String]) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        for (owner, ifaces) in entry {
            let kept: Vec<String> = if interfaces.is_empty() {
                ifaces.iter().cloned().collect()
            } else {
                ifaces.iter().filter(|i| interfaces.contains(*i)).cloned().collect()
            };
            if !kept.is_empty() {
                out.insert(owner.clone(), kept);
            }
        }
        out
    }

    pub fn get_object(
        &self,
        path: &str,
        interfaces: &[String],
    ) -> Result<HashMap<String, Vec<String>>, MapperError> {
        let path = canonical_path(path);
        let entry = self
            .cache
            .get(&path)
            .filter(|entry| !entry.is_empty())
            .ok_or_else(|| MapperError::NotFound(path.clone()))?;
        Ok(Self::filter_entry(entry, interfaces))
    }

    pub fn get_subtree(
        &self,
        subtree: &str,
        depth: i32,
        interfaces: &[String],
    ) -> Result<HashMap<String, HashMap<String, Vec<String>>>, MapperError> {
        let subtree = canonical_path(subtree);
        let depth = if depth > 0 { depth as usize } else { 0 };
        let items = self
            .cache
            .items(&subtree, depth)
            .ok_or_else(|| MapperError::NotFound(subtree.clone()))?;
        let mut out = HashMap::new();
        for (path, entry) in items {
            let filtered = Self::filter_entry(entry, interfaces);
            if !filtered.is_empty() {
                out.insert(path, filtered);
            }
        }
        Ok(out)
    }

    pub fn get_subtree_paths(
        &self,
        subtree: &str,
        depth: i32,
        interfaces: &[String],
    ) -> Result<Vec<String>, MapperError> {
        let subtree = canonical_path(subtree);
        let depth = if depth > 0 { depth as usize } else { 0 };
        let items = self
            .cache
            .items(&subtree, depth)
            .ok_or_else(|| MapperError::NotFound(subtree.clone()))?;
        Ok(items
            .into_iter()
            .filter(|(_, entry)| !Self::filter_entry(entry, interfaces).is_empty())
            .map(|(path, _)| path)
            .collect())
    }

    /// Every interface-bearing prefix of `path`, root included, `path`
    /// itself excluded.
    pub fn get_ancestors(
        &self,
        path: &str,
        interfaces: &[String],
    ) -> Result<HashMap<String, HashMap<String, Vec<String>>>, MapperError> {
        let path = canonical_path(path);
        if !self.path_has_interfaces(&path) {
            return Err(MapperError::NotFound(path));
        }
        let mut elements: Vec<&str> = path_elements(&path).collect();
        let mut out = HashMap::new();
        while !elements.is_empty() {
            elements.pop();
            let ancestor = if elements.is_empty() {
                "/".to_string()
            } else {
                format!("/{}", elements.join("/"))
            };
            if let Some(entry) = self.cache.get(&ancestor) {
                let filtered = Self::filter_entry(entry, interfaces);
                if !filtered.is_empty() {
                    out.insert(ancestor, filtered);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAPPER_NAME;

    fn config() -> MapperConfig {
        MapperConfig::new(
            vec!["/org/openbmc".to_string(), "/a".to_string(), "/c".to_string()],
            vec!["org.openbmc".to_string()],
            Vec::new(),
            Vec::new(),
        )
    }

    fn mapper() -> Mapper {
        let mut m = Mapper::new(config(), MAPPER_NAME);
        m.set_unique_name(":1.0");
        m
    }

    fn ifaces(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn discovered(interfaces: &[&str], associations: &[Association]) -> DiscoveredObject {
        DiscoveredObject { interfaces: ifaces(interfaces), associations: associations.to_vec() }
    }

    /// Registers an owner and completes its walk in one step.
    fn settle(m: &mut Mapper, service: &str, unique: &str, objects: &[(&str, DiscoveredObject)]) {
        m.begin_discovery(service, unique);
        let objects: DiscoveredObjects =
            objects.iter().map(|(p, o)| (p.to_string(), o.clone())).collect();
        m.discovery_complete(service, objects);
    }

    #[test]
    fn add_and_remove_interfaces() {
        let mut m = mapper();
        settle(&mut m, "org.test.S1", ":1.5", &[("/a/b", discovered(&["org.openbmc.X"], &[]))]);

        let got = m.get_object("/a/b", &[]).unwrap();
        assert_eq!(got.get("org.test.S1").unwrap(), &vec!["org.openbmc.X".to_string()]);

        m.interfaces_removed(":1.5", "/a/b", "/a", vec!["org.openbmc.X".to_string()]);
        assert_eq!(m.get_object("/a/b", &[]), Err(MapperError::NotFound("/a/b".to_string())));
        // the emitting object manager stays behind
        assert!(m.get_object("/a", &[]).is_ok());
    }

    #[test]
    fn interfaces_added_is_idempotent() {
        let mut m = mapper();
        settle(&mut m, "org.test.S1", ":1.5", &[]);
        m.interfaces_added(":1.5", "/a/b", "/a", vec!["org.openbmc.X".to_string()], Vec::new());
        let once = m.get_object("/a/b", &[]).unwrap();
        m.interfaces_added(":1.5", "/a/b", "/a", vec!["org.openbmc.X".to_string()], Vec::new());
        assert_eq!(m.get_object("/a/b", &[]).unwrap(), once);
    }

    #[test]
    fn unfiltered_signal_interfaces_are_dropped() {
        let mut m = mapper();
        settle(&mut m, "org.test.S1", ":1.5", &[]);
        m.interfaces_added(":1.5", "/a/b", "/a", vec!["com.other.Iface".to_string()], Vec::new());
        assert!(m.get_object("/a/b", &[]).is_err());
        // nothing survived the filter, so the object manager path was not
        // recorded either
        assert!(m.get_object("/a", &[]).is_err());
    }

    #[test]
    fn signals_from_strangers_and_from_the_mapper_are_dropped() {
        let mut m = mapper();
        // unknown unique name
        m.interfaces_added(":9.9", "/a/b", "/a", vec!["org.openbmc.X".to_string()], Vec::new());
        assert!(m.get_object("/a/b", &[]).is_err());
        // the mapper's own connection
        m.interfaces_added(":1.0", "/a/b", "/a", vec!["org.openbmc.X".to_string()], Vec::new());
        assert!(m.get_object("/a/b", &[]).is_err());
    }

    #[test]
    fn structural_ancestors_are_demoted_not_erased() {
        let mut m = mapper();
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[
                ("/a/b", discovered(&["org.openbmc.X"], &[])),
                ("/a/b/c", discovered(&["org.openbmc.Y"], &[])),
            ],
        );
        m.interfaces_removed(":1.5", "/a/b", "/a", vec!["org.openbmc.X".to_string()]);
        assert!(m.get_object("/a/b", &[]).is_err());
        // /a/b survives as a structural node for /a/b/c
        assert!(m.get_subtree_paths("/a/b", 0, &[]).is_ok());
        assert!(m.get_object("/a/b/c", &[]).is_ok());
    }

    #[test]
    fn signals_defer_until_discovery_completes() {
        let mut m = mapper();
        m.begin_discovery("org.test.S1", ":1.5");
        // arrives mid-walk: the walk result does not know about it yet
        m.interfaces_removed(":1.5", "/a/b", "/a", vec!["org.openbmc.X".to_string()]);
        assert!(m.get_object("/a/b", &[]).is_err());

        let mut objects = DiscoveredObjects::new();
        objects.insert("/a/b".to_string(), discovered(&["org.openbmc.X"], &[]));
        m.discovery_complete("org.test.S1", objects);

        // result applied first, deferred removal replayed after
        assert!(m.get_object("/a/b", &[]).is_err());
        let effects = m.take_effects();
        assert!(effects.contains(&Effect::DiscoveryComplete { owner: "org.test.S1".to_string() }));
    }

    #[test]
    fn defer_overflow_abandons_the_walk() {
        let mut m = mapper();
        m.begin_discovery("org.test.S1", ":1.5");
        for _ in 0..=DEFER_LIMIT {
            m.interfaces_added(
                ":1.5",
                "/a/b",
                "/a",
                vec!["org.openbmc.X".to_string()],
                Vec::new(),
            );
        }
        assert!(!m.discovering("org.test.S1"));
        // the late walk result is ignored
        let mut objects = DiscoveredObjects::new();
        objects.insert("/a/b".to_string(), discovered(&["org.openbmc.X"], &[]));
        m.discovery_complete("org.test.S1", objects);
        assert!(m.get_object("/a/b", &[]).is_err());
        assert!(m.take_effects().is_empty());
    }

    #[test]
    fn owner_loss_restores_prior_queries_on_return() {
        let mut m = mapper();
        let objects = [("/a/b", discovered(&["org.openbmc.X"], &[]))];
        settle(&mut m, "org.test.S1", ":1.5", &objects);
        let before = m.get_object("/a/b", &[]).unwrap();

        assert!(!m.name_owner_changed("org.test.S1", ":1.5", ""));
        assert!(m.get_object("/a/b", &[]).is_err());

        assert!(m.name_owner_changed("org.test.S1", "", ":1.7"));
        settle(&mut m, "org.test.S1", ":1.7", &objects);
        assert_eq!(m.get_object("/a/b", &[]).unwrap(), before);
    }

    #[test]
    fn associations_materialize_both_ends() {
        let mut m = mapper();
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[(
                "/a/b",
                discovered(
                    &["org.openbmc.X", ASSOCIATIONS_IFACE],
                    &[Association::new("fwd", "rev", "/c/d")],
                ),
            )],
        );
        // endpoint not on the bus yet
        assert_eq!(m.association_endpoints("/a/b/fwd"), None);

        settle(&mut m, "org.test.S2", ":1.6", &[("/c/d", discovered(&["org.openbmc.Y"], &[]))]);
        assert_eq!(m.association_endpoints("/a/b/fwd"), Some(vec!["/c/d".to_string()]));
        assert_eq!(m.association_endpoints("/c/d/rev"), Some(vec!["/a/b".to_string()]));

        // the synthetic objects are ordinary cache entries owned by the mapper
        let got = m.get_object("/a/b/fwd", &[]).unwrap();
        assert_eq!(got.get(MAPPER_NAME).unwrap(), &vec![ASSOC_IFACE.to_string()]);
    }

    #[test]
    fn association_updates_emit_property_changes() {
        let mut m = mapper();
        settle(&mut m, "org.test.S2", ":1.6", &[("/c/d", discovered(&["org.openbmc.Y"], &[]))]);
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[(
                "/a/b",
                discovered(&[ASSOCIATIONS_IFACE], &[Association::new("fwd", "rev", "/c/d")]),
            )],
        );
        m.take_effects();

        // a second endpoint joins the same relation
        settle(&mut m, "org.test.S3", ":1.8", &[("/c/e", discovered(&["org.openbmc.Y"], &[]))]);
        m.take_effects();
        m.properties_changed(
            ":1.5",
            "/a/b",
            ASSOCIATIONS_IFACE,
            vec![Association::new("fwd", "rev", "/c/d"), Association::new("fwd", "rev", "/c/e")],
        );
        let effects = m.take_effects();
        assert!(effects.contains(&Effect::AssociationUpdated {
            path: "/a/b/fwd".to_string(),
            endpoints: vec!["/c/d".to_string(), "/c/e".to_string()],
        }));
        assert_eq!(m.association_endpoints("/c/e/rev"), Some(vec!["/a/b".to_string()]));

        // and drops out again
        m.properties_changed(
            ":1.5",
            "/a/b",
            ASSOCIATIONS_IFACE,
            vec![Association::new("fwd", "rev", "/c/d")],
        );
        let effects = m.take_effects();
        assert!(effects.contains(&Effect::AssociationDestroyed { path: "/c/e/rev".to_string() }));
        assert_eq!(m.association_endpoints("/a/b/fwd"), Some(vec!["/c/d".to_string()]));
    }

    #[test]
    fn empty_endpoints_are_skipped() {
        let mut m = mapper();
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[(
                "/a/b",
                discovered(&[ASSOCIATIONS_IFACE], &[Association::new("fwd", "rev", "")]),
            )],
        );
        assert_eq!(m.association_endpoints("/a/b/fwd"), None);
    }

    #[test]
    fn query_filters() {
        let mut m = mapper();
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[("/a/b", discovered(&["org.openbmc.X", "org.openbmc.Z"], &[]))],
        );

        let filter = vec!["org.openbmc.Z".to_string()];
        let got = m.get_object("/a/b", &filter).unwrap();
        assert_eq!(got.get("org.test.S1").unwrap(), &vec!["org.openbmc.Z".to_string()]);

        let filter = vec!["org.openbmc.Missing".to_string()];
        assert!(m.get_object("/a/b", &filter).unwrap().is_empty());
        assert!(m.get_subtree("/", 0, &filter).unwrap().is_empty());
        assert_eq!(m.get_subtree_paths("/", 0, &filter).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn ancestors_walk_interface_bearing_prefixes() {
        let mut m = mapper();
        settle(
            &mut m,
            "org.test.S1",
            ":1.5",
            &[
                ("/a", discovered(&["org.openbmc.A"], &[])),
                ("/a/b/c", discovered(&["org.openbmc.C"], &[])),
            ],
        );
        let got = m.get_ancestors("/a/b/c", &[]).unwrap();
        let mut paths: Vec<&str> = got.keys().map(|s| s.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a"]);
        assert!(!got.contains_key("/a/b/c"));

        // structural /a/b does not satisfy the existence check
        assert!(m.get_ancestors("/a/b", &[]).is_err());
        assert!(m.get_ancestors("/missing", &[]).is_err());
    }
}
