//! Namespace and blacklist filters bounding what the mapper tracks.

use crate::{MAPPER_PATH, OBJECT_MANAGER_IFACE};

/// Which paths and interfaces the mapper watches. Matching is by substring:
/// a path is interesting when it shares a namespace with the watch list in
/// either direction, so both the ancestors and the descendants of a watched
/// namespace get walked.
#[derive(Debug, Clone, Default)]
pub struct MapperConfig {
    pub path_namespaces: Vec<String>,
    pub interface_namespaces: Vec<String>,
    pub path_blacklist: Vec<String>,
    pub interface_blacklist: Vec<String>,
}

impl MapperConfig {
    /// The mapper's own object path is always blacklisted; everything else
    /// comes from the command line.
    pub fn new(
        path_namespaces: Vec<String>,
        interface_namespaces: Vec<String>,
        mut path_blacklist: Vec<String>,
        interface_blacklist: Vec<String>,
    ) -> Self {
        path_blacklist.push(MAPPER_PATH.to_string());
        MapperConfig { path_namespaces, interface_namespaces, path_blacklist, interface_blacklist }
    }

    pub fn path_match(&self, path: &str) -> bool {
        if self.path_blacklist.iter().any(|b| path.contains(b.as_str())) {
            return false;
        }
        self.path_namespaces.iter().any(|ns| path.contains(ns.as_str()) || ns.contains(path))
    }

    pub fn interface_match(&self, interface: &str) -> bool {
        if self.interface_blacklist.iter().any(|b| interface.contains(b.as_str())) {
            return false;
        }
        self.interface_namespaces.iter().any(|ns| interface.contains(ns.as_str()))
    }

    /// Filter applied to everything entering the cache. The object manager
    /// interface is tracked unconditionally so subtree enumeration keeps
    /// working even when no configured namespace covers it.
    pub fn ingest_match(&self, interface: &str) -> bool {
        interface == OBJECT_MANAGER_IFACE || self.interface_match(interface)
    }
}
