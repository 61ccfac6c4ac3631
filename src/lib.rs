//! D-Bus object path mapper.
//!
//! Services on a message bus export objects in a shared hierarchical
//! namespace. The mapper walks every peer's introspection tree once, then
//! tracks bus signals to keep an in-memory mirror of
//! `path → {service → interfaces}` current, so clients can ask "who owns this
//! path?" without introspecting the world themselves. On top of the mirror it
//! maintains a bidirectional association graph whose edges appear on the bus
//! as objects owned by the mapper.
//!
//! The daemon lives in [`server`]; [`mapper`] holds the state machine, which
//! is fully driveable without a bus connection. [`client`] contains typed
//! bindings for programs consuming the mapper.

pub mod assoc;
pub mod client;
pub mod config;
pub mod discover;
pub mod introspect;
pub mod mapper;
pub mod pathtree;
pub mod server;

use std::time::Duration;

/// Well-known name the mapper claims once initial discovery has settled.
pub const MAPPER_NAME: &str = "org.openbmc.objectmapper";

/// Interface carrying the query methods.
pub const MAPPER_IFACE: &str = "org.openbmc.objectmapper.ObjectMapper";

/// Interface carrying the IntrospectionComplete signal.
pub const MAPPER_PRIVATE_IFACE: &str = "org.openbmc.objectmapper.ObjectMapper.Private";

/// Object path of the mapper object itself.
pub const MAPPER_PATH: &str = "/org/openbmc/objectmapper/objectmapper";

/// Path of the mapper's object manager, under which materialized
/// association objects are announced.
pub const MANAGER_PATH: &str = "/org/openbmc";

/// Interface under which services publish an `associations` property.
pub const ASSOCIATIONS_IFACE: &str = "org.openbmc.Associations";

/// Interface of the association objects the mapper materializes. Carries a
/// single `endpoints` property.
pub const ASSOC_IFACE: &str = "org.openbmc.Association";

/// The standard object manager interface; always tracked, regardless of the
/// configured interface namespaces.
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Error name returned when a queried path or object is unknown.
pub const NOT_FOUND_ERROR: &str = "org.freedesktop.DBus.Error.FileNotFound";

/// Timeout for the asynchronous calls the mapper makes to its peers.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// True for connection-scoped names assigned by the bus daemon.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

/// Errors the bus reports when a peer is momentarily overloaded. Callers
/// retry these with a bounded backoff. `ObjectPathInUse` nominally describes
/// a server-side path collision, but the deployed fleet emits it for "busy";
/// the mapper keeps that interpretation for compatibility.
pub fn is_busy_error(e: &dbus::Error) -> bool {
    matches!(
        e.name(),
        Some("org.freedesktop.DBus.Error.ObjectPathInUse")
            | Some("org.freedesktop.DBus.Error.LimitsExceeded")
    )
}

/// Errors meaning the peer vanished mid-call or never answered. Discovery
/// abandons the owner; signal handling discards the event.
pub fn is_transient_error(e: &dbus::Error) -> bool {
    matches!(
        e.name(),
        Some("org.freedesktop.DBus.Error.ServiceUnknown")
            | Some("org.freedesktop.DBus.Error.NameHasNoOwner")
            | Some("org.freedesktop.DBus.Error.NoReply")
            | Some("org.freedesktop.DBus.Error.Timeout")
            | Some("org.freedesktop.DBus.Error.Disconnected")
    )
}

/// Errors meaning "this object has no such properties", returned by peers
/// that export an interface without implementing the properties interface
/// for it. Treated as an empty property set.
pub fn is_no_properties_error(e: &dbus::Error) -> bool {
    matches!(
        e.name(),
        Some("org.freedesktop.DBus.Error.UnknownInterface")
            | Some("org.freedesktop.DBus.Error.UnknownMethod")
            | Some("org.freedesktop.DBus.Error.UnknownProperty")
            | Some("org.freedesktop.DBus.Error.InvalidArgs")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names() {
        assert!(is_unique_name(":1.5"));
        assert!(!is_unique_name("org.openbmc.managers.System"));
    }

    #[test]
    fn error_classification() {
        let busy = dbus::Error::new_custom("org.freedesktop.DBus.Error.ObjectPathInUse", "busy");
        assert!(is_busy_error(&busy));
        assert!(!is_transient_error(&busy));

        let gone = dbus::Error::new_custom("org.freedesktop.DBus.Error.ServiceUnknown", "gone");
        assert!(is_transient_error(&gone));
        assert!(!is_busy_error(&gone));

        let noprops =
            dbus::Error::new_custom("org.freedesktop.DBus.Error.UnknownInterface", "no props");
        assert!(is_no_properties_error(&noprops));
        assert!(!is_transient_error(&noprops));
    }
}
