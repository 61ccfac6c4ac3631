//! Parsing of introspection XML into the two things the mapper cares about:
//! the interfaces a node exports and the names of its direct children.

use std::io;

use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, XmlEvent};

/// Failure to make sense of a peer's introspection data.
#[derive(Debug, thiserror::Error)]
pub enum IntrospectError {
    #[error("invalid introspection XML: {0}")]
    Xml(#[from] xml::reader::Error),
    #[error("invalid introspection XML: {0}")]
    Layout(&'static str),
}

/// Interfaces and direct children of one introspected node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntrospectNode {
    pub interfaces: Vec<String>,
    pub children: Vec<String>,
}

fn find_attr<'a>(attrs: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attrs.iter().find(|a| a.name.local_name == name).map(|a| a.value.as_str())
}

/// Extracts the interface names and child node names from one node's
/// introspection document. Grandchildren advertised inside child nodes are
/// ignored; the walker reaches them through their own Introspect call.
pub fn parse_introspection(data: &str) -> Result<IntrospectNode, IntrospectError> {
    let mut node = IntrospectNode::default();
    let mut node_depth = 0usize;
    for event in EventReader::new(io::Cursor::new(data)) {
        match event? {
            XmlEvent::StartElement { name, attributes, .. } => match name.local_name.as_str() {
                "node" => {
                    node_depth += 1;
                    if node_depth == 2 {
                        match find_attr(&attributes, "name") {
                            Some(n) if !n.is_empty() => node.children.push(n.to_string()),
                            Some(_) => (),
                            None => return Err(IntrospectError::Layout("child node without a name")),
                        }
                    }
                }
                "interface" if node_depth == 1 => {
                    let n = find_attr(&attributes, "name")
                        .ok_or(IntrospectError::Layout("interface without a name"))?;
                    node.interfaces.push(n.to_string());
                }
                _ => (),
            },
            XmlEvent::EndElement { name } if name.local_name == "node" => {
                if node_depth == 0 {
                    return Err(IntrospectError::Layout("unbalanced node element"));
                }
                node_depth -= 1;
            }
            _ => (),
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interfaces_and_children() {
        let xml = r#"
            <node>
              <interface name="org.freedesktop.DBus.Introspectable">
                <method name="Introspect"><arg name="data" type="s" direction="out"/></method>
              </interface>
              <interface name="org.openbmc.Example"/>
              <node name="child_a"/>
              <node name="child_b"/>
            </node>"#;
        let node = parse_introspection(xml).unwrap();
        assert_eq!(
            node.interfaces,
            vec!["org.freedesktop.DBus.Introspectable".to_string(), "org.openbmc.Example".to_string()]
        );
        assert_eq!(node.children, vec!["child_a".to_string(), "child_b".to_string()]);
    }

    #[test]
    fn ignores_nested_grandchildren() {
        let xml = r#"
            <node>
              <node name="child">
                <interface name="org.openbmc.Inner"/>
                <node name="grandchild"/>
              </node>
            </node>"#;
        let node = parse_introspection(xml).unwrap();
        assert!(node.interfaces.is_empty());
        assert_eq!(node.children, vec!["child".to_string()]);
    }

    #[test]
    fn empty_document_is_empty() {
        let node = parse_introspection("<node/>").unwrap();
        assert_eq!(node, IntrospectNode::default());
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse_introspection("<node><interface").is_err());
        assert!(parse_introspection("not xml at all").is_err());
    }
}
