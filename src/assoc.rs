//! The bidirectional association index.
//!
//! Services publish associations as `(forward, reverse, endpoint)` triples.
//! The index stores each triple twice: once under the publishing path in the
//! forward table and once under the endpoint in the reverse table, so either
//! end can be looked up when a path appears, changes or disappears. Entries
//! are symbolic lookup records, not ownership edges; the objects the mapper
//! materializes from them are tracked separately.

use std::collections::HashMap;

/// A directed labeled edge between two object paths, as published by a
/// service: the publisher reaches `endpoint` under the name `forward`, and
/// `endpoint` reaches the publisher back under the name `reverse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Association {
    pub forward: String,
    pub reverse: String,
    pub endpoint: String,
}

impl Association {
    pub fn new(forward: &str, reverse: &str, endpoint: &str) -> Self {
        Association {
            forward: forward.to_string(),
            reverse: reverse.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// One half of an edge as stored in a table: the far end of the edge plus
/// the relation name under which the far end reaches back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRef {
    pub other: String,
    pub relation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

type Table = HashMap<String, HashMap<String, Vec<EdgeRef>>>;

#[derive(Debug, Default)]
pub struct AssociationIndex {
    forward: Table,
    reverse: Table,
}

impl AssociationIndex {
    pub fn new() -> Self {
        Default::default()
    }

    fn table(&self, direction: Direction) -> &Table {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Reverse => &self.reverse,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut Table {
        match direction {
            Direction::Forward => &mut self.forward,
            Direction::Reverse => &mut self.reverse,
        }
    }

    pub fn append(&mut self, direction: Direction, path: &str, owner: &str, edge: EdgeRef) {
        self.table_mut(direction)
            .entry(path.to_string())
            .or_default()
            .entry(owner.to_string())
            .or_default()
            .push(edge);
    }

    /// Removes one instance of `edge`, pruning emptied owner and path slots.
    pub fn remove(&mut self, direction: Direction, path: &str, owner: &str, edge: &EdgeRef) {
        let table = self.table_mut(direction);
        if let Some(owners) = table.get_mut(path) {
            if let Some(edges) = owners.get_mut(owner) {
                if let Some(pos) = edges.iter().position(|e| e == edge) {
                    edges.remove(pos);
                }
                if edges.is_empty() {
                    owners.remove(owner);
                }
            }
            if owners.is_empty() {
                table.remove(path);
            }
        }
    }

    fn owners(&self, direction: Direction, path: &str) -> Vec<String> {
        self.table(direction)
            .get(path)
            .map(|owners| owners.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn edges(&self, direction: Direction, path: &str, owners: &[String]) -> Vec<EdgeRef> {
        let mut out = Vec::new();
        if let Some(map) = self.table(direction).get(path) {
            for owner in owners {
                if let Some(edges) = map.get(owner) {
                    out.extend(edges.iter().cloned());
                }
            }
        }
        out
    }

    /// Recovers the association triples rooted at `path`, restricted to
    /// `owners` when given. With `Direction::Forward`, `path` is the
    /// publisher and the triples come back as published; with
    /// `Direction::Reverse`, `path` is an endpoint and the triples describe
    /// the edges arriving at it, with forward and reverse swapped
    /// accordingly. Recovered triples whose far entry does not point back at
    /// `path` are dropped; that catches stale cross-owner entries.
    pub fn get_associations(
        &self,
        path: &str,
        owners: Option<&[String]>,
        direction: Direction,
    ) -> Vec<Association> {
        let (near, far) = match direction {
            Direction::Forward => (Direction::Forward, Direction::Reverse),
            Direction::Reverse => (Direction::Reverse, Direction::Forward),
        };
        let owners: Vec<String> = match owners {
            Some(o) => o.to_vec(),
            None => self.owners(near, path),
        };
        let mut out = Vec::new();
        for r in self.edges(near, path, &owners) {
            for f in self.edges(far, &r.other, &owners) {
                if f.other != path {
                    continue;
                }
                out.push(Association {
                    forward: f.relation.clone(),
                    reverse: r.relation.clone(),
                    endpoint: r.other.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(index: &mut AssociationIndex, owner: &str, path: &str, assoc: &Association) {
        index.append(
            Direction::Forward,
            path,
            owner,
            EdgeRef { other: assoc.endpoint.clone(), relation: assoc.reverse.clone() },
        );
        index.append(
            Direction::Reverse,
            &assoc.endpoint,
            owner,
            EdgeRef { other: path.to_string(), relation: assoc.forward.clone() },
        );
    }

    #[test]
    fn recovers_published_triples() {
        let mut index = AssociationIndex::new();
        let assoc = Association::new("fwd", "rev", "/c/d");
        link(&mut index, "org.test.A", "/a/b", &assoc);

        let got = index.get_associations("/a/b", None, Direction::Forward);
        assert_eq!(got, vec![assoc.clone()]);

        let owners = ["org.test.A".to_string()];
        let got = index.get_associations("/a/b", Some(&owners), Direction::Forward);
        assert_eq!(got, vec![assoc]);
    }

    #[test]
    fn reverse_lookup_swaps_relations() {
        let mut index = AssociationIndex::new();
        link(&mut index, "org.test.A", "/a/b", &Association::new("fwd", "rev", "/c/d"));

        let got = index.get_associations("/c/d", None, Direction::Reverse);
        assert_eq!(got, vec![Association::new("rev", "fwd", "/a/b")]);
    }

    #[test]
    fn drops_entries_pointing_elsewhere() {
        let mut index = AssociationIndex::new();
        link(&mut index, "org.test.A", "/a/b", &Association::new("fwd", "rev", "/c/d"));
        // a second publisher reaching the same endpoint must not leak into
        // the first publisher's recovered triples
        link(&mut index, "org.test.A", "/x/y", &Association::new("fwd2", "rev", "/c/d"));

        let got = index.get_associations("/a/b", None, Direction::Forward);
        assert_eq!(got, vec![Association::new("fwd", "rev", "/c/d")]);
    }

    #[test]
    fn remove_prunes_empty_slots() {
        let mut index = AssociationIndex::new();
        let assoc = Association::new("fwd", "rev", "/c/d");
        link(&mut index, "org.test.A", "/a/b", &assoc);

        index.remove(
            Direction::Forward,
            "/a/b",
            "org.test.A",
            &EdgeRef { other: "/c/d".to_string(), relation: "rev".to_string() },
        );
        index.remove(
            Direction::Reverse,
            "/c/d",
            "org.test.A",
            &EdgeRef { other: "/a/b".to_string(), relation: "fwd".to_string() },
        );

        assert!(index.get_associations("/a/b", None, Direction::Forward).is_empty());
        assert!(index.get_associations("/c/d", None, Direction::Reverse).is_empty());
        assert!(index.forward.is_empty());
        assert!(index.reverse.is_empty());
    }
}
