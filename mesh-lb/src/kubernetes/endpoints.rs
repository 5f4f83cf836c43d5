use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use mesh_lb_common::{L4Addr, PortName};

/// A single backend instance serving traffic for a service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub ports: BTreeMap<PortName, L4Addr>,
    pub node_name: String,
    /// Zones this backend should preferably serve, from topology hints.
    pub zone_hints: Vec<String>,
    pub terminating: bool,
}

/// Backends of a service keyed by their IP.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    pub backends: BTreeMap<IpAddr, Backend>,
}

impl Endpoints {
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// All endpoint slices of one service. Clusters still delivering the legacy
/// endpoints resource store it here under the resource name as a single
/// slice.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointSlices {
    slices: BTreeMap<String, Endpoints>,
}

impl EndpointSlices {
    pub fn upsert(&mut self, slice_name: impl Into<String>, endpoints: Endpoints) {
        self.slices.insert(slice_name.into(), endpoints);
    }

    /// Removes a slice, reporting whether the holder is now empty.
    pub fn delete(&mut self, slice_name: &str) -> bool {
        self.slices.remove(slice_name);
        self.slices.is_empty()
    }

    pub fn get(&self, slice_name: &str) -> Option<&Endpoints> {
        self.slices.get(slice_name)
    }

    /// Unions the backends of all slices. Slices are merged in name order;
    /// on an IP collision the later slice wins. A backend appearing in more
    /// than one slice has no defined owner, the ordering only makes the
    /// result reproducible.
    pub fn get_endpoints(&self) -> Endpoints {
        let mut endpoints = Endpoints::default();
        for eps in self.slices.values() {
            for (ip, backend) in &eps.backends {
                endpoints.backends.insert(*ip, backend.clone());
            }
        }
        endpoints
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use mesh_lb_common::Protocol;

    use super::*;

    fn backend(node: &str) -> Backend {
        Backend {
            ports: BTreeMap::from([("http".into(), L4Addr::new(Protocol::Tcp, 8080))]),
            node_name: node.into(),
            ..Default::default()
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 244, 0, last))
    }

    #[test]
    fn test_union_later_slice_wins() {
        let mut slices = EndpointSlices::default();
        slices.upsert(
            "foo-b",
            Endpoints {
                backends: BTreeMap::from([(ip(1), backend("node-b")), (ip(2), backend("node-b"))]),
            },
        );
        slices.upsert(
            "foo-a",
            Endpoints {
                backends: BTreeMap::from([(ip(1), backend("node-a"))]),
            },
        );

        let union = slices.get_endpoints();
        assert_eq!(union.backends.len(), 2);
        // "foo-b" sorts after "foo-a" and overrides the shared IP.
        assert_eq!(union.backends[&ip(1)].node_name, "node-b");
        assert_eq!(union.backends[&ip(2)].node_name, "node-b");
    }

    #[test]
    fn test_delete_reports_empty() {
        let mut slices = EndpointSlices::default();
        slices.upsert(
            "foo-a",
            Endpoints {
                backends: BTreeMap::from([(ip(1), backend("node-a"))]),
            },
        );
        slices.upsert("foo-b", Endpoints::default());

        assert!(!slices.delete("foo-a"));
        assert!(slices.delete("foo-b"));
        assert!(slices.get_endpoints().is_empty());
    }

    #[test]
    fn test_delete_unknown_slice() {
        let mut slices = EndpointSlices::default();
        slices.upsert("foo-a", Endpoints::default());
        assert!(!slices.delete("no-such-slice"));
    }
}
