use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use mesh_lb_common::{L4Addr, PortName, ServiceId};

use crate::Result;
use crate::kubernetes::ClusterName;
use crate::kubernetes::endpoints::Endpoints;

pub type PortConfiguration = BTreeMap<PortName, L4Addr>;

/// A service as announced by a peer cluster through the federated store.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterService {
    pub cluster: ClusterName,
    pub namespace: String,
    pub name: String,

    pub frontends: BTreeMap<IpAddr, PortConfiguration>,
    pub backends: BTreeMap<IpAddr, PortConfiguration>,

    pub shared: bool,
    pub include_external: bool,
}

impl ClusterService {
    pub fn service_id(&self) -> ServiceId {
        ServiceId::new(&self.namespace, &self.name)
    }

    /// Decodes the wire form used by the federated service store.
    pub fn try_from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for ClusterService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// Backends a service has accumulated from peer clusters, keyed by cluster
/// name. The map is ordered so that merges resolve IP conflicts the same
/// way on every node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExternalEndpoints {
    pub(crate) clusters: BTreeMap<ClusterName, Endpoints>,
}

impl ExternalEndpoints {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use mesh_lb_common::Protocol;

    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let service = ClusterService {
            cluster: "east".into(),
            namespace: "default".into(),
            name: "foo".into(),
            frontends: BTreeMap::from([(
                IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)),
                BTreeMap::from([("http".into(), L4Addr::new(Protocol::Tcp, 80))]),
            )]),
            backends: BTreeMap::from([(
                IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
                BTreeMap::from([("http".into(), L4Addr::new(Protocol::Tcp, 8080))]),
            )]),
            shared: true,
            include_external: true,
        };

        let data = serde_json::to_vec(&service).unwrap();
        let decoded = ClusterService::try_from_json(&data).unwrap();
        assert_eq!(decoded, service);
        assert_eq!(decoded.to_string(), "east/default/foo");
        assert_eq!(decoded.service_id(), ServiceId::new("default", "foo"));
    }

    #[test]
    fn test_rejects_malformed_payload() {
        assert!(ClusterService::try_from_json(b"{not json").is_err());
    }
}
