use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use mesh_lb_common::{FrontendAddr, L4Addr, PortName};

use crate::kubernetes::cluster::ClusterService;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

/// Normalized view of a cluster service, as produced by the watchers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub frontend_ips: Vec<IpAddr>,
    pub ports: BTreeMap<PortName, L4Addr>,
    pub node_ports: BTreeMap<PortName, Vec<FrontendAddr>>,
    pub svc_type: ServiceType,
    pub traffic_policy: TrafficPolicy,
    /// Backend selection may prefer the node's own zone.
    pub topology_aware: bool,
    /// Backends learned from peer clusters are merged into this service.
    pub include_external: bool,
    /// This service may be published to peer clusters.
    pub shared: bool,
}

impl Service {
    /// Whether this service matches the projection of a federated service,
    /// used to skip redundant upserts when a peer cluster re-announces.
    pub fn equals_cluster_service(&self, cluster_svc: &ClusterService) -> bool {
        *self == Service::from(cluster_svc)
    }
}

impl From<&ClusterService> for Service {
    /// Projects a federated service onto a local service entry. Frontends
    /// keep their announced order de-duplicated, ports are unioned across
    /// frontends.
    fn from(cluster_svc: &ClusterService) -> Self {
        let mut ports = BTreeMap::new();
        for port_config in cluster_svc.frontends.values() {
            for (name, l4) in port_config {
                ports.insert(name.clone(), *l4);
            }
        }

        Service {
            frontend_ips: cluster_svc.frontends.keys().copied().collect(),
            ports,
            include_external: cluster_svc.include_external,
            shared: cluster_svc.shared,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use mesh_lb_common::Protocol;

    use super::*;

    fn cluster_service() -> ClusterService {
        ClusterService {
            cluster: "east".into(),
            namespace: "default".into(),
            name: "foo".into(),
            frontends: BTreeMap::from([(
                IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)),
                BTreeMap::from([("http".into(), L4Addr::new(Protocol::Tcp, 80))]),
            )]),
            backends: BTreeMap::new(),
            shared: true,
            include_external: true,
        }
    }

    #[test]
    fn test_projection_from_cluster_service() {
        let projected = Service::from(&cluster_service());

        assert_eq!(
            projected.frontend_ips,
            vec![IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1))]
        );
        assert_eq!(
            projected.ports,
            BTreeMap::from([("http".into(), L4Addr::new(Protocol::Tcp, 80))])
        );
        assert!(projected.shared);
        assert!(projected.include_external);
        assert_eq!(projected.svc_type, ServiceType::ClusterIp);
    }

    #[test]
    fn test_equals_cluster_service() {
        let cluster_svc = cluster_service();
        let mut svc = Service::from(&cluster_svc);
        assert!(svc.equals_cluster_service(&cluster_svc));

        svc.ports
            .insert("metrics".into(), L4Addr::new(Protocol::Tcp, 9090));
        assert!(!svc.equals_cluster_service(&cluster_svc));
    }
}
