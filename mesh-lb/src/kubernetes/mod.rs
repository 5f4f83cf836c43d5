pub mod cache;
pub mod cluster;
pub mod endpoints;
pub mod service;

/// Node label consulted for topology aware backend filtering.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

pub type ClusterName = String;
