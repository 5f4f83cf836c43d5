use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ahash::HashSet;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tracing::{debug, warn};

use mesh_lb_common::{
    ALL_PROTOCOLS, EndpointSliceId, FrontendAddr, PortName, Protocol, Scope, ServiceId,
    get_ip_by_family, is_valid_frontend_ip,
};

use crate::config::Config;
use crate::kubernetes::LABEL_TOPOLOGY_ZONE;
use crate::kubernetes::cluster::{ClusterService, ExternalEndpoints};
use crate::kubernetes::endpoints::{Backend, Endpoints, EndpointSlices};
use crate::kubernetes::service::{Service, ServiceType, TrafficPolicy};
use crate::swg::StoppableWaitGroup;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheAction {
    UpdateService,
    DeleteService,
}

impl fmt::Display for CacheAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheAction::UpdateService => write!(f, "service-updated"),
            CacheAction::DeleteService => write!(f, "service-deleted"),
        }
    }
}

/// Change notification emitted on the cache's event channel. The carried
/// service and endpoints are snapshots taken at emission time; consumers
/// must treat them as read-only.
#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub action: CacheAction,
    pub id: ServiceId,
    pub service: Arc<Service>,
    /// Previous service definition when an update replaced one.
    pub old_service: Option<Arc<Service>>,
    /// Endpoints correlated with the service at emission time.
    pub endpoints: Endpoints,
    /// Completion token: one `done` is owed per received event.
    pub swg: StoppableWaitGroup,
}

#[derive(Debug, Default)]
struct CacheState {
    services: ahash::HashMap<ServiceId, Arc<Service>>,
    /// Endpoint slices keyed by owning service. An entry may exist before
    /// the service definition arrives.
    endpoints: ahash::HashMap<ServiceId, EndpointSlices>,
    /// Backends learned from peer clusters, tracked independently of the
    /// local service definition.
    external_endpoints: ahash::HashMap<ServiceId, ExternalEndpoints>,
    self_node_zone_label: String,
}

/// Joins service definitions, local endpoint slices and backends federated
/// from peer clusters into one per-service view, and emits a [`ServiceEvent`]
/// whenever the correlated view of a plumbable service changes.
///
/// All operations serialize on one reader-writer lock, which is held across
/// the event send. The channel is bounded: when consumers fall behind,
/// producers block rather than drop events, so the receiver obtained from
/// [`take_receiver`](Self::take_receiver) must be drained.
pub struct ServiceCache {
    config: Config,
    events_tx: Sender<ServiceEvent>,
    events_rx: Option<Receiver<ServiceEvent>>,
    state: RwLock<CacheState>,
}

impl ServiceCache {
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = channel(config.service_cache_size.max(1));
        Self {
            config,
            events_tx,
            events_rx: Some(events_rx),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn take_receiver(&mut self) -> Option<Receiver<ServiceEvent>> {
        self.events_rx.take()
    }

    /// Inserts or replaces a service definition. A deep-equal replacement is
    /// a no-op. Emits an update when the service is ready to be plumbed.
    pub async fn update_service(
        &self,
        id: ServiceId,
        service: Service,
        swg: &StoppableWaitGroup,
    ) -> ServiceId {
        let mut state = self.state.write().await;

        if let Some(old) = state.services.get(&id)
            && old.as_ref() == &service
        {
            return id;
        }

        let service = Arc::new(service);
        let old_service = state.services.insert(id.clone(), service.clone());

        let (endpoints, ready) = self.correlate_endpoints(&state, &id);
        if ready {
            self.emit(ServiceEvent {
                action: CacheAction::UpdateService,
                id: id.clone(),
                service,
                old_service,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }

        id
    }

    /// Re-emits the current state of a service without mutating it. Returns
    /// whether an event was emitted.
    pub async fn ensure_service(&self, id: &ServiceId, swg: &StoppableWaitGroup) -> bool {
        let state = self.state.read().await;

        if let Some(service) = state.services.get(id) {
            let (endpoints, ready) = self.correlate_endpoints(&state, id);
            if ready {
                self.emit(ServiceEvent {
                    action: CacheAction::UpdateService,
                    id: id.clone(),
                    service: service.clone(),
                    old_service: Some(service.clone()),
                    endpoints,
                    swg: swg.clone(),
                })
                .await;
                return true;
            }
        }

        false
    }

    /// Removes a service definition. Pending endpoint slices are kept.
    pub async fn delete_service(&self, id: ServiceId, swg: &StoppableWaitGroup) {
        let mut state = self.state.write().await;

        let old_service = state.services.get(&id).cloned();
        let (endpoints, _) = self.correlate_endpoints(&state, &id);
        state.services.remove(&id);

        if let Some(service) = old_service {
            self.emit(ServiceEvent {
                action: CacheAction::DeleteService,
                id,
                service,
                old_service: None,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }
    }

    /// Inserts or replaces one endpoint slice. A deep-equal replacement is a
    /// no-op. Returns the owning service and the correlated endpoints.
    pub async fn update_endpoints(
        &self,
        id: EndpointSliceId,
        endpoints: Endpoints,
        swg: &StoppableWaitGroup,
    ) -> (ServiceId, Endpoints) {
        let mut state = self.state.write().await;

        if let Some(slices) = state.endpoints.get(&id.service_id)
            && slices.get(&id.slice_name) == Some(&endpoints)
        {
            return (id.service_id, endpoints);
        }

        state
            .endpoints
            .entry(id.service_id.clone())
            .or_default()
            .upsert(id.slice_name, endpoints);

        let service = state.services.get(&id.service_id).cloned();
        let (correlated, ready) = self.correlate_endpoints(&state, &id.service_id);
        if let Some(service) = service
            && ready
        {
            self.emit(ServiceEvent {
                action: CacheAction::UpdateService,
                id: id.service_id.clone(),
                service,
                old_service: None,
                endpoints: correlated.clone(),
                swg: swg.clone(),
            })
            .await;
        }

        (id.service_id, correlated)
    }

    /// Removes one endpoint slice, dropping the per-service holder once the
    /// last slice is gone. The service may be left with zero backends; the
    /// emitted update reflects that.
    pub async fn delete_endpoints(
        &self,
        id: EndpointSliceId,
        swg: &StoppableWaitGroup,
    ) -> ServiceId {
        let mut state = self.state.write().await;

        let service = state.services.get(&id.service_id).cloned();
        let now_empty = state
            .endpoints
            .get_mut(&id.service_id)
            .is_some_and(|slices| slices.delete(&id.slice_name));
        if now_empty {
            state.endpoints.remove(&id.service_id);
        }

        let (endpoints, _) = self.correlate_endpoints(&state, &id.service_id);
        if let Some(service) = service {
            self.emit(ServiceEvent {
                action: CacheAction::UpdateService,
                id: id.service_id.clone(),
                service,
                old_service: None,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }

        id.service_id
    }

    /// Merges a peer cluster's announcement of a service into the external
    /// backends. Announcements from the own cluster are ignored.
    pub async fn merge_external_service_update(
        &self,
        service: &ClusterService,
        swg: &StoppableWaitGroup,
    ) {
        if service.cluster == self.config.cluster_name {
            debug!("not merging external update for {}, own cluster", service);
            return;
        }

        let mut state = self.state.write().await;
        self.merge_service_update_locked(&mut state, service, None, swg)
            .await;
    }

    async fn merge_service_update_locked(
        &self,
        state: &mut CacheState,
        service: &ClusterService,
        old_service: Option<Arc<Service>>,
        swg: &StoppableWaitGroup,
    ) {
        let id = service.service_id();

        debug!(
            "updating external backends of {} from cluster {}",
            id, service.cluster
        );
        let backends: BTreeMap<IpAddr, Backend> = service
            .backends
            .iter()
            .map(|(ip, ports)| {
                (
                    *ip,
                    Backend {
                        ports: ports.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        state
            .external_endpoints
            .entry(id.clone())
            .or_default()
            .clusters
            .insert(service.cluster.clone(), Endpoints { backends });

        let svc = state.services.get(&id).cloned();
        let (endpoints, ready) = self.correlate_endpoints(state, &id);

        // External backends are tracked either way; they only correlate once
        // the local service is shared.
        if let Some(svc) = svc
            && svc.shared
            && ready
        {
            self.emit(ServiceEvent {
                action: CacheAction::UpdateService,
                id,
                service: svc,
                old_service,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }
    }

    /// Merges a peer cluster's withdrawal of a service. When the service
    /// stops being plumbable the update is emitted as a deletion.
    pub async fn merge_external_service_delete(
        &self,
        service: &ClusterService,
        swg: &StoppableWaitGroup,
    ) {
        if service.cluster == self.config.cluster_name {
            debug!("not merging external delete for {}, own cluster", service);
            return;
        }

        let id = service.service_id();
        let mut state = self.state.write().await;

        let Some(external) = state.external_endpoints.get_mut(&id) else {
            debug!("received delete for unknown external endpoints of {}", id);
            return;
        };
        external.clusters.remove(&service.cluster);

        let svc = state.services.get(&id).cloned();
        let (endpoints, ready) = self.correlate_endpoints(&state, &id);

        if let Some(svc) = svc
            && svc.shared
        {
            let action = if ready {
                CacheAction::UpdateService
            } else {
                CacheAction::DeleteService
            };
            self.emit(ServiceEvent {
                action,
                id,
                service: svc,
                old_service: None,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }
    }

    /// Merges an authoritative cluster service announcement: the local
    /// service entry is created or refreshed from the announcement's
    /// projection, then the external backends merge as usual.
    pub async fn merge_cluster_service_update(
        &self,
        service: &ClusterService,
        swg: &StoppableWaitGroup,
    ) {
        let id = service.service_id();
        let mut state = self.state.write().await;

        let mut old_service = None;
        let replace = match state.services.get(&id) {
            Some(svc) => !svc.equals_cluster_service(service),
            None => true,
        };
        if replace {
            debug!("upserting service {} from cluster announcement", id);
            old_service = state
                .services
                .insert(id, Arc::new(Service::from(service)));
        }

        self.merge_service_update_locked(&mut state, service, old_service, swg)
            .await;
    }

    /// Withdraws a cluster service entirely: the announcing cluster's
    /// backends and the local service entry are both removed.
    pub async fn merge_cluster_service_delete(
        &self,
        service: &ClusterService,
        swg: &StoppableWaitGroup,
    ) {
        let id = service.service_id();
        let mut state = self.state.write().await;

        if let Some(external) = state.external_endpoints.get_mut(&id) {
            debug!(
                "deleting external backends of {} from cluster {}",
                id, service.cluster
            );
            external.clusters.remove(&service.cluster);
        }

        let svc = state.services.get(&id).cloned();
        let (endpoints, _) = self.correlate_endpoints(&state, &id);
        state.services.remove(&id);

        if let Some(service) = svc {
            self.emit(ServiceEvent {
                action: CacheAction::DeleteService,
                id,
                service,
                old_service: None,
                endpoints,
                swg: swg.clone(),
            })
            .await;
        }
    }

    pub async fn on_add_node(&self, labels: &BTreeMap<String, String>, swg: &StoppableWaitGroup) {
        self.update_self_node_labels(labels, swg).await;
    }

    pub async fn on_update_node(
        &self,
        _old_labels: &BTreeMap<String, String>,
        new_labels: &BTreeMap<String, String>,
        swg: &StoppableWaitGroup,
    ) {
        self.update_self_node_labels(new_labels, swg).await;
    }

    pub async fn on_delete_node(
        &self,
        _labels: &BTreeMap<String, String>,
        _swg: &StoppableWaitGroup,
    ) {
    }

    /// Picks up the node's zone label. A change re-correlates every
    /// topology aware service, since zone filtering depends on it.
    async fn update_self_node_labels(
        &self,
        labels: &BTreeMap<String, String>,
        swg: &StoppableWaitGroup,
    ) {
        if !self.config.enable_service_topology {
            return;
        }

        let mut state = self.state.write().await;

        let zone = labels.get(LABEL_TOPOLOGY_ZONE).cloned().unwrap_or_default();
        if state.self_node_zone_label == zone {
            return;
        }
        debug!("node zone label changed to {:?}", zone);
        state.self_node_zone_label = zone;

        let topology_aware: Vec<(ServiceId, Arc<Service>)> = state
            .services
            .iter()
            .filter(|(_, svc)| svc.topology_aware)
            .map(|(id, svc)| (id.clone(), svc.clone()))
            .collect();

        for (id, service) in topology_aware {
            let (endpoints, ready) = self.correlate_endpoints(&state, &id);
            if ready {
                self.emit(ServiceEvent {
                    action: CacheAction::UpdateService,
                    id,
                    service: service.clone(),
                    old_service: Some(service),
                    endpoints,
                    swg: swg.clone(),
                })
                .await;
            }
        }
    }

    /// Returns an externally scoped address backing the service: the
    /// frontend IP matching the configured family, with any one of the
    /// service's ports.
    pub async fn get_service_ip(&self, id: &ServiceId) -> Option<FrontendAddr> {
        let state = self.state.read().await;

        let svc = state.services.get(id)?;
        if svc.frontend_ips.is_empty() || svc.ports.is_empty() {
            return None;
        }

        let ip = get_ip_by_family(&svc.frontend_ips, self.config.enable_ipv4)?;
        let (_, l4) = svc.ports.first_key_value()?;
        Some(FrontendAddr::new(ip, *l4, Scope::External))
    }

    /// Returns the frontend IP of a service constrained to a service type.
    pub async fn get_service_frontend_ip(
        &self,
        id: &ServiceId,
        svc_type: ServiceType,
    ) -> Option<IpAddr> {
        let state = self.state.read().await;

        let svc = state.services.get(id)?;
        if svc.svc_type != svc_type || svc.frontend_ips.is_empty() {
            return None;
        }

        get_ip_by_family(&svc.frontend_ips, self.config.enable_ipv4)
    }

    /// Returns, per port, every externally scoped address of the service
    /// with the given type, along with the total number of frontend IPs.
    /// Frontends that cannot carry traffic are filtered out.
    pub async fn get_service_addrs_with_type(
        &self,
        id: &ServiceId,
        svc_type: ServiceType,
    ) -> Option<(BTreeMap<PortName, Vec<FrontendAddr>>, usize)> {
        let state = self.state.read().await;

        let svc = state.services.get(id)?;
        if svc.svc_type != svc_type || svc.frontend_ips.is_empty() {
            return None;
        }

        let mut addrs_by_port = BTreeMap::new();
        for (name, l4) in &svc.ports {
            let addrs = svc
                .frontend_ips
                .iter()
                .copied()
                .filter(|ip| is_valid_frontend_ip(*ip))
                .map(|ip| FrontendAddr::new(ip, *l4, Scope::External))
                .collect();
            addrs_by_port.insert(name.clone(), addrs);
        }

        Some((addrs_by_port, svc.frontend_ips.len()))
    }

    /// Returns the union of the service's local endpoint slices, without
    /// external merging or topology filtering.
    pub async fn get_endpoints_of_service(&self, id: &ServiceId) -> Option<Endpoints> {
        let state = self.state.read().await;
        Some(state.endpoints.get(id)?.get_endpoints())
    }

    /// Enumerates every externally scoped frontend known to the cache.
    pub async fn unique_service_frontends(&self) -> FrontendList {
        let state = self.state.read().await;

        let mut frontends = FrontendList::default();
        for svc in state.services.values() {
            for ip in &svc.frontend_ips {
                for l4 in svc.ports.values() {
                    frontends.insert(&FrontendAddr::new(*ip, *l4, Scope::External));
                }
            }
            for node_port_frontends in svc.node_ports.values() {
                for frontend in node_port_frontends {
                    if frontend.scope == Scope::External {
                        frontends.insert(frontend);
                    }
                }
            }
        }

        frontends
    }

    /// Human-readable dump of the cache state.
    pub async fn debug_status(&self) -> String {
        let state = self.state.read().await;
        format!("{:#?}", *state)
    }

    /// Builds the combined endpoints of a service: the topology-filtered
    /// local backends, plus the federated backends of every peer cluster
    /// when the service opts in. Clusters merge in name order; on an IP
    /// conflict the first occurrence wins. The flag reports whether the
    /// service is ready to be plumbed: a local endpoints resource exists,
    /// even an empty one, or the merge produced backends.
    fn correlate_endpoints(&self, state: &CacheState, id: &ServiceId) -> (Endpoints, bool) {
        let mut endpoints = Endpoints::default();

        let local = state.endpoints.get(id).map(EndpointSlices::get_endpoints);
        let svc = state.services.get(id).map(Arc::as_ref);

        let has_local = local.is_some();
        if let Some(local) = local {
            let local = self.filter_endpoints(state, local, svc);
            endpoints.backends.extend(local.backends);
        }

        if let Some(svc) = svc
            && svc.include_external
            && let Some(external) = state.external_endpoints.get(id)
        {
            for (cluster, remote) in &external.clusters {
                for (ip, backend) in &remote.backends {
                    if endpoints.backends.contains_key(ip) {
                        warn!(
                            "conflicting backend IP {} for service {} from cluster {}",
                            ip, id, cluster
                        );
                    } else {
                        endpoints.backends.insert(*ip, backend.clone());
                    }
                }
            }
        }

        let ready = has_local || !endpoints.backends.is_empty();
        (endpoints, ready)
    }

    /// Keeps only local backends hinted at the node's own zone. Filtering
    /// is all-or-nothing: a single backend without hints, or a filter that
    /// would leave the service without backends, returns the full set so
    /// traffic is never black-holed. Services pinning traffic to the local
    /// node do not use hints.
    fn filter_endpoints(
        &self,
        state: &CacheState,
        local: Endpoints,
        service: Option<&Service>,
    ) -> Endpoints {
        let Some(service) = service else {
            return local;
        };
        if !self.config.enable_service_topology || !service.topology_aware {
            return local;
        }
        if state.self_node_zone_label.is_empty() {
            return local;
        }
        if service.traffic_policy == TrafficPolicy::Local {
            return local;
        }

        let mut filtered = Endpoints::default();
        for (ip, backend) in &local.backends {
            if backend.zone_hints.is_empty() {
                return local;
            }
            if backend
                .zone_hints
                .iter()
                .any(|hint| *hint == state.self_node_zone_label)
            {
                filtered.backends.insert(*ip, backend.clone());
            }
        }

        if filtered.backends.is_empty() {
            return local;
        }
        filtered
    }

    async fn emit(&self, event: ServiceEvent) {
        event.swg.add();
        if let Err(err) = self.events_tx.send(event).await {
            // The receiver is gone; balance the token so waiters drain.
            err.0.swg.done();
            warn!("dropping service event, receiver closed");
        }
    }
}

/// Protocol-qualified frontend strings of every known service.
#[derive(Clone, Debug, Default)]
pub struct FrontendList(HashSet<String>);

impl FrontendList {
    fn insert(&mut self, frontend: &FrontendAddr) {
        self.0.insert(frontend.string_with_protocol());
    }

    /// Membership test. A frontend without a protocol matches any known
    /// protocol for the same IP and port.
    pub fn loose_match(&self, mut frontend: FrontendAddr) -> bool {
        match frontend.protocol {
            Protocol::None => ALL_PROTOCOLS.into_iter().any(|protocol| {
                frontend.protocol = protocol;
                self.0.contains(&frontend.string_with_protocol())
            }),
            _ => self.0.contains(&frontend.string_with_protocol()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
