pub mod addr;
pub mod id;

pub use addr::{
    ALL_PROTOCOLS, FrontendAddr, L4Addr, PortName, Protocol, Scope, get_ip_by_family,
    is_valid_frontend_ip,
};
pub use id::{EndpointSliceId, ServiceId};
