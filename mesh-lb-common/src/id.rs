use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a service within the cluster.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifies a single endpoint slice of a service.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointSliceId {
    pub service_id: ServiceId,
    pub slice_name: String,
}

impl EndpointSliceId {
    pub fn new(service_id: ServiceId, slice_name: impl Into<String>) -> Self {
        Self {
            service_id,
            slice_name: slice_name.into(),
        }
    }
}

impl fmt::Display for EndpointSliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.slice_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        let id = ServiceId::new("default", "foo");
        assert_eq!(id.to_string(), "default/foo");
        assert_eq!(
            EndpointSliceId::new(id, "foo-abc").to_string(),
            "default/foo/foo-abc"
        );
    }
}
