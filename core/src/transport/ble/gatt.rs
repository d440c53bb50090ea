/// GATT service definition for BLE messaging
///
/// Endpoints are the characteristics of the service. Each one carries a
/// capability set that decides which operation kinds it may carry, so the core
/// dispatches on capabilities instead of per-characteristic hook overrides.

use crate::transport::abstraction::{EndpointId, LinkError};
use crate::transport::ble::framing::{OperationKind, STATUS_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Primary service UUID
pub const GATT_SERVICE_UUID: Uuid = Uuid::from_u128(0x7b1c_0001_4e3a_4c5d_9f2e_1a6b_8c3d_5e70);

/// Command characteristic (write + indicate)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x7b1c_0002_4e3a_4c5d_9f2e_1a6b_8c3d_5e70);

/// Connection type characteristic (read + indicate)
pub const CONN_TYPE_CHAR_UUID: Uuid = Uuid::from_u128(0x7b1c_0003_4e3a_4c5d_9f2e_1a6b_8c3d_5e70);

/// Device info characteristic (read + indicate)
pub const DEV_INFO_CHAR_UUID: Uuid = Uuid::from_u128(0x7b1c_0004_4e3a_4c5d_9f2e_1a6b_8c3d_5e70);

/// Device status characteristic (read + indicate)
pub const DEV_STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x7b1c_0005_4e3a_4c5d_9f2e_1a6b_8c3d_5e70);

/// Default characteristic operation limit in bytes
pub const DEFAULT_MTU: usize = 20;

/// Default payload bytes per chunk
pub const DEFAULT_MAX_CHUNK_SIZE: usize = DEFAULT_MTU - STATUS_SIZE;

/// What a characteristic can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    Indicate,
}

impl Capability {
    /// Operation kind carried by this capability
    pub fn operation(&self) -> OperationKind {
        match self {
            Capability::Read => OperationKind::ReadResponse,
            Capability::Write => OperationKind::Write,
            Capability::Indicate => OperationKind::Indicate,
        }
    }
}

/// Which side of the link this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// GATT server: receives writes, sends indications and read responses
    Peripheral,
    /// GATT client: sends writes, receives indications and read responses
    Central,
}

impl Role {
    /// Whether chunks of `kind` flow towards this role
    pub fn receives(&self, kind: OperationKind) -> bool {
        match self {
            Role::Peripheral => kind == OperationKind::Write,
            Role::Central => kind != OperationKind::Write,
        }
    }
}

/// One logical channel (characteristic)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Characteristic UUID
    pub id: EndpointId,
    /// Human-readable name for logs
    pub name: String,
    capabilities: Vec<Capability>,
    /// Payload bytes per chunk (MTU minus status byte)
    pub max_chunk_size: usize,
}

impl Endpoint {
    pub fn new(id: EndpointId, name: impl Into<String>, capabilities: &[Capability]) -> Self {
        let mut caps = Vec::with_capacity(capabilities.len());
        for cap in capabilities {
            if !caps.contains(cap) {
                caps.push(*cap);
            }
        }
        Self {
            id,
            name: name.into(),
            capabilities: caps,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    /// Derive the chunk size from a characteristic MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.max_chunk_size = mtu.saturating_sub(STATUS_SIZE);
        self
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether this endpoint may carry chunks of `kind`
    pub fn accepts(&self, kind: OperationKind) -> bool {
        self.capabilities.iter().any(|c| c.operation() == kind)
    }

    /// Whether a central should subscribe to this endpoint
    pub fn is_consumable(&self) -> bool {
        self.has(Capability::Indicate)
    }
}

/// Endpoints registered for a service, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
    index: HashMap<EndpointId, usize>,
}

impl EndpointRegistry {
    /// Build a registry, rejecting duplicate identifiers and empty chunk sizes
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, LinkError> {
        let mut index = HashMap::with_capacity(endpoints.len());
        for (i, endpoint) in endpoints.iter().enumerate() {
            if endpoint.max_chunk_size == 0 {
                return Err(LinkError::InvalidConfig(format!(
                    "endpoint {} has zero chunk size",
                    endpoint.name
                )));
            }
            if index.insert(endpoint.id, i).is_some() {
                return Err(LinkError::InvalidConfig(format!(
                    "duplicate endpoint {}",
                    endpoint.id
                )));
            }
        }
        Ok(Self { endpoints, index })
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.index.get(id).map(|&i| &self.endpoints[i])
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.endpoints.iter().map(|e| e.id).collect()
    }

    /// Endpoints a central subscribes to after discovery
    pub fn consumable(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.is_consumable())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// The default service: one command channel and three state channels
pub fn default_endpoints(mtu: usize) -> Vec<Endpoint> {
    vec![
        Endpoint::new(
            COMMAND_CHAR_UUID,
            "command",
            &[Capability::Write, Capability::Indicate],
        )
        .with_mtu(mtu),
        Endpoint::new(
            CONN_TYPE_CHAR_UUID,
            "conn-type",
            &[Capability::Read, Capability::Indicate],
        )
        .with_mtu(mtu),
        Endpoint::new(
            DEV_INFO_CHAR_UUID,
            "dev-info",
            &[Capability::Read, Capability::Indicate],
        )
        .with_mtu(mtu),
        Endpoint::new(
            DEV_STATUS_CHAR_UUID,
            "dev-status",
            &[Capability::Read, Capability::Indicate],
        )
        .with_mtu(mtu),
    ]
}
