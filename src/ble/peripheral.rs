//! Peripheral capability shared by hardware-backed and in-memory devices.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::hardware::Delegate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
    Disconnecting,
    Unknown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// The fixed capability set the coordinator and the store rely on.
pub trait Peripheral: Send + Sync + 'static {
    fn identifier(&self) -> Uuid;

    fn connection_state(&self) -> ConnectionState;

    fn name(&self) -> Option<String>;

    /// Routes the per-peripheral callbacks (service, characteristic and value
    /// updates) of this object to `delegate`. `None` detaches it.
    fn set_delegate(&self, _delegate: Option<Delegate>) {}
}

/// Cloneable handle over a peripheral object.
///
/// Equality compares the observable capability (identifier, connection
/// state, name); `ptr_eq` compares object identity.
#[derive(Clone)]
pub struct PeripheralHandle(Arc<dyn Peripheral>);

impl PeripheralHandle {
    pub fn new(peripheral: Arc<dyn Peripheral>) -> Self {
        Self(peripheral)
    }

    pub fn identifier(&self) -> Uuid {
        self.0.identifier()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.0.connection_state()
    }

    pub fn name(&self) -> Option<String> {
        self.0.name()
    }

    pub fn ptr_eq(&self, other: &PeripheralHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_delegate(&self, delegate: Option<Delegate>) {
        self.0.set_delegate(delegate)
    }
}

impl<P: Peripheral> From<Arc<P>> for PeripheralHandle {
    fn from(peripheral: Arc<P>) -> Self {
        Self(peripheral)
    }
}

impl PartialEq for PeripheralHandle {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier()
            && self.connection_state() == other.connection_state()
            && self.name() == other.name()
    }
}

impl fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("identifier", &self.identifier())
            .field("state", &self.connection_state())
            .field("name", &self.name())
            .finish()
    }
}

#[derive(Serialize)]
struct PeripheralSummary {
    id: Uuid,
    name: Option<String>,
    state: ConnectionState,
}

impl Serialize for PeripheralHandle {
    fn serialize<S: Serializer>(
        &self, serializer: S,
    ) -> Result<S::Ok, S::Error> {
        PeripheralSummary {
            id: self.identifier(),
            name: self.name(),
            state: self.connection_state(),
        }
        .serialize(serializer)
    }
}

/// In-memory peripheral for tests and previews.
#[derive(Debug)]
pub struct FakePeripheral {
    identifier: Uuid,
    state: Mutex<ConnectionState>,
    name: Mutex<Option<String>>,
}

impl FakePeripheral {
    pub fn new(identifier: Uuid) -> Self {
        Self {
            identifier,
            state: Mutex::new(ConnectionState::Disconnected),
            name: Mutex::new(None),
        }
    }

    pub fn named(identifier: Uuid, name: &str) -> Self {
        let peripheral = Self::new(identifier);
        peripheral.set_name(Some(name.to_string()));
        peripheral
    }

    pub fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    pub fn set_name(&self, name: Option<String>) {
        if let Ok(mut current) = self.name.lock() {
            *current = name;
        }
    }
}

impl Default for FakePeripheral {
    fn default() -> Self {
        Self::new(Uuid::nil())
    }
}

impl Peripheral for FakePeripheral {
    fn identifier(&self) -> Uuid {
        self.identifier
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Unknown)
    }

    fn name(&self) -> Option<String> {
        self.name.lock().ok().and_then(|name| name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_compare_capabilities() {
        let id = Uuid::new_v4();
        let lhs: PeripheralHandle = Arc::new(FakePeripheral::named(id, "A")).into();
        let rhs: PeripheralHandle = Arc::new(FakePeripheral::named(id, "A")).into();

        assert_eq!(lhs, rhs);
        assert!(!lhs.ptr_eq(&rhs));
        assert!(lhs.ptr_eq(&lhs.clone()));
    }

    #[test]
    fn test_any_capability_change_breaks_equality() {
        let id = Uuid::new_v4();
        let fake = Arc::new(FakePeripheral::named(id, "A"));
        let lhs: PeripheralHandle = fake.clone().into();
        let rhs: PeripheralHandle = Arc::new(FakePeripheral::named(id, "A")).into();

        fake.set_state(ConnectionState::Connected);
        assert_ne!(lhs, rhs);

        fake.set_state(ConnectionState::Disconnected);
        fake.set_name(Some("B".to_string()));
        assert_ne!(lhs, rhs);

        let other: PeripheralHandle =
            Arc::new(FakePeripheral::named(Uuid::new_v4(), "A")).into();
        assert_ne!(rhs, other);
    }

    #[test]
    fn test_serialize_summary() {
        let id = Uuid::nil();
        let handle: PeripheralHandle =
            Arc::new(FakePeripheral::named(id, "Thermo")).into();

        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "00000000-0000-0000-0000-000000000000",
                "name": "Thermo",
                "state": "disconnected",
            })
        );
    }
}
