//! Device/client façade consumed by the state container.

mod live;
mod noop;

pub use live::LiveCentralClient;
pub use noop::NoopCentralClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::ble::{Advertisement, PeripheralHandle, RadioState, ScanFilter};
use crate::error::BleError;
use crate::store::identified::Identified;

/// A peripheral the user picked, identified by the peripheral identifier.
///
/// Serializes as `{"id", "name", "state"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BluetoothDevice {
    pub peripheral: PeripheralHandle,
}

impl BluetoothDevice {
    pub fn new(peripheral: PeripheralHandle) -> Self {
        Self { peripheral }
    }
}

impl Identified for BluetoothDevice {
    type Id = Uuid;

    fn id(&self) -> Uuid {
        self.peripheral.identifier()
    }
}

impl Identified for Advertisement {
    type Id = Uuid;

    fn id(&self) -> Uuid {
        self.uuid
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CentralManagerClient: Send + Sync + 'static {
    /// Starts a fresh radio session and returns its current state.
    async fn enable(&self) -> RadioState;

    async fn disable(&self);

    async fn get_state(&self) -> BoxStream<'static, RadioState>;

    async fn start_scanning(
        &self, filter: ScanFilter,
    ) -> BoxStream<'static, Advertisement>;

    /// Stops scanning and resolves the device behind `selected`, if any.
    async fn stop_scanning(
        &self, selected: Option<Advertisement>,
    ) -> Option<BluetoothDevice>;

    async fn connect_device(
        &self, device: BluetoothDevice,
    ) -> Result<BluetoothDevice, BleError>;
}
