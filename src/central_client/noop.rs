use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt};

use super::{BluetoothDevice, CentralManagerClient};
use crate::ble::{Advertisement, RadioState, ScanFilter};
use crate::error::BleError;

/// Client without a radio, for previews and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCentralClient;

#[async_trait]
impl CentralManagerClient for NoopCentralClient {
    async fn enable(&self) -> RadioState {
        RadioState::PoweredOff
    }

    async fn disable(&self) {}

    async fn get_state(&self) -> BoxStream<'static, RadioState> {
        stream::empty().boxed()
    }

    async fn start_scanning(
        &self, _filter: ScanFilter,
    ) -> BoxStream<'static, Advertisement> {
        stream::empty().boxed()
    }

    async fn stop_scanning(
        &self, _selected: Option<Advertisement>,
    ) -> Option<BluetoothDevice> {
        None
    }

    async fn connect_device(
        &self, _device: BluetoothDevice,
    ) -> Result<BluetoothDevice, BleError> {
        Err(BleError::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_client_is_inert() {
        let client = NoopCentralClient;

        assert_eq!(client.enable().await, RadioState::PoweredOff);
        assert!(client.get_state().await.next().await.is_none());
        assert!(client
            .start_scanning(ScanFilter::default())
            .await
            .next()
            .await
            .is_none());
        assert!(client.stop_scanning(None).await.is_none());
    }
}
