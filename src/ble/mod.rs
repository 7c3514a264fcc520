pub mod advertisement;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod bt_uuid;
pub mod coordinator;
mod event_bus;
pub mod hardware;
pub mod manufacturer_data;
pub mod peripheral;
mod registry;
pub mod sim_central;

pub use advertisement::{Advertisement, AdvertisementData, AdvertisementPayload};
pub use coordinator::BleCoordinator;
pub use hardware::{
    CentralSession, CentralStack, CharacteristicId, Delegate, DelegateEvent,
    RadioState, ScanFilter, SessionOptions,
};
pub use manufacturer_data::ManufacturerData;
pub use peripheral::{ConnectionState, Peripheral, PeripheralHandle};
