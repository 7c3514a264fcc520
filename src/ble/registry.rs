//! Identity reconciliation for peripherals seen during a session.
//!
//! The radio stack may hand back a new object for an identifier it already
//! reported (after a stack reset, for example). Entries are compared by
//! object identity so such a replacement is detected and the session
//! delegate gets attached to the new object.

use std::collections::HashMap;

use log::debug;
use uuid::Uuid;

use super::hardware::Delegate;
use super::peripheral::PeripheralHandle;

#[derive(Default)]
pub struct PeripheralRegistry {
    peripherals: HashMap<Uuid, PeripheralHandle>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `peripheral` unless the very same object is already stored.
    ///
    /// Returns true when the entry was inserted or replaced, in which case
    /// `delegate` has been attached to the new object.
    pub fn register(
        &mut self, peripheral: &PeripheralHandle, delegate: &Delegate,
    ) -> bool {
        let id = peripheral.identifier();
        if let Some(existing) = self.peripherals.get(&id) {
            if existing.ptr_eq(peripheral) {
                return false;
            }
            debug!("Peripheral {} was replaced by the radio stack", id);
        }

        peripheral.set_delegate(Some(delegate.clone()));
        self.peripherals.insert(id, peripheral.clone());
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&PeripheralHandle> {
        self.peripherals.get(id)
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    /// Detaches the delegate from every stored peripheral and forgets them.
    pub fn clear(&mut self) {
        for peripheral in self.peripherals.values() {
            peripheral.set_delegate(None);
        }
        self.peripherals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::peripheral::{ConnectionState, Peripheral};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingPeripheral {
        id: Uuid,
        attached: AtomicUsize,
        delegate: Mutex<Option<Delegate>>,
    }

    impl Peripheral for CountingPeripheral {
        fn identifier(&self) -> Uuid {
            self.id
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Disconnected
        }

        fn name(&self) -> Option<String> {
            None
        }

        fn set_delegate(&self, delegate: Option<Delegate>) {
            if delegate.is_some() {
                self.attached.fetch_add(1, Ordering::SeqCst);
            }
            *self.delegate.lock().unwrap() = delegate;
        }
    }

    fn delegate() -> Delegate {
        let (tx, _rx) = mpsc::unbounded_channel();
        Delegate::new(1, tx)
    }

    #[test]
    fn test_same_object_registers_once() {
        let delegate = delegate();
        let mut registry = PeripheralRegistry::new();
        let object = Arc::new(CountingPeripheral::default());
        let handle: PeripheralHandle = object.clone().into();

        assert!(registry.register(&handle, &delegate));
        assert!(!registry.register(&handle.clone(), &delegate));

        assert_eq!(object.attached.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_object_for_same_identifier_replaces_entry() {
        let delegate = delegate();
        let mut registry = PeripheralRegistry::new();
        let first = Arc::new(CountingPeripheral::default());
        let second = Arc::new(CountingPeripheral::default());
        let first_handle: PeripheralHandle = first.clone().into();
        let second_handle: PeripheralHandle = second.clone().into();

        registry.register(&first_handle, &delegate);
        assert!(registry.register(&second_handle, &delegate));

        assert_eq!(first.attached.load(Ordering::SeqCst), 1);
        assert_eq!(second.attached.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&Uuid::nil()).unwrap().ptr_eq(&second_handle));
    }

    #[test]
    fn test_clear_detaches_delegates() {
        let delegate = delegate();
        let mut registry = PeripheralRegistry::new();
        let object = Arc::new(CountingPeripheral::default());
        registry.register(&object.clone().into(), &delegate);

        registry.clear();

        assert!(registry.is_empty());
        assert!(object.delegate.lock().unwrap().is_none());
    }
}
