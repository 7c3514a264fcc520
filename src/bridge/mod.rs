//! Outbound notifications to the JavaScript side of a web view.

use std::sync::Arc;

use log::{debug, error};
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::central_client::BluetoothDevice;
use crate::error::Result;

pub const DEVICE_SELECTED_HANDLER: &str = "onDeviceSelected";

#[derive(Debug, Clone, PartialEq)]
pub enum JsBridgeAction {
    DidSelectDevice(BluetoothDevice),
}

#[cfg_attr(test, automock)]
pub trait JsBridge: Send + Sync + 'static {
    fn send(&self, action: JsBridgeAction);
}

/// Whatever carries a named call with a JSON payload into the page.
pub trait BridgeTransport: Send + Sync + 'static {
    fn call(&self, handler: &str, data: Value) -> Result<()>;
}

impl<F> BridgeTransport for F
where
    F: Fn(&str, Value) -> Result<()> + Send + Sync + 'static,
{
    fn call(&self, handler: &str, data: Value) -> Result<()> {
        self(handler, data)
    }
}

pub struct WebViewBridge<T> {
    transport: T,
    device_selected_handler: String,
}

impl<T: BridgeTransport> WebViewBridge<T> {
    pub fn new(transport: T) -> Self {
        Self::with_handler(transport, DEVICE_SELECTED_HANDLER)
    }

    pub fn with_handler(transport: T, device_selected_handler: &str) -> Self {
        Self {
            transport,
            device_selected_handler: device_selected_handler.to_string(),
        }
    }
}

impl<T: BridgeTransport> JsBridge for WebViewBridge<T> {
    fn send(&self, action: JsBridgeAction) {
        let (handler, data) = match action {
            JsBridgeAction::DidSelectDevice(device) => {
                (self.device_selected_handler.as_str(), json!({ "device": device }))
            }
        };

        debug!("Calling bridge handler {}", handler);
        if let Err(e) = self.transport.call(handler, data) {
            error!("Error calling bridge handler {}: {:?}", handler, e);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBridge;

impl JsBridge for NoopBridge {
    fn send(&self, _action: JsBridgeAction) {}
}

impl<B: JsBridge + ?Sized> JsBridge for Arc<B> {
    fn send(&self, action: JsBridgeAction) {
        (**self).send(action)
    }
}
