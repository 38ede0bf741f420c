//! Device manager
//!
//! Sole owner of the live device connections. Consumes the enumerator's
//! plug events, establishes a transport per device, and publishes
//! `DeviceInformation` records and connect/disconnect events to subscribers
//! (the host servlets).
//!
//! Snapshots and subscriptions are taken under one lock so a watcher sees
//! every device exactly once: first in the replayed snapshot or later as an
//! event, never both.

use crate::transport::{DeviceTransport, TransportFactory};
use crate::usb::{PlugEvent, UsbAddress, UsbDevice};
use protocol::DeviceInformation;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Capacity of the event channel towards the servlets. A servlet that lags
/// this far behind is disconnected.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change in the set of connected devices.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A device finished transport setup and is available
    NewDevice(DeviceInformation),
    /// The device with this serial was disconnected
    DisconnectedDevice { serial: String },
}

struct ManagedDevice {
    info: DeviceInformation,
    transport: Arc<Mutex<Box<dyn DeviceTransport>>>,
}

struct Inner {
    // Sorted by address so snapshots come out in bus order
    devices: BTreeMap<UsbAddress, ManagedDevice>,
}

/// Owns the set of known devices and fans their lifecycle out to watchers.
pub struct DeviceManager {
    inner: Mutex<Inner>,
    events: broadcast::Sender<DeviceEvent>,
    transports: Arc<dyn TransportFactory>,
}

impl DeviceManager {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        DeviceManager {
            inner: Mutex::new(Inner {
                devices: BTreeMap::new(),
            }),
            events,
            transports,
        }
    }

    /// Snapshot of the known devices, in bus address order.
    pub fn list_devices(&self) -> Vec<DeviceInformation> {
        let inner = self.inner.lock().expect("device list lock poisoned");
        inner
            .devices
            .values()
            .map(|device| device.info.clone())
            .collect()
    }

    /// Snapshot the device list and subscribe to subsequent events in one
    /// step.
    ///
    /// The two are atomic with respect to device changes: an event is either
    /// reflected in the snapshot or delivered to the receiver, never both
    /// and never neither.
    pub fn watch(&self) -> (Vec<DeviceInformation>, broadcast::Receiver<DeviceEvent>) {
        let inner = self.inner.lock().expect("device list lock poisoned");
        let snapshot = inner
            .devices
            .values()
            .map(|device| device.info.clone())
            .collect();
        let receiver = self.events.subscribe();
        (snapshot, receiver)
    }

    /// Transport handle for the device with this serial, if connected.
    ///
    /// Used by executors outside the discovery core.
    pub fn lookup_by_serial(&self, serial: &str) -> Option<Arc<Mutex<Box<dyn DeviceTransport>>>> {
        let inner = self.inner.lock().expect("device list lock poisoned");
        inner
            .devices
            .values()
            .find(|device| device.info.serial == serial)
            .map(|device| device.transport.clone())
    }

    /// Establish a transport for a newly plugged-in device and publish it.
    ///
    /// Transport setup runs on the blocking pool; a failure is logged and
    /// the device is dropped without publication.
    pub async fn plugged_in(&self, device: UsbDevice) {
        let serial = device.serial.clone();
        let address = device.address;

        let transports = self.transports.clone();
        let established =
            tokio::task::spawn_blocking(move || transports.establish(device)).await;

        match established {
            Ok(Ok(transport)) => self.add_device(serial, address, transport),
            Ok(Err(e)) => {
                warn!("Could not set up transport for {}: {}", address, e);
            }
            Err(e) => {
                warn!("Transport setup task for {} failed: {}", address, e);
            }
        }
    }

    /// Record an established device and publish `NewDevice`.
    pub fn add_device(
        &self,
        serial: String,
        address: UsbAddress,
        transport: Box<dyn DeviceTransport>,
    ) {
        let info = DeviceInformation {
            serial,
            host_mac: transport.host_mac(),
            ip_address: transport.ip_address(),
        };

        let mut inner = self.inner.lock().expect("device list lock poisoned");
        if inner.devices.contains_key(&address) {
            warn!("Replacing device already known at {}", address);
        }
        inner.devices.insert(
            address,
            ManagedDevice {
                info: info.clone(),
                transport: Arc::new(Mutex::new(transport)),
            },
        );
        info!("Device connected: {} at {}", info.serial, address);
        // Publish while holding the lock so watchers never observe a gap
        // between snapshot and event stream.
        let _ = self.events.send(DeviceEvent::NewDevice(info));
    }

    /// Tear down the device at `address` and publish `DisconnectedDevice`.
    ///
    /// The transport is fully released before the event goes out.
    pub fn remove_device(&self, address: UsbAddress) {
        let mut inner = self.inner.lock().expect("device list lock poisoned");
        let Some(device) = inner.devices.remove(&address) else {
            debug!("Unplug for unknown device at {}", address);
            return;
        };

        device
            .transport
            .lock()
            .expect("transport lock poisoned")
            .close();

        let serial = device.info.serial.clone();
        info!("Device disconnected: {} at {}", serial, address);
        let _ = self.events.send(DeviceEvent::DisconnectedDevice { serial });
    }

    /// Consume the enumerator's event stream until it closes.
    pub async fn run(self: Arc<Self>, mut plug_events: mpsc::UnboundedReceiver<PlugEvent>) {
        while let Some(event) = plug_events.recv().await {
            match event {
                PlugEvent::PluggedIn(device) => self.plugged_in(device).await,
                PlugEvent::Unplugged(address) => self.remove_device(address),
            }
        }
        debug!("Plug event stream ended");
    }
}
