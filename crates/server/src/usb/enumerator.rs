//! QDB device enumerator
//!
//! Polls the USB bus once a second for devices advertising the QDB
//! interface, keeps a snapshot sorted by bus address, and reports plug-in
//! and unplug transitions computed by set-difference against the previous
//! snapshot.
//!
//! The poll period is measured between completions: a scan that takes long
//! delays the next one instead of overlapping it. A bus-level enumeration
//! failure produces no information for that tick; the previous snapshot is
//! kept so a transient error cannot surface as a mass unplug.

use crate::usb::access::{self, UsbError};
use crate::usb::device::{DeviceKey, UsbAddress, UsbDevice, UsbInterfaceInfo};
use common::{QDB_USB_CLASS_ID, QDB_USB_SUBCLASS_ID};
use rusb::{Context, Device};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Time between the completion of one poll and the start of the next.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Serial reported for devices that did not answer the string descriptor
/// read.
pub const UNKNOWN_SERIAL: &str = "???";

/// By convention the QDB interface lists its bulk OUT endpoint first and the
/// bulk IN endpoint second.
const OUT_ENDPOINT_INDEX: usize = 0;
const IN_ENDPOINT_INDEX: usize = 1;

/// A plug transition observed between two polls.
#[derive(Debug, Clone)]
pub enum PlugEvent<D = UsbDevice> {
    /// A device appeared on the bus
    PluggedIn(D),
    /// The device at this address disappeared
    Unplugged(UsbAddress),
}

/// Snapshot state and diffing for the enumerator.
///
/// Generic over the device type so event generation can be tested against
/// synthetic snapshot sequences.
#[derive(Debug)]
pub struct DiffTracker<D> {
    snapshot: Vec<D>,
    seeded: bool,
}

impl<D: DeviceKey + Clone> DiffTracker<D> {
    pub fn new() -> Self {
        DiffTracker {
            snapshot: Vec::new(),
            seeded: false,
        }
    }

    /// Current snapshot, sorted by bus address.
    pub fn snapshot(&self) -> &[D] {
        &self.snapshot
    }

    /// Fold one completed scan into the tracker.
    ///
    /// A failed scan leaves the snapshot untouched and yields no events.
    /// The first successful scan seeds the snapshot silently; diffing only
    /// starts once a baseline exists. Events are returned with plug-ins
    /// before unplugs, each group in ascending address order.
    pub fn apply(
        &mut self,
        scan: Result<Vec<D>, UsbError>,
        emit: bool,
    ) -> Vec<PlugEvent<D>> {
        let mut devices = match scan {
            Ok(devices) => devices,
            Err(_) => return Vec::new(),
        };
        devices.sort_by_key(|device| device.address());

        let mut events = Vec::new();
        if emit && self.seeded {
            for device in &devices {
                if !contains_address(&self.snapshot, device.address()) {
                    events.push(PlugEvent::PluggedIn(device.clone()));
                }
            }
            for device in &self.snapshot {
                if !contains_address(&devices, device.address()) {
                    events.push(PlugEvent::Unplugged(device.address()));
                }
            }
        }

        self.snapshot = devices;
        self.seeded = true;
        events
    }
}

impl<D: DeviceKey + Clone> Default for DiffTracker<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_address<D: DeviceKey>(devices: &[D], address: UsbAddress) -> bool {
    devices
        .binary_search_by_key(&address, |device| device.address())
        .is_ok()
}

/// Discovers QDB devices by polling the USB bus.
pub struct DeviceEnumerator {
    context: Context,
    poll_task: Option<JoinHandle<()>>,
    stop_sender: Option<oneshot::Sender<()>>,
}

impl DeviceEnumerator {
    /// Create an enumerator on the process-wide USB context.
    pub fn new(context: Context) -> Self {
        DeviceEnumerator {
            context,
            poll_task: None,
            stop_sender: None,
        }
    }

    /// Perform one full scan and return the discovered devices, sorted by
    /// bus address.
    ///
    /// Blocks on libusb; call from a blocking context.
    pub fn list_once(&self) -> Result<Vec<UsbDevice>, UsbError> {
        let mut devices = scan_qdb_devices(&self.context)?;
        devices.sort_by_key(|device| device.address);
        Ok(devices)
    }

    /// Start periodic polling and deliver plug events to `sink`.
    ///
    /// The first poll after this call seeds the snapshot without emitting
    /// events; diffing begins with the second poll. Calling this twice is a
    /// no-op.
    pub fn start_monitoring(&mut self, sink: mpsc::UnboundedSender<PlugEvent>) {
        if self.poll_task.is_some() {
            warn!("Device enumerator is already monitoring");
            return;
        }

        let context = self.context.clone();
        let (stop_sender, mut stop_receiver) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut tracker = DiffTracker::new();
            loop {
                let scan_context = context.clone();
                let scan = match tokio::task::spawn_blocking(move || {
                    scan_qdb_devices(&scan_context)
                })
                .await
                {
                    Ok(scan) => scan,
                    Err(e) => {
                        error!("USB scan task failed: {}", e);
                        break;
                    }
                };

                if let Err(e) = &scan {
                    error!("Could not list USB devices: {}", e);
                }

                for event in tracker.apply(scan, true) {
                    if sink.send(event).is_err() {
                        debug!("Plug event sink closed, stopping enumerator");
                        return;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = &mut stop_receiver => return,
                }
            }
        });

        self.poll_task = Some(task);
        self.stop_sender = Some(stop_sender);
    }

    /// Stop polling. No events are delivered after this returns.
    pub async fn stop_monitoring(&mut self) {
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        if let Some(task) = self.poll_task.take() {
            let _ = task.await;
        }
    }
}

/// Scan the bus for devices advertising the QDB interface.
///
/// Errors on a single device are logged and the device is skipped; only a
/// bus-level listing failure is returned to the caller.
fn scan_qdb_devices(context: &Context) -> Result<Vec<UsbDevice>, UsbError> {
    let devices = access::list_devices(context)?;

    let mut qdb_devices = Vec::new();
    for device in devices {
        match probe_device(&device) {
            Ok(Some(qdb_device)) => qdb_devices.push(qdb_device),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "Skipping device at {}: {}",
                    access::device_address(&device),
                    e
                );
            }
        }
    }
    Ok(qdb_devices)
}

/// Check one device for the QDB interface and read its serial number.
///
/// Returns `Ok(None)` for devices without the interface.
fn probe_device(device: &Device<Context>) -> Result<Option<UsbDevice>, UsbError> {
    let Some(interface_info) = find_qdb_interface(device)? else {
        return Ok(None);
    };

    let handle = access::open_device(device)?;
    let serial = match access::read_serial_number(device, &handle) {
        Ok(serial) => serial,
        Err(e) => {
            warn!(
                "Could not read serial number at {}: {}",
                access::device_address(device),
                e
            );
            UNKNOWN_SERIAL.to_string()
        }
    };

    Ok(Some(UsbDevice {
        serial,
        address: access::device_address(device),
        device: device.clone(),
        interface_info,
    }))
}

/// Find the QDB interface in the active configuration, if present.
///
/// Matches on class and subclass of altsetting 0 and picks the endpoints by
/// their conventional positions.
fn find_qdb_interface(device: &Device<Context>) -> Result<Option<UsbInterfaceInfo>, UsbError> {
    let config = access::active_config_descriptor(device)?;

    for interface in config.interfaces() {
        let Some(descriptor) = interface.descriptors().next() else {
            continue;
        };
        if descriptor.class_code() != QDB_USB_CLASS_ID
            || descriptor.sub_class_code() != QDB_USB_SUBCLASS_ID
        {
            continue;
        }

        let endpoints: Vec<_> = descriptor.endpoint_descriptors().collect();
        if endpoints.len() <= IN_ENDPOINT_INDEX {
            warn!(
                "QDB interface at {} has only {} endpoint(s)",
                access::device_address(device),
                endpoints.len()
            );
            return Ok(None);
        }

        return Ok(Some(UsbInterfaceInfo {
            interface_number: descriptor.interface_number(),
            in_address: endpoints[IN_ENDPOINT_INDEX].address(),
            out_address: endpoints[OUT_ENDPOINT_INDEX].address(),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic device for exercising the tracker without hardware.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct FakeDevice {
        address: UsbAddress,
    }

    impl DeviceKey for FakeDevice {
        fn address(&self) -> UsbAddress {
            self.address
        }
    }

    fn device(bus_number: u8, device_address: u8) -> FakeDevice {
        FakeDevice {
            address: UsbAddress {
                bus_number,
                device_address,
            },
        }
    }

    fn addresses(events: &[PlugEvent<FakeDevice>]) -> Vec<(bool, UsbAddress)> {
        events
            .iter()
            .map(|event| match event {
                PlugEvent::PluggedIn(d) => (true, d.address),
                PlugEvent::Unplugged(address) => (false, *address),
            })
            .collect()
    }

    fn scan_error() -> UsbError {
        UsbError {
            code: -1,
            message: "input/output error".to_string(),
        }
    }

    #[test]
    fn test_first_scan_seeds_without_events() {
        let mut tracker = DiffTracker::new();
        let events = tracker.apply(Ok(vec![device(1, 2), device(1, 3)]), true);
        assert!(events.is_empty());
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn test_insertions_and_removals_by_set_difference() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2), device(1, 5)]), true);

        // (1,2) stays, (1,5) leaves, (1,3) and (2,1) arrive
        let events = tracker.apply(Ok(vec![device(1, 2), device(1, 3), device(2, 1)]), true);
        assert_eq!(
            addresses(&events),
            vec![
                (
                    true,
                    UsbAddress {
                        bus_number: 1,
                        device_address: 3
                    }
                ),
                (
                    true,
                    UsbAddress {
                        bus_number: 2,
                        device_address: 1
                    }
                ),
                (
                    false,
                    UsbAddress {
                        bus_number: 1,
                        device_address: 5
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_unchanged_scan_emits_nothing() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2)]), true);
        let events = tracker.apply(Ok(vec![device(1, 2)]), true);
        assert!(events.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_regardless_of_scan_order() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(2, 1), device(1, 9), device(1, 2)]), true);

        let snapshot: Vec<UsbAddress> = tracker
            .snapshot()
            .iter()
            .map(|device| device.address)
            .collect();
        assert!(snapshot.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_errored_scan_keeps_snapshot_and_emits_nothing() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2), device(1, 3)]), true);

        let events = tracker.apply(Err(scan_error()), true);
        assert!(events.is_empty());
        assert_eq!(tracker.snapshot().len(), 2);

        // Recovery against the kept snapshot: nothing changed on the bus
        let events = tracker.apply(Ok(vec![device(1, 2), device(1, 3)]), true);
        assert!(events.is_empty());
    }

    #[test]
    fn test_empty_scan_after_error_is_a_real_removal() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2)]), true);
        tracker.apply(Err(scan_error()), true);

        // A successful empty scan is information: the device is gone
        let events = tracker.apply(Ok(vec![]), true);
        assert_eq!(
            addresses(&events),
            vec![(
                false,
                UsbAddress {
                    bus_number: 1,
                    device_address: 2
                }
            )]
        );
    }

    #[test]
    fn test_seeding_scan_without_emit_suppresses_later_duplicates() {
        // A list_once before monitoring must not replay devices as plug-ins
        // once monitoring begins.
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2)]), false);

        let events = tracker.apply(Ok(vec![device(1, 2)]), true);
        assert!(events.is_empty());
    }

    #[test]
    fn test_address_reuse_after_unplug() {
        let mut tracker = DiffTracker::new();
        tracker.apply(Ok(vec![device(1, 2)]), true);
        tracker.apply(Ok(vec![]), true);

        let events = tracker.apply(Ok(vec![device(1, 2)]), true);
        assert_eq!(
            addresses(&events),
            vec![(
                true,
                UsbAddress {
                    bus_number: 1,
                    device_address: 2
                }
            )]
        );
    }

    #[test]
    fn test_synthetic_sequence_matches_set_difference() {
        // S0 = {a}, S1 = {a, b}, S2 = {b, c}, S3 = {}
        let a = device(1, 1);
        let b = device(1, 4);
        let c = device(3, 2);
        let mut tracker = DiffTracker::new();

        assert!(tracker.apply(Ok(vec![a.clone()]), true).is_empty());

        let events = tracker.apply(Ok(vec![a.clone(), b.clone()]), true);
        assert_eq!(addresses(&events), vec![(true, b.address)]);

        let events = tracker.apply(Ok(vec![b.clone(), c.clone()]), true);
        assert_eq!(
            addresses(&events),
            vec![(true, c.address), (false, a.address)]
        );

        let events = tracker.apply(Ok(vec![]), true);
        assert_eq!(
            addresses(&events),
            vec![(false, b.address), (false, c.address)]
        );
    }
}
