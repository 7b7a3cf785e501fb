//! Finding the bootloader again after a buttonless jump.
//!
//! Bootloaders without bond sharing advertise under the application's
//! address with the last octet incremented. The scan accepts the first
//! advertisement the matcher likes, or gives up after the timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::control::DfuController;
use crate::traits::{Advertisement, DeviceAddress, Scanner};

/// Decides whether an advertisement belongs to the device being updated.
pub type AddressMatcher = Arc<dyn Fn(&DeviceAddress, &Advertisement) -> bool + Send + Sync>;

/// Match the original address or its incremented form.
pub fn default_matcher() -> AddressMatcher {
    Arc::new(|original: &DeviceAddress, advertisement: &Advertisement| {
        advertisement.address == *original || advertisement.address == original.incremented()
    })
}

/// Scan for the bootloader of `original`.
///
/// Returns `None` when nothing matched in time, or when the scan could not
/// start; the caller then reconnects at the original address.
pub async fn rediscover<S: Scanner>(
    scanner: &mut S,
    original: DeviceAddress,
    matcher: &AddressMatcher,
    timeout: Duration,
    controller: &DfuController,
) -> Option<DeviceAddress> {
    info!(
        address = %original,
        incremented = %original.incremented(),
        timeout_ms = timeout.as_millis() as u64,
        "Scanning for bootloader"
    );

    if let Err(e) = scanner.start().await {
        warn!(error = %e, "Scan could not be started");
        return None;
    }

    let scan = async {
        while let Some(advertisement) = scanner.next_advertisement().await {
            debug!(
                address = %advertisement.address,
                name = advertisement.name.as_deref().unwrap_or(""),
                rssi = advertisement.rssi,
                "Advertisement"
            );
            if matcher(&original, &advertisement) {
                return Some(advertisement.address);
            }
        }
        None
    };

    let found = tokio::select! {
        result = tokio::time::timeout(timeout, scan) => result.unwrap_or_else(|_| {
            info!("Bootloader not found before the timeout");
            None
        }),
        _ = controller.aborted() => {
            debug!("Scan aborted");
            None
        }
    };

    if let Err(e) = scanner.stop().await {
        warn!(error = %e, "Scan could not be stopped");
    }
    if let Some(address) = found {
        info!(%address, "Bootloader found");
    }
    found
}
