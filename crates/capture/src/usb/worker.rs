//! URB reap thread
//!
//! Dedicated thread that waits on the device for completed URBs and hands
//! each one to the transport for dispatch. The wait is bounded so the
//! running flag is checked regularly; stopping is cooperative.

use crate::usb::transfers::{ReapError, classify_reap_errno};
use crate::usb::transport::{Reaped, TransportShared};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on one reap wait
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after an unexpected reap error, so a persistent one cannot spin
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Spawn the reap thread for `shared`
pub(crate) fn spawn_reaper(shared: Arc<TransportShared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("urb-reaper".into())
        .spawn(move || ReapWorker { shared }.run())
}

struct ReapWorker {
    shared: Arc<TransportShared>,
}

impl ReapWorker {
    /// Reap until stopped or the device goes away
    fn run(self) {
        info!("URB reap thread started");

        let mut device_lost = false;
        while self.shared.running.load(Ordering::Acquire) {
            match self.shared.fs.reap_urb(REAP_POLL_INTERVAL) {
                Ok(Some(urb)) => {
                    if let Reaped::Fatal(status) = self.shared.complete(urb) {
                        error!("URB completed with fatal status {}, stopping transport", status);
                        device_lost = true;
                        break;
                    }
                }
                Ok(None) => {
                    // Timed out, check the running flag again
                }
                Err(e) => match classify_reap_errno(e) {
                    ReapError::Transient => debug!("Reap interrupted: {}", e),
                    ReapError::Fatal => {
                        error!("Reap failed: {}, device lost", e);
                        device_lost = true;
                        break;
                    }
                    ReapError::Other => {
                        warn!("Reap failed: {}", e);
                        self.shared.stats.record_transient_error();
                        thread::sleep(ERROR_BACKOFF);
                    }
                },
            }
        }

        if device_lost {
            // dropped here, outside the transport lock
            drop(self.shared.on_fatal());
        }
        info!("URB reap thread stopped");
    }
}
