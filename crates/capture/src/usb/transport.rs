//! Asynchronous URB transport
//!
//! Keeps isochronous and bulk URBs permanently queued on a usbfs device. A
//! single reap thread (see [`super::worker`]) hands every completion to
//! [`TransportShared::complete`], which runs the owner's callback and queues
//! the URB again.
//!
//! All URB bookkeeping sits behind one mutex. Callbacks run while it is
//! held, so they must not call back into the transport.
//!
//! URB memory is only freed once the URB has been reaped. URBs that cannot be
//! reaped at shutdown are parked in a graveyard that outlives the device file:
//! closing the file makes the kernel cancel them for good.

use crate::usb::continuation::{
    BulkCompletion, ContinuationGroup, GroupState, GroupStep, TransferControl, TransferId,
    member_flags, member_spans,
};
use crate::usb::error::{Result, TransportError};
use crate::usb::transfers::{ReapError, UrbStatus, classify_reap_errno, classify_status, continuation_count};
use crate::usb::urb::{IsoTransfer, Urb, UrbBuffer, UrbKey, UrbRole, UrbState};
use crate::usb::usbfs::{CAP_BULK_SCATTER_GATHER, MAX_TRANSFER, RawUrb, UsbFs};
use crate::usb::worker;
use common::CaptureStats;
use nix::errno::Errno;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Isochronous completion callback, run on the reap thread
pub type IsoCallback = Box<dyn FnMut(&IsoTransfer<'_>) + Send>;

/// How long shutdown waits for discarded URBs to come back
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Shape of the isochronous URB pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoConfig {
    /// URBs kept in flight
    pub count: usize,
    /// IN endpoint address
    pub endpoint: u8,
    /// Bytes per iso packet (the endpoint's max packet size)
    pub packet_size: usize,
    /// Iso packets per URB
    pub packets_per_transfer: usize,
}

/// Result of dispatching one reaped URB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reaped {
    Handled,
    /// The device is gone; carries the status that said so
    Fatal(i32),
}

#[derive(Default)]
pub(crate) struct UrbBook {
    urbs: HashMap<UrbKey, Urb>,
    groups: HashMap<TransferId, ContinuationGroup>,
    iso_keys: Vec<UrbKey>,
    iso_callback: Option<IsoCallback>,
    graveyard: Vec<Urb>,
    buffer_graveyard: Vec<UrbBuffer>,
    next_key: u64,
    next_transfer: u64,
}

impl UrbBook {
    fn alloc_key(&mut self) -> UrbKey {
        self.next_key += 1;
        UrbKey(self.next_key)
    }

    fn pending(&self, only_retired: bool) -> usize {
        self.urbs
            .values()
            .filter(|urb| urb.is_pending() && (!only_retired || urb.retired))
            .count()
    }

    fn discard_members(&mut self, fs: &dyn UsbFs, id: TransferId) {
        let Some(group) = self.groups.get(&id) else {
            return;
        };
        for key in &group.members {
            if let Some(urb) = self.urbs.get_mut(key)
                && let Err(e) = urb.discard(fs)
            {
                debug!("Discard of {} member failed: {}", id, e);
            }
        }
    }

    /// Submit every member of a group in order
    ///
    /// On failure the members already queued are discarded and the group is
    /// killed; it is freed once they have been reaped. With `notify` the
    /// callback is told the errno before the group is killed.
    fn submit_group(
        &mut self,
        fs: &dyn UsbFs,
        id: TransferId,
        notify: bool,
    ) -> std::result::Result<(), Errno> {
        let Some(group) = self.groups.get_mut(&id) else {
            return Ok(());
        };
        group.rearm();

        let mut failure = None;
        for i in 0..group.members.len() {
            let key = group.members[i];
            let Some(urb) = self.urbs.get_mut(&key) else {
                continue;
            };
            match urb.submit(fs) {
                Ok(()) => group.member_submitted(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(errno) = failure else {
            return Ok(());
        };
        if notify {
            report(group, Err(-(errno as i32)));
        }
        group.state = GroupState::Killed;
        if group.outstanding == 0 {
            self.free_group(id);
        } else {
            self.discard_members(fs, id);
        }
        Err(errno)
    }

    /// Drop a group whose members are all back
    fn free_group(&mut self, id: TransferId) {
        if let Some(group) = self.groups.remove(&id) {
            for key in &group.members {
                self.urbs.remove(key);
            }
            trace!("Freed {}", id);
        }
    }

    /// Move URBs the kernel still holds into the graveyard
    fn bury(&mut self, only_retired: bool) -> usize {
        let keys: Vec<UrbKey> = self
            .urbs
            .iter()
            .filter(|(_, urb)| urb.is_pending() && (!only_retired || urb.retired))
            .map(|(key, _)| *key)
            .collect();

        let mut buried = 0;
        for key in keys {
            let Some(urb) = self.urbs.remove(&key) else {
                // went down with its group
                continue;
            };
            if let UrbRole::Bulk { transfer, .. } = urb.role
                && let Some(group) = self.groups.remove(&transfer)
            {
                for member in &group.members {
                    if let Some(sibling) = self.urbs.remove(member) {
                        self.graveyard.push(sibling);
                        buried += 1;
                    }
                }
                self.buffer_graveyard.push(group.buffer);
            }
            self.graveyard.push(urb);
            buried += 1;
        }
        buried
    }
}

/// State shared between the transport handle and its reap thread
pub(crate) struct TransportShared {
    // Declared first so the device closes before the book frees URB memory
    pub(crate) fs: Arc<dyn UsbFs>,
    book: Mutex<UrbBook>,
    pub(crate) running: AtomicBool,
    stopped: AtomicBool,
    pub(crate) stats: Arc<CaptureStats>,
    scatter_gather: bool,
}

impl TransportShared {
    fn lock_book(&self) -> MutexGuard<'_, UrbBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completions are delivered and URBs requeued only while live
    fn is_live(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    fn clear_halt(&self, endpoint: u8) {
        match self.fs.clear_halt(endpoint) {
            Ok(()) => {
                self.stats.record_stall_cleared();
                debug!("Cleared halt on {:#04x}", endpoint);
            }
            Err(e) => warn!("Failed to clear halt on {:#04x}: {}", endpoint, e),
        }
    }

    /// Dispatch a URB handed back by the kernel
    pub(crate) fn complete(&self, header: NonNull<RawUrb>) -> Reaped {
        // SAFETY: the kernel is done with a reaped URB
        let context = unsafe { ptr::addr_of!((*header.as_ptr()).usercontext).read() };
        let key = UrbKey::from_context(context);

        let mut guard = self.lock_book();
        let book = &mut *guard;
        let Some(urb) = book.urbs.get_mut(&key) else {
            warn!("Reaped unknown URB {:?}", key);
            return Reaped::Handled;
        };

        let was_discarding = urb.state == UrbState::Discarding;
        urb.state = UrbState::Idle;
        let role = urb.role;
        if urb.retired {
            book.urbs.remove(&key);
            return Reaped::Handled;
        }

        match role {
            UrbRole::Iso => self.complete_iso(book, key, was_discarding),
            UrbRole::Bulk { transfer, index } => self.complete_bulk(book, key, transfer, index),
        }
    }

    fn complete_iso(&self, book: &mut UrbBook, key: UrbKey, was_discarding: bool) -> Reaped {
        let live = self.is_live() && !was_discarding;
        let UrbBook {
            urbs, iso_callback, ..
        } = book;
        let Some(urb) = urbs.get_mut(&key) else {
            return Reaped::Handled;
        };

        let status = urb.status();
        match classify_status(status) {
            UrbStatus::Success | UrbStatus::Short => {
                if live {
                    let transfer = urb.iso_view();
                    self.stats.record_urb_reaped(transfer.actual_length() as u64);
                    // the guard only helps with `panic = "unwind"`; release builds abort
                    if let Some(callback) = iso_callback.as_mut()
                        && panic::catch_unwind(AssertUnwindSafe(|| callback(&transfer))).is_err()
                    {
                        error!("Isochronous callback panicked");
                    }
                }
            }
            UrbStatus::Stall => self.clear_halt(urb.endpoint()),
            UrbStatus::Transient => {
                self.stats.record_transient_error();
                trace!("Iso URB on {:#04x} completed with {}", urb.endpoint(), status);
            }
            UrbStatus::Cancelled => {}
            UrbStatus::Fatal => return Reaped::Fatal(status),
        }

        if live && let Err(e) = urb.submit(&*self.fs) {
            self.stats.record_resubmit_failure();
            if matches!(e, Errno::ENODEV | Errno::ESHUTDOWN) {
                return Reaped::Fatal(-(e as i32));
            }
            warn!("Failed to resubmit isochronous URB: {}", e);
        }
        Reaped::Handled
    }

    fn complete_bulk(&self, book: &mut UrbBook, key: UrbKey, id: TransferId, index: usize) -> Reaped {
        let Some(urb) = book.urbs.get(&key) else {
            return Reaped::Handled;
        };
        let status = urb.status();
        let actual = urb.actual_length();
        let endpoint = urb.endpoint();

        let class = classify_status(status);
        match class {
            UrbStatus::Success | UrbStatus::Short => self.stats.record_urb_reaped(actual as u64),
            UrbStatus::Stall => self.clear_halt(endpoint),
            UrbStatus::Transient => self.stats.record_transient_error(),
            UrbStatus::Cancelled | UrbStatus::Fatal => {}
        }

        let Some(group) = book.groups.get_mut(&id) else {
            warn!("URB {:?} belongs to unknown transfer {}", key, id);
            book.urbs.remove(&key);
            return Reaped::Handled;
        };

        match group.member_reaped(index, class, status, actual) {
            GroupStep::Wait => {}
            GroupStep::DiscardSiblings => {
                debug!("{} member {} ended with {}, cancelling siblings", id, index, status);
                book.discard_members(&*self.fs, id);
            }
            GroupStep::Finalize(result) => self.finalize_group(book, id, result),
            GroupStep::Free => book.free_group(id),
            GroupStep::Fatal(status) => {
                report(group, Err(status));
                if group.outstanding == 0 {
                    book.free_group(id);
                } else {
                    book.discard_members(&*self.fs, id);
                }
                return Reaped::Fatal(status);
            }
        }
        Reaped::Handled
    }

    /// Report a group's result and requeue the whole group if wanted
    fn finalize_group(&self, book: &mut UrbBook, id: TransferId, result: std::result::Result<usize, i32>) {
        let Some(group) = book.groups.get_mut(&id) else {
            return;
        };
        let control = report(group, result);

        if control == TransferControl::Continue && self.is_live() {
            if let Err(e) = book.submit_group(&*self.fs, id, true) {
                self.stats.record_resubmit_failure();
                warn!("Failed to resubmit {}: {}", id, e);
            }
        } else {
            book.free_group(id);
        }
    }

    /// Mark the transport stopped after the device went away
    ///
    /// Every live bulk transfer is told once. Returns the iso callback so
    /// the caller can drop it outside the lock.
    pub(crate) fn on_fatal(&self) -> Option<IsoCallback> {
        self.stopped.store(true, Ordering::Release);
        let mut book = self.lock_book();
        for group in book.groups.values_mut() {
            if matches!(group.state, GroupState::Active | GroupState::Completing(_)) {
                report(group, Err(-(Errno::ENODEV as i32)));
                group.state = GroupState::Dead;
            }
        }
        book.iso_callback.take()
    }

    /// Reap until nothing (or nothing retired) is pending, then bury the rest
    ///
    /// Only called while no reap thread is running.
    fn drain(&self, only_retired: bool) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self.lock_book().pending(only_retired) > 0 && Instant::now() < deadline {
            match self.fs.reap_urb(DRAIN_POLL) {
                Ok(Some(urb)) => {
                    self.complete(urb);
                }
                Ok(None) => {}
                Err(e) if classify_reap_errno(e) == ReapError::Fatal => break,
                Err(e) => trace!("Reap during drain failed: {}", e),
            }
        }

        let buried = self.lock_book().bury(only_retired);
        if buried > 0 {
            warn!("{} URBs still queued, parked until the device closes", buried);
        }
    }

    /// Cancel everything in flight and wait for it to come back
    fn quiesce(&self) {
        {
            let mut guard = self.lock_book();
            let book = &mut *guard;
            for urb in book.urbs.values_mut() {
                if let Err(e) = urb.discard(&*self.fs) {
                    debug!("Discard failed: {}", e);
                }
            }
        }
        self.drain(false);
    }
}

/// Run a group's callback, treating a panic as a request to stop
///
/// Panics are only caught when unwinding; the release profile aborts.
fn report(group: &mut ContinuationGroup, result: std::result::Result<usize, i32>) -> TransferControl {
    let id = group.id;
    panic::catch_unwind(AssertUnwindSafe(|| group.report(result))).unwrap_or_else(|_| {
        error!("Callback for {} panicked", id);
        TransferControl::Stop
    })
}

/// Owner of every URB queued on one device
pub struct UrbTransport {
    shared: Arc<TransportShared>,
    reaper: Option<JoinHandle<()>>,
}

impl UrbTransport {
    pub fn new(fs: Arc<dyn UsbFs>, stats: Arc<CaptureStats>) -> Self {
        let scatter_gather = match fs.capabilities() {
            Ok(caps) => caps & CAP_BULK_SCATTER_GATHER != 0,
            Err(e) => {
                debug!("Capability query failed ({}), assuming no scatter-gather", e);
                false
            }
        };
        debug!("Bulk scatter-gather: {}", scatter_gather);

        Self {
            shared: Arc::new(TransportShared {
                fs,
                book: Mutex::new(UrbBook::default()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stats,
                scatter_gather,
            }),
            reaper: None,
        }
    }

    /// The device this transport queues URBs on
    pub fn device(&self) -> &Arc<dyn UsbFs> {
        &self.shared.fs
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.shared.stats
    }

    pub fn supports_scatter_gather(&self) -> bool {
        self.shared.scatter_gather
    }

    /// The reap thread is running and the device is still there
    pub fn is_running(&self) -> bool {
        self.reaper.is_some() && self.shared.is_live()
    }

    /// A fatal error ended the transport; the owner must tear down
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// URBs currently held by the kernel
    pub fn in_flight(&self) -> usize {
        self.shared.lock_book().pending(false)
    }

    /// Allocate and queue the isochronous URB pool
    ///
    /// All or nothing: if any URB is refused, the ones already queued are
    /// cancelled and nothing is left running.
    pub fn init_isochronous<F>(&self, config: IsoConfig, callback: F) -> Result<()>
    where
        F: FnMut(&IsoTransfer<'_>) + Send + 'static,
    {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if config.count == 0 || config.packets_per_transfer == 0 || config.packet_size == 0 {
            return Err(TransportError::InvalidParams(
                "isochronous transfer count, packet count and packet size must be non-zero",
            ));
        }
        if config.endpoint & 0x80 == 0 {
            return Err(TransportError::InvalidParams("isochronous endpoint must be an IN endpoint"));
        }

        let fs = &*self.shared.fs;
        let mut guard = self.shared.lock_book();
        let book = &mut *guard;
        if !book.iso_keys.is_empty() {
            return Err(TransportError::IsoActive);
        }

        let mut urbs = Vec::with_capacity(config.count);
        for _ in 0..config.count {
            let key = book.alloc_key();
            urbs.push(Urb::iso(
                key,
                config.endpoint,
                config.packet_size,
                config.packets_per_transfer,
            )?);
        }
        let keys: Vec<UrbKey> = urbs.iter().map(Urb::key).collect();
        for urb in urbs {
            book.urbs.insert(urb.key(), urb);
        }
        book.iso_callback = Some(Box::new(callback));

        let mut failure = None;
        for (i, key) in keys.iter().enumerate() {
            let Some(urb) = book.urbs.get_mut(key) else {
                continue;
            };
            if let Err(e) = urb.submit(fs) {
                warn!("Isochronous URB {} of {} refused: {}", i + 1, config.count, e);
                failure = Some(e);
                break;
            }
        }

        let Some(errno) = failure else {
            book.iso_keys = keys;
            info!(
                "{} isochronous URBs of {}x{} bytes queued on {:#04x}",
                config.count, config.packets_per_transfer, config.packet_size, config.endpoint
            );
            return Ok(());
        };

        for key in &keys {
            let pending = match book.urbs.get_mut(key) {
                Some(urb) if urb.is_pending() => {
                    if let Err(e) = urb.discard(fs) {
                        debug!("Discard failed: {}", e);
                    }
                    urb.retired = true;
                    true
                }
                _ => false,
            };
            if !pending {
                book.urbs.remove(key);
            }
        }
        let callback = book.iso_callback.take();
        drop(guard);
        drop(callback);

        // with a reap thread running, retired URBs are freed as they come back
        if self.reaper.is_none() {
            self.shared.drain(true);
        }
        Err(TransportError::Submit(errno))
    }

    /// Queue a bulk transfer of `size` bytes that resubmits after every completion
    ///
    /// Transfers over [`MAX_TRANSFER`] are chained as continuation URBs unless
    /// the controller can scatter-gather. The callback decides whether the
    /// transfer keeps going.
    pub fn submit_bulk<F>(&self, endpoint: u8, size: usize, callback: F) -> Result<TransferId>
    where
        F: FnMut(&BulkCompletion<'_>) -> TransferControl + Send + 'static,
    {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if endpoint & 0x7f == 0 {
            return Err(TransportError::InvalidParams("endpoint 0 cannot carry bulk transfers"));
        }

        let count = if size <= MAX_TRANSFER || self.shared.scatter_gather {
            1
        } else {
            continuation_count(size)
        };

        let mut guard = self.shared.lock_book();
        let book = &mut *guard;
        book.next_transfer += 1;
        let id = TransferId(book.next_transfer);

        let mut group = ContinuationGroup::new(id, endpoint, UrbBuffer::zeroed(size), Box::new(callback));
        let mut urbs = Vec::with_capacity(count);
        for (index, (offset, len)) in member_spans(size, count).into_iter().enumerate() {
            let key = book.alloc_key();
            // SAFETY: offset + len never exceeds the buffer size
            let data = unsafe { group.buffer.as_mut_ptr().add(offset) };
            let role = UrbRole::Bulk {
                transfer: id,
                index,
            };
            urbs.push(Urb::bulk(key, endpoint, data, len, member_flags(index, count), role)?);
            group.members.push(key);
        }
        for urb in urbs {
            book.urbs.insert(urb.key(), urb);
        }
        book.groups.insert(id, group);

        book.submit_group(&*self.shared.fs, id, false)
            .map_err(TransportError::Submit)?;
        debug!("{} queued on {:#04x}: {} bytes in {} URBs", id, endpoint, size, count);
        Ok(id)
    }

    /// Cancel a bulk transfer; it is freed once every member is reaped
    pub fn kill_transfer(&self, id: TransferId) -> Result<()> {
        let fs = &*self.shared.fs;
        let mut book = self.shared.lock_book();
        let Some(group) = book.groups.get_mut(&id) else {
            return Err(TransportError::UnknownTransfer(id));
        };
        group.state = GroupState::Killed;
        if group.outstanding == 0 {
            book.free_group(id);
        } else {
            book.discard_members(fs, id);
        }
        debug!("Killed {}", id);
        Ok(())
    }

    /// Start the reap thread
    pub fn start_async_reap(&mut self) -> Result<()> {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if self.reaper.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        self.shared.running.store(true, Ordering::Release);
        match worker::spawn_reaper(Arc::clone(&self.shared)) {
            Ok(handle) => {
                self.reaper = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(TransportError::Spawn(e))
            }
        }
    }

    /// Stop the reap thread, then cancel and reap everything still queued
    ///
    /// The thread is joined before anything is discarded.
    pub fn stop_async_reap(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.reaper.take()
            && handle.join().is_err()
        {
            error!("URB reap thread panicked");
        }
        self.shared.quiesce();
    }

    /// Release every URB and callback
    pub fn free_all(&mut self) {
        if self.reaper.is_some() {
            self.stop_async_reap();
        } else {
            self.shared.quiesce();
        }

        let callback = {
            let mut book = self.shared.lock_book();
            book.iso_keys.clear();
            book.groups.clear();
            book.urbs.retain(|_, urb| urb.is_pending());
            book.iso_callback.take()
        };
        drop(callback);
        debug!("Transport URBs freed");
    }
}

impl Drop for UrbTransport {
    fn drop(&mut self) {
        self.free_all();

        let mut book = self.shared.lock_book();
        if book.graveyard.is_empty() && book.buffer_graveyard.is_empty() {
            return;
        }
        // someone else keeps the device open, so the kernel may still own these
        if Arc::strong_count(&self.shared.fs) > 1 {
            warn!(
                "Leaking {} unreaped URBs: device is still open elsewhere",
                book.graveyard.len()
            );
            std::mem::forget(std::mem::take(&mut book.graveyard));
            std::mem::forget(std::mem::take(&mut book.buffer_graveyard));
        }
    }
}

impl std::fmt::Debug for UrbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrbTransport")
            .field("running", &self.is_running())
            .field("stopped", &self.is_stopped())
            .field("scatter_gather", &self.shared.scatter_gather)
            .finish()
    }
}
