//! In-process usbfs device for tests
//!
//! [`MockUsbFs`] keeps submitted URBs in an in-flight list the way the kernel
//! does. Tests complete them with scripted data, which wakes a thread parked
//! in [`UsbFs::reap_urb`]. Discarding an in-flight URB completes it with
//! `-ENOENT`, and [`MockUsbFs::disconnect`] completes everything with
//! `-ENODEV` before failing further calls.

use crate::usb::usbfs::{
    ControlSetup, RawUrb, TransferBuffer, URB_TYPE_BULK, URB_TYPE_ISO, UsbFs, iso_descriptors,
};
use nix::errno::Errno;
use std::collections::VecDeque;
use std::ptr::{self, NonNull};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A submitted URB as the mock saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRecord {
    pub endpoint: u8,
    pub urb_type: u8,
    pub flags: u32,
    pub length: usize,
}

struct UrbPtr(NonNull<RawUrb>);

// SAFETY: the transport keeps every submitted URB alive until it is reaped
unsafe impl Send for UrbPtr {}

impl UrbPtr {
    fn header(&self) -> &RawUrb {
        // SAFETY: in flight, so the transport does not touch it
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&mut self) -> &mut RawUrb {
        unsafe { self.0.as_mut() }
    }
}

#[derive(Default)]
struct MockState {
    in_flight: Vec<UrbPtr>,
    completed: VecDeque<UrbPtr>,
    submissions: Vec<SubmitRecord>,
    submit_calls: usize,
    fail_submit: Option<(usize, Errno)>,
    disconnected: bool,
    capabilities: u32,
    controls: Vec<ControlSetup>,
    fail_control: Option<(usize, Errno)>,
    cleared_halts: Vec<u8>,
    interfaces: Vec<(u32, u32)>,
    bulk_replies: VecDeque<Result<Vec<u8>, Errno>>,
    bulk_writes: Vec<(u8, Vec<u8>)>,
    write_limit: Option<usize>,
}

impl MockState {
    fn take_in_flight(&mut self, endpoint: u8, urb_type: Option<u8>) -> Option<UrbPtr> {
        let pos = self.in_flight.iter().position(|urb| {
            let header = urb.header();
            header.endpoint == endpoint && urb_type.is_none_or(|t| header.urb_type == t)
        })?;
        Some(self.in_flight.remove(pos))
    }
}

/// Fake usbfs device driven from tests
#[derive(Default)]
pub struct MockUsbFs {
    state: Mutex<MockState>,
    reapable: Condvar,
}

impl std::fmt::Debug for MockUsbFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockUsbFs")
            .field("in_flight", &state.in_flight.len())
            .field("completed", &state.completed.len())
            .field("disconnected", &state.disconnected)
            .finish()
    }
}

impl MockUsbFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these `USBDEVFS_CAP_*` bits
    pub fn with_capabilities(capabilities: u32) -> Self {
        let mock = Self::new();
        mock.lock().capabilities = capabilities;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, mut state: MutexGuard<'_, MockState>, urb: UrbPtr) {
        state.completed.push_back(urb);
        drop(state);
        self.reapable.notify_all();
    }

    /// Complete the oldest in-flight iso URB on `endpoint`, one entry per packet
    ///
    /// Returns `false` if no such URB is queued.
    pub fn complete_iso(&self, endpoint: u8, packets: &[Vec<u8>]) -> bool {
        let packets: Vec<(i32, &[u8])> = packets.iter().map(|p| (0, p.as_slice())).collect();
        self.complete_iso_with_status(endpoint, &packets)
    }

    /// Like [`MockUsbFs::complete_iso`] with a status per packet
    pub fn complete_iso_with_status(&self, endpoint: u8, packets: &[(i32, &[u8])]) -> bool {
        let mut state = self.lock();
        let Some(mut urb) = state.take_in_flight(endpoint, Some(URB_TYPE_ISO)) else {
            return false;
        };

        let header = urb.header_mut();
        let count = usize::try_from(header.number_of_packets).unwrap_or(0);
        let buffer: *mut u8 = header.buffer.cast();
        let descs = unsafe { iso_descriptors(urb.0) };

        let mut offset = 0usize;
        let mut total = 0usize;
        for i in 0..count {
            // SAFETY: the URB was allocated with `count` descriptors and a
            // buffer covering their requested lengths
            let desc = unsafe { &mut *descs.add(i) };
            let (status, data) = packets.get(i).copied().unwrap_or((0, &[]));
            let len = data.len().min(desc.length as usize);
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), buffer.add(offset), len) };
            desc.actual_length = len as u32;
            desc.status = status as u32;
            offset += desc.length as usize;
            total += len;
        }

        let header = urb.header_mut();
        header.status = 0;
        header.actual_length = total as i32;
        self.finish(state, urb);
        true
    }

    /// Complete the oldest in-flight bulk URB on `endpoint`
    pub fn complete_bulk(&self, endpoint: u8, data: &[u8], status: i32) -> bool {
        let mut state = self.lock();
        let Some(mut urb) = state.take_in_flight(endpoint, Some(URB_TYPE_BULK)) else {
            return false;
        };

        let header = urb.header_mut();
        let len = data.len().min(usize::try_from(header.buffer_length).unwrap_or(0));
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), header.buffer.cast::<u8>(), len) };
        header.actual_length = len as i32;
        header.status = status;
        self.finish(state, urb);
        true
    }

    /// Complete the oldest in-flight URB of any type on `endpoint` with `status` and no data
    pub fn fail_next(&self, endpoint: u8, status: i32) -> bool {
        let mut state = self.lock();
        let Some(mut urb) = state.take_in_flight(endpoint, None) else {
            return false;
        };
        let header = urb.header_mut();
        header.actual_length = 0;
        header.status = status;
        self.finish(state, urb);
        true
    }

    /// Make the `n`th submission from now (0 = the next one) fail with `errno`
    pub fn fail_nth_submit(&self, n: usize, errno: Errno) {
        let mut state = self.lock();
        let at = state.submit_calls + n;
        state.fail_submit = Some((at, errno));
    }

    /// Make the `n`th control transfer from now fail with `errno`
    pub fn fail_nth_control(&self, n: usize, errno: Errno) {
        let mut state = self.lock();
        let at = state.controls.len() + n;
        state.fail_control = Some((at, errno));
    }

    /// Unplug: every queued URB completes with `-ENODEV`, later calls fail
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.disconnected = true;
        let drained: Vec<UrbPtr> = state.in_flight.drain(..).collect();
        for mut urb in drained {
            urb.header_mut().status = -(Errno::ENODEV as i32);
            state.completed.push_back(urb);
        }
        drop(state);
        self.reapable.notify_all();
    }

    /// Queue the result of the next synchronous bulk read
    pub fn queue_bulk_read(&self, reply: Result<Vec<u8>, Errno>) {
        self.lock().bulk_replies.push_back(reply);
    }

    /// Accept at most `limit` bytes per synchronous bulk write
    pub fn limit_bulk_writes(&self, limit: usize) {
        self.lock().write_limit = Some(limit);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn in_flight_on(&self, endpoint: u8) -> usize {
        self.lock()
            .in_flight
            .iter()
            .filter(|urb| urb.header().endpoint == endpoint)
            .count()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.lock().submissions.clone()
    }

    /// Control transfers issued, in order
    pub fn controls(&self) -> Vec<ControlSetup> {
        self.lock().controls.clone()
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        self.lock().cleared_halts.clone()
    }

    /// `(interface, alt_setting)` pairs set, in order
    pub fn interface_settings(&self) -> Vec<(u32, u32)> {
        self.lock().interfaces.clone()
    }

    pub fn bulk_writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().bulk_writes.clone()
    }
}

impl UsbFs for MockUsbFs {
    unsafe fn submit_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno> {
        let mut state = self.lock();
        let call = state.submit_calls;
        state.submit_calls += 1;

        if state.disconnected {
            return Err(Errno::ENODEV);
        }
        if let Some((at, errno)) = state.fail_submit
            && at == call
        {
            state.fail_submit = None;
            return Err(errno);
        }

        let urb = UrbPtr(urb);
        let header = urb.header();
        state.submissions.push(SubmitRecord {
            endpoint: header.endpoint,
            urb_type: header.urb_type,
            flags: header.flags,
            length: usize::try_from(header.buffer_length).unwrap_or(0),
        });
        state.in_flight.push(urb);
        Ok(())
    }

    unsafe fn discard_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno> {
        let mut state = self.lock();
        let Some(pos) = state.in_flight.iter().position(|u| u.0 == urb) else {
            return Err(Errno::EINVAL);
        };
        let mut urb = state.in_flight.remove(pos);
        let header = urb.header_mut();
        header.status = -(Errno::ENOENT as i32);
        header.actual_length = 0;
        self.finish(state, urb);
        Ok(())
    }

    fn reap_urb(&self, timeout: Duration) -> Result<Option<NonNull<RawUrb>>, Errno> {
        let state = self.lock();
        let (mut state, _) = self
            .reapable
            .wait_timeout_while(state, timeout, |s| s.completed.is_empty() && !s.disconnected)
            .unwrap_or_else(PoisonError::into_inner);

        match state.completed.pop_front() {
            Some(urb) => Ok(Some(urb.0)),
            None if state.disconnected => Err(Errno::ENODEV),
            None => Ok(None),
        }
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Errno::ENODEV);
        }
        state.cleared_halts.push(endpoint);
        Ok(())
    }

    fn capabilities(&self) -> Result<u32, Errno> {
        Ok(self.lock().capabilities)
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: TransferBuffer<'_>,
        _timeout_ms: u32,
    ) -> Result<usize, Errno> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Errno::ENODEV);
        }
        let index = state.controls.len();
        state.controls.push(setup);
        match state.fail_control {
            Some((at, errno)) if at == index => {
                state.fail_control = None;
                Err(errno)
            }
            _ => Ok(data.len()),
        }
    }

    fn bulk_transfer(
        &self,
        endpoint: u8,
        data: TransferBuffer<'_>,
        _timeout_ms: u32,
    ) -> Result<usize, Errno> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Errno::ENODEV);
        }
        match data {
            TransferBuffer::In(buf) => match state.bulk_replies.pop_front() {
                Some(Ok(reply)) => {
                    let n = reply.len().min(buf.len());
                    buf[..n].copy_from_slice(&reply[..n]);
                    Ok(n)
                }
                Some(Err(errno)) => Err(errno),
                None => Err(Errno::ETIMEDOUT),
            },
            TransferBuffer::Out(buf) => {
                let n = state.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
                state.bulk_writes.push((endpoint, buf[..n].to_vec()));
                Ok(n)
            }
        }
    }

    fn set_interface(&self, interface: u32, alt_setting: u32) -> Result<(), Errno> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Errno::ENODEV);
        }
        state.interfaces.push((interface, alt_setting));
        Ok(())
    }
}
