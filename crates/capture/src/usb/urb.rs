//! URB allocation and completed-transfer views
//!
//! A [`Urb`] owns a heap header (with the iso descriptor array packed behind
//! it, as the kernel expects) and, for isochronous URBs, its data buffer.
//! Bulk URBs point into the buffer owned by their [`super::continuation::ContinuationGroup`].
//!
//! While a URB is in flight the kernel may write to any of this memory, so
//! nothing here hands out references until the URB has been reaped.

use crate::usb::continuation::TransferId;
use crate::usb::error::{Result, TransportError};
use crate::usb::usbfs::{
    IsoPacketDesc, RawUrb, URB_ISO_ASAP, URB_TYPE_BULK, URB_TYPE_ISO, UsbFs, iso_descriptors,
};
use nix::errno::Errno;
use nix::libc::c_void;
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::slice;

/// Key stored in a URB's `usercontext`, used to find it again after reaping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct UrbKey(pub(crate) u64);

impl UrbKey {
    fn as_context(self) -> *mut c_void {
        ptr::without_provenance_mut(self.0 as usize)
    }

    pub(crate) fn from_context(context: *mut c_void) -> Self {
        Self(context.addr() as u64)
    }
}

/// Who a URB belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrbRole {
    Iso,
    Bulk { transfer: TransferId, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrbState {
    /// Owned by us; safe to touch or free
    Idle,
    /// Queued with the kernel
    InFlight,
    /// Discard requested, completion not reaped yet
    Discarding,
}

/// Zeroed byte buffer handed to the kernel by raw pointer
///
/// Kept as a raw allocation rather than a `Box` so no unique reference
/// exists while the kernel writes into it.
pub(crate) struct UrbBuffer {
    ptr: NonNull<[u8]>,
}

// SAFETY: plain heap bytes, only accessed by the thread holding the transport lock
unsafe impl Send for UrbBuffer {}

impl UrbBuffer {
    pub(crate) fn zeroed(len: usize) -> Self {
        let ptr = NonNull::from(Box::leak(vec![0u8; len].into_boxed_slice()));
        Self { ptr }
    }

    pub(crate) fn len(&self) -> usize {
        self.ptr.len()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// # Safety
    ///
    /// No URB pointing into this buffer may be in flight.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for UrbBuffer {
    fn drop(&mut self) {
        // SAFETY: leaked from a Box in zeroed()
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

/// One kernel URB and the memory it refers to
pub(crate) struct Urb {
    key: UrbKey,
    header: NonNull<RawUrb>,
    layout: Layout,
    packets: usize,
    /// Iso URBs own their data; bulk members borrow their group's
    owned: Option<UrbBuffer>,
    pub(crate) role: UrbRole,
    pub(crate) state: UrbState,
    /// Free on reap instead of dispatching
    pub(crate) retired: bool,
}

// SAFETY: the header is a private heap allocation; see UrbBuffer
unsafe impl Send for Urb {}

impl Urb {
    /// Isochronous URB with `packets` descriptors of `packet_size` bytes
    pub(crate) fn iso(key: UrbKey, endpoint: u8, packet_size: usize, packets: usize) -> Result<Self> {
        let total = packet_size
            .checked_mul(packets)
            .ok_or(TransportError::InvalidParams("isochronous buffer too large"))?;
        let length = u32::try_from(packet_size)
            .map_err(|_| TransportError::InvalidParams("isochronous packet too large"))?;

        let data = UrbBuffer::zeroed(total);
        let data_ptr = data.as_mut_ptr();
        let mut urb = Self::allocate(key, packets, Some(data), UrbRole::Iso)?;
        urb.init_header(URB_TYPE_ISO, endpoint, URB_ISO_ASAP, data_ptr, total)?;

        // SAFETY: freshly allocated with room for `packets` descriptors
        let descs = unsafe { iso_descriptors(urb.header) };
        for i in 0..packets {
            unsafe {
                descs.add(i).write(IsoPacketDesc {
                    length,
                    actual_length: 0,
                    status: 0,
                });
            }
        }
        Ok(urb)
    }

    /// Bulk URB over `len` bytes at `data`, which the caller keeps alive
    pub(crate) fn bulk(
        key: UrbKey,
        endpoint: u8,
        data: *mut u8,
        len: usize,
        flags: u32,
        role: UrbRole,
    ) -> Result<Self> {
        let mut urb = Self::allocate(key, 0, None, role)?;
        urb.init_header(URB_TYPE_BULK, endpoint, flags, data, len)?;
        Ok(urb)
    }

    fn allocate(key: UrbKey, packets: usize, owned: Option<UrbBuffer>, role: UrbRole) -> Result<Self> {
        let descs = Layout::array::<IsoPacketDesc>(packets)
            .map_err(|_| TransportError::InvalidParams("too many isochronous packets"))?;
        let (layout, offset) = Layout::new::<RawUrb>()
            .extend(descs)
            .map_err(|_| TransportError::InvalidParams("too many isochronous packets"))?;
        debug_assert_eq!(offset, size_of::<RawUrb>());
        let layout = layout.pad_to_align();

        // SAFETY: layout has a non-zero size (RawUrb is not a ZST)
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(header) = NonNull::new(raw.cast::<RawUrb>()) else {
            alloc::handle_alloc_error(layout);
        };

        Ok(Self {
            key,
            header,
            layout,
            packets,
            owned,
            role,
            state: UrbState::Idle,
            retired: false,
        })
    }

    fn init_header(&mut self, urb_type: u8, endpoint: u8, flags: u32, data: *mut u8, len: usize) -> Result<()> {
        let buffer_length =
            i32::try_from(len).map_err(|_| TransportError::InvalidParams("transfer buffer too large"))?;
        let number_of_packets = i32::try_from(self.packets)
            .map_err(|_| TransportError::InvalidParams("too many isochronous packets"))?;

        // SAFETY: we own the header and it is not in flight
        unsafe {
            self.header.as_ptr().write(RawUrb {
                urb_type,
                endpoint,
                status: 0,
                flags,
                buffer: data.cast(),
                buffer_length,
                actual_length: 0,
                start_frame: 0,
                number_of_packets,
                error_count: 0,
                signr: 0,
                usercontext: self.key.as_context(),
            });
        }
        Ok(())
    }

    pub(crate) fn key(&self) -> UrbKey {
        self.key
    }

    pub(crate) fn header(&self) -> NonNull<RawUrb> {
        self.header
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state != UrbState::Idle
    }

    pub(crate) fn endpoint(&self) -> u8 {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).endpoint).read() }
    }

    pub(crate) fn flags(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).flags).read() }
    }

    /// Completion status; meaningful once reaped
    pub(crate) fn status(&self) -> i32 {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).status).read() }
    }

    pub(crate) fn actual_length(&self) -> usize {
        let actual = unsafe { ptr::addr_of!((*self.header.as_ptr()).actual_length).read() };
        usize::try_from(actual).unwrap_or(0)
    }

    /// Clear completion fields so the URB can be queued again
    fn reset(&mut self) {
        let header = self.header.as_ptr();
        // SAFETY: only called while Idle
        unsafe {
            ptr::addr_of_mut!((*header).status).write(0);
            ptr::addr_of_mut!((*header).actual_length).write(0);
            ptr::addr_of_mut!((*header).error_count).write(0);
            ptr::addr_of_mut!((*header).start_frame).write(0);

            let descs = iso_descriptors(self.header);
            for i in 0..self.packets {
                let desc = descs.add(i);
                ptr::addr_of_mut!((*desc).actual_length).write(0);
                ptr::addr_of_mut!((*desc).status).write(0);
            }
        }
    }

    /// Reset and queue with the kernel
    pub(crate) fn submit(&mut self, fs: &dyn UsbFs) -> std::result::Result<(), Errno> {
        debug_assert_eq!(self.state, UrbState::Idle);
        self.reset();
        // SAFETY: header and data stay put until this URB is reaped; the
        // transport never frees a pending URB except after closing the device
        unsafe { fs.submit_urb(self.header)? };
        self.state = UrbState::InFlight;
        Ok(())
    }

    /// Ask the kernel to cancel this URB if it is still queued
    ///
    /// The URB must still be reaped afterwards.
    pub(crate) fn discard(&mut self, fs: &dyn UsbFs) -> std::result::Result<(), Errno> {
        if self.state != UrbState::InFlight {
            return Ok(());
        }
        self.state = UrbState::Discarding;
        // EINVAL means it already completed and is waiting to be reaped
        match unsafe { fs.discard_urb(self.header) } {
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// View of a reaped isochronous URB
    pub(crate) fn iso_view(&self) -> IsoTransfer<'_> {
        debug_assert_eq!(self.state, UrbState::Idle);
        // SAFETY: reaped, so the kernel no longer writes here
        let buffer = match &self.owned {
            Some(data) => unsafe { data.as_slice() },
            None => &[],
        };
        let descriptors = unsafe { slice::from_raw_parts(iso_descriptors(self.header), self.packets) };
        IsoTransfer::new(self.endpoint(), self.status(), buffer, descriptors)
    }
}

impl Drop for Urb {
    fn drop(&mut self) {
        // SAFETY: allocated in allocate() with this layout
        unsafe { alloc::dealloc(self.header.as_ptr().cast(), self.layout) };
    }
}

impl std::fmt::Debug for Urb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Urb")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("packets", &self.packets)
            .finish()
    }
}

/// A completed isochronous transfer, as handed to the iso callback
#[derive(Debug, Clone, Copy)]
pub struct IsoTransfer<'a> {
    endpoint: u8,
    status: i32,
    buffer: &'a [u8],
    descriptors: &'a [IsoPacketDesc],
}

impl<'a> IsoTransfer<'a> {
    /// Wrap a data buffer and its packet descriptors
    ///
    /// Packet `i` starts at the sum of the requested lengths of packets
    /// `0..i`.
    pub fn new(endpoint: u8, status: i32, buffer: &'a [u8], descriptors: &'a [IsoPacketDesc]) -> Self {
        Self {
            endpoint,
            status,
            buffer,
            descriptors,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// URB status (0 or `-EXDEV` for a transfer that was delivered)
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn packet_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Bytes actually received across all packets
    pub fn actual_length(&self) -> usize {
        self.descriptors.iter().map(|d| d.actual_length as usize).sum()
    }

    /// Iterate the packets in order
    pub fn packets(&self) -> impl Iterator<Item = IsoPacket<'a>> + use<'a> {
        let buffer = self.buffer;
        self.descriptors
            .iter()
            .enumerate()
            .scan(0usize, move |offset, (index, desc)| {
                let start = (*offset).min(buffer.len());
                let len = (desc.actual_length.min(desc.length) as usize).min(buffer.len() - start);
                *offset += desc.length as usize;
                Some(IsoPacket {
                    index,
                    status: desc.status as i32,
                    data: &buffer[start..start + len],
                })
            })
    }
}

/// One isochronous packet of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket<'a> {
    pub index: usize,
    /// 0 or a negative errno
    pub status: i32,
    /// The bytes received
    pub data: &'a [u8],
}

impl IsoPacket<'_> {
    /// Delivered without error
    pub fn is_clean(&self) -> bool {
        self.status == 0
    }
}
