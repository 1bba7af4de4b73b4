//! Linux usbfs character device boundary
//!
//! Everything that touches the kernel goes through the [`UsbFs`] trait so the
//! transport can be driven by an in-process mock device in tests. The
//! real implementation, [`DeviceFile`], issues the `USBDEVFS_*` ioctls on an
//! open `/dev/bus/usb/BBB/DDD` node.

use nix::errno::Errno;
use nix::libc::{c_uint, c_void};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::time::Duration;

/// URB type: isochronous
pub const URB_TYPE_ISO: u8 = 0;
/// URB type: bulk
pub const URB_TYPE_BULK: u8 = 3;

/// Fail the transfer if the device sends less than requested
pub const URB_SHORT_NOT_OK: u32 = 0x01;
/// Schedule isochronous packets as soon as possible
pub const URB_ISO_ASAP: u32 = 0x02;
/// Member of a chained bulk transfer (not the first one)
pub const URB_BULK_CONTINUATION: u32 = 0x04;

/// Capability bit: the host controller can scatter-gather large bulk buffers
pub const CAP_BULK_SCATTER_GATHER: u32 = 0x08;

/// Largest buffer a single bulk URB may carry without scatter-gather
pub const MAX_TRANSFER: usize = 16384;

/// `struct usbdevfs_urb`, without the trailing iso descriptor array
#[repr(C)]
#[derive(Debug)]
pub struct RawUrb {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: i32,
    pub flags: u32,
    pub buffer: *mut c_void,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub signr: u32,
    pub usercontext: *mut c_void,
}

/// `struct usbdevfs_iso_packet_desc`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacketDesc {
    pub length: u32,
    pub actual_length: u32,
    /// Negative errno stored as unsigned
    pub status: u32,
}

/// Pointer to the iso descriptor array that follows a URB header
///
/// # Safety
///
/// `urb` must point at a header allocated with room for its
/// `number_of_packets` descriptors behind it.
pub unsafe fn iso_descriptors(urb: NonNull<RawUrb>) -> *mut IsoPacketDesc {
    unsafe { urb.as_ptr().cast::<u8>().add(size_of::<RawUrb>()).cast() }
}

#[repr(C)]
struct CtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut c_void,
}

#[repr(C)]
struct BulkTransfer {
    endpoint: c_uint,
    length: c_uint,
    timeout: c_uint,
    data: *mut c_void,
}

#[repr(C)]
struct SetInterface {
    interface: c_uint,
    alt_setting: c_uint,
}

mod ioctl {
    use super::{BulkTransfer, CtrlTransfer, RawUrb, SetInterface};
    use nix::libc::c_uint;

    nix::ioctl_readwrite!(control, b'U', 0, CtrlTransfer);
    nix::ioctl_readwrite!(bulk, b'U', 2, BulkTransfer);
    nix::ioctl_read!(set_interface, b'U', 4, SetInterface);
    nix::ioctl_read!(submit_urb, b'U', 10, RawUrb);
    nix::ioctl_write_ptr_bad!(discard_urb, nix::request_code_none!(b'U', 11), RawUrb);
    nix::ioctl_write_ptr!(reap_urb_ndelay, b'U', 13, *mut RawUrb);
    nix::ioctl_read!(claim_interface, b'U', 15, c_uint);
    nix::ioctl_read!(release_interface, b'U', 16, c_uint);
    nix::ioctl_read!(clear_halt, b'U', 21, c_uint);
    nix::ioctl_read!(get_capabilities, b'U', 26, u32);
}

/// Data stage of a synchronous transfer
#[derive(Debug)]
pub enum TransferBuffer<'a> {
    /// Device to host
    In(&'a mut [u8]),
    /// Host to device
    Out(&'a [u8]),
}

impl TransferBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::In(buf) => buf.len(),
            TransferBuffer::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        match self {
            TransferBuffer::In(buf) if buf.is_empty() => ptr::null_mut(),
            TransferBuffer::Out(buf) if buf.is_empty() => ptr::null_mut(),
            TransferBuffer::In(buf) => buf.as_mut_ptr().cast(),
            // the kernel only reads OUT buffers
            TransferBuffer::Out(buf) => buf.as_ptr().cast_mut().cast(),
        }
    }
}

/// Setup packet of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Raw usbfs operations
///
/// Implementations must allow the reap call on one thread to run
/// concurrently with submit/discard calls on another, as the kernel does.
pub trait UsbFs: Send + Sync {
    /// Queue a URB with the kernel
    ///
    /// # Safety
    ///
    /// The header, its iso descriptors and its data buffer must stay
    /// allocated and unmoved until the URB has been handed back by
    /// [`UsbFs::reap_urb`] (or the device has been closed).
    unsafe fn submit_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno>;

    /// Ask the kernel to cancel a queued URB
    ///
    /// A successful discard still has to be reaped.
    ///
    /// # Safety
    ///
    /// `urb` must be a pointer previously passed to [`UsbFs::submit_urb`].
    unsafe fn discard_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno>;

    /// Wait up to `timeout` for a completed URB
    ///
    /// `Ok(None)` means nothing completed in time.
    fn reap_urb(&self, timeout: Duration) -> Result<Option<NonNull<RawUrb>>, Errno>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno>;

    /// `USBDEVFS_CAP_*` bits
    fn capabilities(&self) -> Result<u32, Errno>;

    /// Synchronous control transfer, returns the bytes moved
    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: TransferBuffer<'_>,
        timeout_ms: u32,
    ) -> Result<usize, Errno>;

    /// One synchronous bulk ioctl, returns the bytes moved
    fn bulk_transfer(
        &self,
        endpoint: u8,
        data: TransferBuffer<'_>,
        timeout_ms: u32,
    ) -> Result<usize, Errno>;

    fn set_interface(&self, interface: u32, alt_setting: u32) -> Result<(), Errno>;
}

/// An open usbfs device node
#[derive(Debug)]
pub struct DeviceFile {
    fd: OwnedFd,
    path: PathBuf,
}

impl DeviceFile {
    /// Open a usbfs node read-write
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            fd: OwnedFd::from(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn claim_interface(&self, interface: u32) -> Result<(), Errno> {
        let mut iface: c_uint = interface;
        unsafe { ioctl::claim_interface(self.fd.as_raw_fd(), &mut iface) }.map(drop)
    }

    pub fn release_interface(&self, interface: u32) -> Result<(), Errno> {
        let mut iface: c_uint = interface;
        unsafe { ioctl::release_interface(self.fd.as_raw_fd(), &mut iface) }.map(drop)
    }
}

impl UsbFs for DeviceFile {
    unsafe fn submit_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno> {
        unsafe { ioctl::submit_urb(self.fd.as_raw_fd(), urb.as_ptr()) }.map(drop)
    }

    unsafe fn discard_urb(&self, urb: NonNull<RawUrb>) -> Result<(), Errno> {
        unsafe { ioctl::discard_urb(self.fd.as_raw_fd(), urb.as_ptr()) }.map(drop)
    }

    fn reap_urb(&self, timeout: Duration) -> Result<Option<NonNull<RawUrb>>, Errno> {
        // usbfs reports pending completions as writable
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e),
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if !revents.contains(PollFlags::POLLOUT)
            && revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP)
        {
            return Err(Errno::ENODEV);
        }

        let mut urb: *mut RawUrb = ptr::null_mut();
        let slot: *mut *mut RawUrb = &mut urb;
        match unsafe { ioctl::reap_urb_ndelay(self.fd.as_raw_fd(), slot.cast_const()) } {
            Ok(_) => Ok(NonNull::new(urb)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno> {
        let mut ep: c_uint = endpoint.into();
        unsafe { ioctl::clear_halt(self.fd.as_raw_fd(), &mut ep) }.map(drop)
    }

    fn capabilities(&self) -> Result<u32, Errno> {
        let mut caps: u32 = 0;
        unsafe { ioctl::get_capabilities(self.fd.as_raw_fd(), &mut caps) }?;
        Ok(caps)
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        mut data: TransferBuffer<'_>,
        timeout_ms: u32,
    ) -> Result<usize, Errno> {
        let length = u16::try_from(data.len()).map_err(|_| Errno::EINVAL)?;
        let mut ctrl = CtrlTransfer {
            request_type: setup.request_type,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
            timeout: timeout_ms,
            data: data.as_mut_ptr(),
        };
        let n = unsafe { ioctl::control(self.fd.as_raw_fd(), &mut ctrl) }?;
        Ok(n as usize)
    }

    fn bulk_transfer(
        &self,
        endpoint: u8,
        mut data: TransferBuffer<'_>,
        timeout_ms: u32,
    ) -> Result<usize, Errno> {
        let length = c_uint::try_from(data.len()).map_err(|_| Errno::EINVAL)?;
        let mut bulk = BulkTransfer {
            endpoint: endpoint.into(),
            length,
            timeout: timeout_ms,
            data: data.as_mut_ptr(),
        };
        let n = unsafe { ioctl::bulk(self.fd.as_raw_fd(), &mut bulk) }?;
        Ok(n as usize)
    }

    fn set_interface(&self, interface: u32, alt_setting: u32) -> Result<(), Errno> {
        let mut setting = SetInterface {
            interface,
            alt_setting,
        };
        unsafe { ioctl::set_interface(self.fd.as_raw_fd(), &mut setting) }.map(drop)
    }
}
