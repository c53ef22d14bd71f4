//! Raw usbdevfs interface, as described by linux/usbdevice_fs.h.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr;

use libc::{c_int, c_uint, c_void};

pub(crate) const URB_TYPE_INTERRUPT: u8 = 1;
pub(crate) const URB_TYPE_CONTROL: u8 = 2;
pub(crate) const URB_TYPE_BULK: u8 = 3;

/// `struct usbdevfs_urb`, without the trailing isochronous packet descriptors we never use.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Urb {
    pub(crate) urb_type: u8,
    pub(crate) endpoint: u8,
    pub(crate) status: c_int,
    pub(crate) flags: c_uint,
    pub(crate) buffer: *mut c_void,
    pub(crate) buffer_length: c_int,
    pub(crate) actual_length: c_int,
    pub(crate) start_frame: c_int,
    pub(crate) number_of_packets: c_int,
    pub(crate) error_count: c_int,
    pub(crate) signr: c_uint,

    /// Holds the id of the transfer the URB belongs to.
    pub(crate) usercontext: *mut c_void,
}

impl Default for Urb {
    fn default() -> Self {
        Urb {
            urb_type: 0,
            endpoint: 0,
            status: 0,
            flags: 0,
            buffer: ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        }
    }
}

// URBs are only touched by the kernel and under the transfer index's lock.
unsafe impl Send for Urb {}

#[repr(C)]
struct SetInterface {
    interface: c_uint,
    altsetting: c_uint,
}

#[repr(C)]
struct DisconnectClaim {
    interface: c_uint,
    flags: c_uint,
    driver: [u8; 256],
}

/// `struct usbdevfs_ioctl`; lets us send driver ioctls to one interface.
#[repr(C)]
struct InterfaceIoctl {
    interface: c_int,
    ioctl_code: c_int,
    data: *mut c_void,
}

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// The generic `_IOC` encoding, for the usbdevfs 'U' ioctl type.
const fn ioc(direction: u32, number: u32, size: usize) -> u32 {
    (direction << 30) | ((size as u32) << 16) | ((b'U' as u32) << 8) | number
}

pub(crate) const SETINTERFACE: u32 = ioc(IOC_READ, 4, size_of::<SetInterface>());
pub(crate) const SUBMITURB: u32 = ioc(IOC_READ, 10, size_of::<Urb>());
pub(crate) const DISCARDURB: u32 = ioc(IOC_NONE, 11, 0);
pub(crate) const REAPURBNDELAY: u32 = ioc(IOC_WRITE, 13, size_of::<*mut c_void>());
pub(crate) const CLAIMINTERFACE: u32 = ioc(IOC_READ, 15, size_of::<c_uint>());
pub(crate) const RELEASEINTERFACE: u32 = ioc(IOC_READ, 16, size_of::<c_uint>());
pub(crate) const IOCTL: u32 = ioc(IOC_READ | IOC_WRITE, 18, size_of::<InterfaceIoctl>());
pub(crate) const CLEAR_HALT: u32 = ioc(IOC_READ, 21, size_of::<c_uint>());
pub(crate) const CONNECT: u32 = ioc(IOC_NONE, 23, 0);
pub(crate) const DISCONNECT_CLAIM: u32 = ioc(IOC_READ, 27, size_of::<DisconnectClaim>());

unsafe fn ioctl<T>(fd: BorrowedFd<'_>, request: u32, argument: *mut T) -> io::Result<c_int> {
    let result = libc::ioctl(fd.as_raw_fd(), request as _, argument);
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Hands a URB to the kernel.
///
/// # Safety
/// The URB and the buffer it points at must stay valid, and unmoved, until it's reaped.
pub(crate) unsafe fn submit_urb(fd: BorrowedFd<'_>, urb: *mut Urb) -> io::Result<()> {
    ioctl(fd, SUBMITURB, urb).map(|_| ())
}

/// Asks the kernel to cancel a URB; it is still reaped afterwards.
///
/// # Safety
/// The URB must have been submitted on this file descriptor.
pub(crate) unsafe fn discard_urb(fd: BorrowedFd<'_>, urb: *mut Urb) -> io::Result<()> {
    ioctl(fd, DISCARDURB, urb).map(|_| ())
}

/// Takes back one completed URB, if there is one; fails with `EAGAIN` if not.
///
/// # Safety
/// The returned pointer is one of the URBs previously submitted on this file descriptor.
pub(crate) unsafe fn reap_urb(fd: BorrowedFd<'_>) -> io::Result<*mut Urb> {
    let mut urb: *mut Urb = ptr::null_mut();
    ioctl(fd, REAPURBNDELAY, &mut urb as *mut *mut Urb)?;
    Ok(urb)
}

pub(crate) fn claim_interface(fd: BorrowedFd<'_>, interface: u8) -> io::Result<()> {
    let mut interface = c_uint::from(interface);
    unsafe { ioctl(fd, CLAIMINTERFACE, &mut interface) }.map(|_| ())
}

pub(crate) fn release_interface(fd: BorrowedFd<'_>, interface: u8) -> io::Result<()> {
    let mut interface = c_uint::from(interface);
    unsafe { ioctl(fd, RELEASEINTERFACE, &mut interface) }.map(|_| ())
}

/// Detaches whatever kernel driver is bound to the interface, and claims it.
pub(crate) fn disconnect_claim(fd: BorrowedFd<'_>, interface: u8) -> io::Result<()> {
    let mut claim = DisconnectClaim {
        interface: c_uint::from(interface),
        flags: 0,
        driver: [0; 256],
    };
    unsafe { ioctl(fd, DISCONNECT_CLAIM, &mut claim) }.map(|_| ())
}

/// Lets the kernel bind its driver to the interface again.
pub(crate) fn reattach_kernel_driver(fd: BorrowedFd<'_>, interface: u8) -> io::Result<()> {
    let mut command = InterfaceIoctl {
        interface: c_int::from(interface),
        ioctl_code: CONNECT as c_int,
        data: ptr::null_mut(),
    };
    unsafe { ioctl(fd, IOCTL, &mut command) }.map(|_| ())
}

pub(crate) fn set_interface(fd: BorrowedFd<'_>, interface: u8, alternate: u8) -> io::Result<()> {
    let mut setting = SetInterface {
        interface: c_uint::from(interface),
        altsetting: c_uint::from(alternate),
    };
    unsafe { ioctl(fd, SETINTERFACE, &mut setting) }.map(|_| ())
}

pub(crate) fn clear_halt(fd: BorrowedFd<'_>, endpoint_address: u8) -> io::Result<()> {
    let mut endpoint = c_uint::from(endpoint_address);
    unsafe { ioctl(fd, CLEAR_HALT, &mut endpoint) }.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn ioctl_numbers_match_the_kernel_headers() {
        assert_eq!(SETINTERFACE, 0x8008_5504);
        assert_eq!(SUBMITURB, 0x8038_550a);
        assert_eq!(DISCARDURB, 0x0000_550b);
        assert_eq!(REAPURBNDELAY, 0x4008_550d);
        assert_eq!(CLAIMINTERFACE, 0x8004_550f);
        assert_eq!(RELEASEINTERFACE, 0x8004_5510);
        assert_eq!(IOCTL, 0xc010_5512);
        assert_eq!(CLEAR_HALT, 0x8004_5515);
        assert_eq!(CONNECT, 0x0000_5517);
        assert_eq!(DISCONNECT_CLAIM, 0x8108_551b);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn urb_layout() {
        assert_eq!(size_of::<Urb>(), 56);
        assert_eq!(std::mem::align_of::<Urb>(), 8);

        let urb = Urb::default();
        let base = &urb as *const Urb as usize;
        assert_eq!(&urb.buffer as *const _ as usize - base, 16);
        assert_eq!(&urb.usercontext as *const _ as usize - base, 48);
    }
}
