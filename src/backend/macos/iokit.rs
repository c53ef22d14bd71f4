//! Thin owned wrappers over the IOKit USB device and interface user clients.

use std::{
    ffi::{c_char, c_void, CStr},
    thread,
    time::Duration,
};

use core_foundation_sys::{
    base::{CFRelease, CFTypeRef},
    number::{kCFNumberSInt64Type, CFNumberGetValue, CFNumberRef},
    runloop::CFRunLoopSourceRef,
    string::{kCFStringEncodingUTF8, CFStringGetCString, CFStringGetCStringPtr, CFStringRef},
    uuid::{CFUUIDBytes, CFUUIDRef},
};
use io_kit_sys::{
    kIORegistryIterateParents, kIORegistryIterateRecursively,
    keys::kIOServicePlane,
    ret::{kIOReturnNoResources, kIOReturnSuccess, IOReturn},
    types::io_iterator_t,
    IOIteratorNext, IOObjectRelease, IORegistryEntrySearchCFProperty,
};
use log::{debug, warn};

use super::io_return_error;
use super::iokit_c::{
    self, kIOReturnUnsupported, kIOUSBFindInterfaceDontCare, AsyncCallback, CFUUIDGetUUIDBytes,
    IOCFPlugInInterface, IOCreatePlugInInterfaceForService, IOUSBDevRequest,
    IOUSBFindInterfaceRequest,
};
use crate::error::{Error, UsbResult};

/// Version 500 of the device and interface APIs; available since macOS 10.7.3.
pub(crate) type UsbDevice = iokit_c::IOUSBDeviceStruct500;
pub(crate) type UsbInterface = iokit_c::IOUSBInterfaceStruct500;

/// How often creating a plugin is retried while IOKit reports it has no resources.
const PLUGIN_ATTEMPTS: usize = 5;

/// Calls a function from an IOKit vtable; a null slot reads as kIOReturnUnsupported.
macro_rules! call_unsafe_iokit_function {
    ($ptr:expr, $function:ident $(, $args:expr)*) => {{
        let this = $ptr;
        match unsafe { (**this).$function } {
            Some(function) => unsafe { function(this as *mut c_void $(, $args)*) },
            None => kIOReturnUnsupported,
        }
    }};
}

/// Converts an IOKit return code into a result; `operation` names what failed.
pub(crate) fn check(rc: IOReturn, operation: &str) -> UsbResult<()> {
    if rc == kIOReturnSuccess {
        Ok(())
    } else {
        Err(io_return_error(rc, operation))
    }
}

/// Wrapper for an IOKit IO-object that automatically drops it.
#[derive(Debug)]
pub(crate) struct IoObject {
    object: u32,
}

impl IoObject {
    pub(crate) fn new(object: u32) -> Self {
        IoObject { object }
    }

    /// Fetches the inner handle for passing to IOKit functions.
    pub(crate) fn get(&self) -> u32 {
        self.object
    }

    /// Treats the object as an iterator and takes its next element.
    pub(crate) fn next_object(&self) -> Option<IoObject> {
        match unsafe { IOIteratorNext(self.object) } {
            0 => None,
            object => Some(IoObject::new(object)),
        }
    }
}

impl Drop for IoObject {
    fn drop(&mut self) {
        unsafe {
            IOObjectRelease(self.object);
        }
    }
}

/// Wrapper around a **IOCFPluginInterface that releases it.
struct PluginInterface {
    interface: *mut *mut IOCFPlugInInterface,
}

impl Drop for PluginInterface {
    fn drop(&mut self) {
        unsafe {
            if let Some(release) = (**self.interface).Release {
                release(self.interface.cast());
            }
        }
    }
}

/// Creates the user-client plugin for a service, and asks it for the interface `interface_id`.
///
/// IOKit spuriously reports kIOReturnNoResources for freshly attached devices, before it has
/// decided whether a kernel driver owns them, so that case is retried a few times.
fn query_plugin<T>(
    service: &IoObject,
    plugin_type: CFUUIDRef,
    interface_id: CFUUIDRef,
) -> UsbResult<*mut *mut T> {
    let mut rc = kIOReturnNoResources;

    for _ in 0..PLUGIN_ATTEMPTS {
        let mut score = 0;
        let mut raw_plugin: *mut *mut IOCFPlugInInterface = std::ptr::null_mut();

        rc = unsafe {
            IOCreatePlugInInterfaceForService(
                service.get(),
                plugin_type,
                iokit_c::kIOCFPlugInInterfaceID(),
                &mut raw_plugin,
                &mut score,
            )
        };
        if rc == kIOReturnNoResources {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        check(rc, "creating IOKit plugin")?;
        if raw_plugin.is_null() {
            return Err(Error::UnspecifiedOsError);
        }

        let plugin = PluginInterface { interface: raw_plugin };
        let mut raw: *mut *mut T = std::ptr::null_mut();
        let id: CFUUIDBytes = unsafe { CFUUIDGetUUIDBytes(interface_id) };

        let result = unsafe {
            match (**plugin.interface).QueryInterface {
                Some(query) => query(
                    plugin.interface.cast(),
                    id,
                    &mut raw as *mut *mut *mut T as *mut *mut c_void,
                ),
                None => kIOReturnUnsupported,
            }
        };
        if result != 0 || raw.is_null() {
            return Err(Error::Internal(format!(
                "IOKit plugin refused interface query ({result:#x})"
            )));
        }
        return Ok(raw);
    }

    debug!("IOKit kept reporting no resources; is a kernel driver bound to the device?");
    Err(io_return_error(rc, "creating IOKit plugin"))
}

/// Releases an IOKit COM-style object.
fn release<T>(object: *mut *mut T, release: Option<unsafe extern "C" fn(*mut c_void) -> std::os::raw::c_ulong>) {
    if let Some(release) = release {
        unsafe { release(object.cast()) };
    }
}

/// An event source created by a device or interface, for the engine's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunLoopSource(pub(crate) CFRunLoopSourceRef);

// Run loop sources may be added to, and removed from, run loops on any thread.
unsafe impl Send for RunLoopSource {}

/// Wrapper around a **UsbDevice that helps us poke at its innards.
#[derive(Debug)]
pub(crate) struct OsDevice {
    device: *mut *mut UsbDevice,

    /// True iff the device is currently open.
    is_open: bool,
}

// The device pointer is only used under the owning device's lock.
unsafe impl Send for OsDevice {}

impl OsDevice {
    pub(crate) fn from_service(service: &IoObject) -> UsbResult<Self> {
        let device = query_plugin(
            service,
            iokit_c::kIOUSBDeviceUserClientTypeID(),
            iokit_c::kIOUSBDeviceInterfaceID500(),
        )?;
        Ok(OsDevice {
            device,
            is_open: false,
        })
    }

    /// Opens the device for exclusive access.
    pub(crate) fn open(&mut self) -> UsbResult<()> {
        if self.is_open {
            return Ok(());
        }

        check(call_unsafe_iokit_function!(self.device, USBDeviceOpen), "opening device")?;
        self.is_open = true;
        Ok(())
    }

    pub(crate) fn configuration(&self) -> UsbResult<u8> {
        let mut configuration = 0u8;
        check(
            call_unsafe_iokit_function!(self.device, GetConfiguration, &mut configuration),
            "reading the active configuration",
        )?;
        Ok(configuration)
    }

    pub(crate) fn set_configuration(&self, value: u8) -> UsbResult<()> {
        check(
            call_unsafe_iokit_function!(self.device, SetConfiguration, value),
            &format!("selecting configuration {value}"),
        )
    }

    pub(crate) fn configuration_count(&self) -> UsbResult<u8> {
        let mut count = 0u8;
        check(
            call_unsafe_iokit_function!(self.device, GetNumberOfConfigurations, &mut count),
            "counting configurations",
        )?;
        Ok(count)
    }

    /// Copies the full descriptor of the configuration at `index` out of IOKit's cache.
    pub(crate) fn configuration_descriptor(&self, index: u8) -> UsbResult<Vec<u8>> {
        let mut raw: *const u8 = std::ptr::null();
        check(
            call_unsafe_iokit_function!(self.device, GetConfigurationDescriptorPtr, index, &mut raw),
            &format!("reading configuration descriptor {index}"),
        )?;
        if raw.is_null() {
            return Err(Error::UnspecifiedOsError);
        }

        unsafe {
            let header = std::slice::from_raw_parts(raw, 4);
            let total_length = u16::from_le_bytes([header[2], header[3]]) as usize;
            Ok(std::slice::from_raw_parts(raw, total_length.max(4)).to_vec())
        }
    }

    /// Performs a synchronous control request; only used while opening.
    pub(crate) fn device_request(&self, request: &mut IOUSBDevRequest) -> UsbResult<usize> {
        check(
            call_unsafe_iokit_function!(self.device, DeviceRequest, request),
            "control transfer",
        )?;
        Ok(request.wLenDone as usize)
    }

    /// Starts an asynchronous control request. `request` and its data must stay put until
    /// `callback` runs with `refcon`.
    pub(crate) fn device_request_async(
        &self,
        request: *mut IOUSBDevRequest,
        callback: AsyncCallback,
        refcon: *mut c_void,
    ) -> IOReturn {
        call_unsafe_iokit_function!(self.device, DeviceRequestAsync, request, callback, refcon)
    }

    pub(crate) fn abort_control(&self) -> IOReturn {
        call_unsafe_iokit_function!(self.device, USBDeviceAbortPipeZero)
    }

    /// Returns an iterator over every interface of the active configuration.
    pub(crate) fn interface_iterator(&self) -> UsbResult<IoObject> {
        let mut iterator: io_iterator_t = 0;
        let mut dont_care = IOUSBFindInterfaceRequest {
            bInterfaceClass: kIOUSBFindInterfaceDontCare,
            bInterfaceSubClass: kIOUSBFindInterfaceDontCare,
            bInterfaceProtocol: kIOUSBFindInterfaceDontCare,
            bAlternateSetting: kIOUSBFindInterfaceDontCare,
        };

        check(
            call_unsafe_iokit_function!(
                self.device,
                CreateInterfaceIterator,
                &mut dont_care,
                &mut iterator
            ),
            "listing interfaces",
        )?;
        Ok(IoObject::new(iterator))
    }

    pub(crate) fn create_event_source(&self) -> UsbResult<RunLoopSource> {
        let mut source: CFRunLoopSourceRef = std::ptr::null_mut();
        check(
            call_unsafe_iokit_function!(self.device, CreateDeviceAsyncEventSource, &mut source),
            "creating device event source",
        )?;
        Ok(RunLoopSource(source))
    }

    pub(crate) fn close(&mut self) {
        if !self.is_open {
            return;
        }

        let rc = call_unsafe_iokit_function!(self.device, USBDeviceClose);
        if rc != kIOReturnSuccess {
            warn!("closing device failed: {}", io_return_error(rc, "USBDeviceClose"));
        }
        self.is_open = false;
    }
}

impl Drop for OsDevice {
    fn drop(&mut self) {
        self.close();
        release(self.device, unsafe { (**self.device).Release });
    }
}

/// One endpoint of an interface's current alternate setting, as IOKit numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pipe {
    pub(crate) pipe_ref: u8,
    pub(crate) address: u8,
    pub(crate) max_packet_size: u16,
}

/// Wrapper around a **UsbInterface; every endpoint access goes through it.
#[derive(Debug)]
pub(crate) struct OsInterface {
    interface: *mut *mut UsbInterface,
    is_open: bool,
}

unsafe impl Send for OsInterface {}

impl OsInterface {
    pub(crate) fn from_service(service: &IoObject) -> UsbResult<Self> {
        let interface = query_plugin(
            service,
            iokit_c::kIOUSBInterfaceUserClientTypeID(),
            iokit_c::kIOUSBInterfaceInterfaceID500(),
        )?;
        Ok(OsInterface {
            interface,
            is_open: false,
        })
    }

    pub(crate) fn number(&self) -> UsbResult<u8> {
        let mut number = 0u8;
        check(
            call_unsafe_iokit_function!(self.interface, GetInterfaceNumber, &mut number),
            "reading interface number",
        )?;
        Ok(number)
    }

    pub(crate) fn open(&mut self) -> UsbResult<()> {
        if self.is_open {
            return Ok(());
        }

        check(call_unsafe_iokit_function!(self.interface, USBInterfaceOpen), "opening interface")?;
        self.is_open = true;
        Ok(())
    }

    /// Lists the pipes of the current alternate setting; pipe 0 is the control pipe and
    /// never listed.
    pub(crate) fn pipes(&self) -> UsbResult<Vec<Pipe>> {
        let mut count = 0u8;
        check(
            call_unsafe_iokit_function!(self.interface, GetNumEndpoints, &mut count),
            "counting endpoints",
        )?;

        (1..=count)
            .map(|pipe_ref| {
                let (mut direction, mut number, mut transfer_type, mut interval) = (0u8, 0u8, 0u8, 0u8);
                let mut max_packet_size = 0u16;
                check(
                    call_unsafe_iokit_function!(
                        self.interface,
                        GetPipeProperties,
                        pipe_ref,
                        &mut direction,
                        &mut number,
                        &mut transfer_type,
                        &mut max_packet_size,
                        &mut interval
                    ),
                    &format!("reading properties of pipe {pipe_ref}"),
                )?;

                Ok(Pipe {
                    pipe_ref,
                    address: number | (direction << 7),
                    max_packet_size,
                })
            })
            .collect()
    }

    pub(crate) fn set_alternate_setting(&self, setting: u8) -> UsbResult<()> {
        check(
            call_unsafe_iokit_function!(self.interface, SetAlternateInterface, setting),
            &format!("selecting alternate setting {setting}"),
        )
    }

    /// Starts an asynchronous read; `timeout_ms` selects the variant with IOKit-side timeouts.
    pub(crate) fn read_async(
        &self,
        pipe_ref: u8,
        buffer: *mut c_void,
        length: u32,
        timeout_ms: Option<u32>,
        callback: AsyncCallback,
        refcon: *mut c_void,
    ) -> IOReturn {
        match timeout_ms {
            Some(timeout) => call_unsafe_iokit_function!(
                self.interface,
                ReadPipeAsyncTO,
                pipe_ref,
                buffer,
                length,
                timeout,
                timeout,
                callback,
                refcon
            ),
            None => call_unsafe_iokit_function!(
                self.interface,
                ReadPipeAsync,
                pipe_ref,
                buffer,
                length,
                callback,
                refcon
            ),
        }
    }

    /// Starts an asynchronous write; see [OsInterface::read_async].
    pub(crate) fn write_async(
        &self,
        pipe_ref: u8,
        buffer: *mut c_void,
        length: u32,
        timeout_ms: Option<u32>,
        callback: AsyncCallback,
        refcon: *mut c_void,
    ) -> IOReturn {
        match timeout_ms {
            Some(timeout) => call_unsafe_iokit_function!(
                self.interface,
                WritePipeAsyncTO,
                pipe_ref,
                buffer,
                length,
                timeout,
                timeout,
                callback,
                refcon
            ),
            None => call_unsafe_iokit_function!(
                self.interface,
                WritePipeAsync,
                pipe_ref,
                buffer,
                length,
                callback,
                refcon
            ),
        }
    }

    /// Aborts the pipe's pending requests; they complete with kIOReturnAborted.
    pub(crate) fn abort_pipe(&self, pipe_ref: u8) -> UsbResult<()> {
        check(
            call_unsafe_iokit_function!(self.interface, AbortPipe, pipe_ref),
            &format!("aborting pipe {pipe_ref}"),
        )
    }

    /// Clears the halt condition on the host side and, with CLEAR_FEATURE, on the device.
    pub(crate) fn clear_stall(&self, pipe_ref: u8) -> UsbResult<()> {
        check(
            call_unsafe_iokit_function!(self.interface, ClearPipeStallBothEnds, pipe_ref),
            &format!("clearing halt on pipe {pipe_ref}"),
        )
    }

    pub(crate) fn create_event_source(&self) -> UsbResult<RunLoopSource> {
        let mut source: CFRunLoopSourceRef = std::ptr::null_mut();
        check(
            call_unsafe_iokit_function!(self.interface, CreateInterfaceAsyncEventSource, &mut source),
            "creating interface event source",
        )?;
        Ok(RunLoopSource(source))
    }

    pub(crate) fn close(&mut self) {
        if !self.is_open {
            return;
        }

        let rc = call_unsafe_iokit_function!(self.interface, USBInterfaceClose);
        if rc != kIOReturnSuccess {
            warn!("closing interface failed: {}", io_return_error(rc, "USBInterfaceClose"));
        }
        self.is_open = false;
    }
}

impl Drop for OsInterface {
    fn drop(&mut self) {
        self.close();
        release(self.interface, unsafe { (**self.interface).Release });
    }
}

/// Rustified version of the CFSTR C macro; only takes literals.
macro_rules! cfstr {
    ($string:literal) => {
        unsafe { io_kit_sys::CFSTR(concat!($string, "\0").as_ptr() as *const std::ffi::c_char) }
    };
}
pub(crate) use cfstr;

/// Searches the service and its parents for a registry property. The result must be released.
fn search_property(service: &IoObject, key: CFStringRef) -> Option<CFTypeRef> {
    let value = unsafe {
        IORegistryEntrySearchCFProperty(
            service.get(),
            kIOServicePlane as *mut c_char,
            key,
            std::ptr::null(),
            kIORegistryIterateRecursively | kIORegistryIterateParents,
        )
    };
    (!value.is_null()).then_some(value)
}

/// Reads a numeric registry property.
pub(crate) fn numeric_property<T: TryFrom<i64>>(service: &IoObject, key: CFStringRef) -> Option<T> {
    let value = search_property(service, key)?;

    let mut result: i64 = 0;
    let converted = unsafe {
        let converted = CFNumberGetValue(
            value as CFNumberRef,
            kCFNumberSInt64Type,
            &mut result as *mut i64 as *mut c_void,
        );
        CFRelease(value);
        converted
    };

    if !converted {
        return None;
    }
    T::try_from(result).ok()
}

/// Reads a string registry property.
pub(crate) fn string_property(service: &IoObject, key: CFStringRef) -> Option<String> {
    let value = search_property(service, key)?;
    let string = value as CFStringRef;

    let result = unsafe {
        let fast = CFStringGetCStringPtr(string, kCFStringEncodingUTF8);
        if !fast.is_null() {
            Some(CStr::from_ptr(fast).to_string_lossy().into_owned())
        } else {
            let mut buffer = [0 as c_char; 512];
            let copied = CFStringGetCString(
                string,
                buffer.as_mut_ptr(),
                buffer.len() as _,
                kCFStringEncodingUTF8,
            );
            (copied != 0).then(|| CStr::from_ptr(buffer.as_ptr()).to_string_lossy().into_owned())
        }
    };

    unsafe { CFRelease(value) };
    result
}

/// Converts a timeout into IOKit's milliseconds; zero would mean "no timeout", so it's rounded up.
pub(crate) fn to_iokit_timeout(timeout: Duration) -> u32 {
    match u32::try_from(timeout.as_millis()) {
        Ok(milliseconds) => milliseconds.max(1),
        Err(_) => {
            warn!(
                "A wildly long timeout ({}s) was truncated to u32::MAX milliseconds.",
                timeout.as_secs_f64()
            );
            u32::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_clamped() {
        assert_eq!(to_iokit_timeout(Duration::from_millis(250)), 250);
        assert_eq!(to_iokit_timeout(Duration::from_micros(10)), 1);
        assert_eq!(to_iokit_timeout(Duration::from_secs(u64::MAX / 1000)), u32::MAX);
    }
}
