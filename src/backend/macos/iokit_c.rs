//! FFI declarations for the IOUSBLib plugin interfaces, which io-kit-sys doesn't cover.
//!
//! The vtables mirror IOUSBLib.h. Slots we never call are declared as [Unused], which keeps
//! every later slot at the right offset.

#![allow(non_camel_case_types, non_snake_case, non_upper_case_globals, dead_code)]

use std::ffi::c_void;

use core_foundation_sys::{
    base::{kCFAllocatorSystemDefault, SInt32},
    runloop::CFRunLoopSourceRef,
    uuid::{CFUUIDBytes, CFUUIDRef},
};
use io_kit_sys::{
    ret::IOReturn,
    types::{io_iterator_t, io_service_t},
};

type This = *mut c_void;
type ULONG = std::os::raw::c_ulong;
type HRESULT = SInt32;

/// Completion callback for asynchronous requests: (refcon, result, bytes transferred).
pub(crate) type AsyncCallback = unsafe extern "C" fn(refcon: *mut c_void, result: IOReturn, arg0: *mut c_void);

/// Placeholder for a vtable slot we never call.
pub(crate) type Unused = Option<unsafe extern "C" fn()>;

type Call<Args> = Option<Args>;

// Error codes of the USB family: iokit_usb_err(code) = 0xe0004000 | code.
pub(crate) const kIOUSBPipeStalled: IOReturn = 0xe000_404f_u32 as IOReturn;
pub(crate) const kIOUSBTransactionTimeout: IOReturn = 0xe000_4051_u32 as IOReturn;
pub(crate) const kIOUSBNoAsyncPortErr: IOReturn = 0xe000_405f_u32 as IOReturn;
pub(crate) const kIOUSBUnknownPipeErr: IOReturn = 0xe000_4061_u32 as IOReturn;

pub(crate) const kIOReturnNotPrivileged: IOReturn = 0xe000_02c1_u32 as IOReturn;
pub(crate) const kIOReturnUnsupported: IOReturn = 0xe000_02c7_u32 as IOReturn;
pub(crate) const kIOReturnNotPermitted: IOReturn = 0xe000_02e2_u32 as IOReturn;

pub(crate) const kIOUSBFindInterfaceDontCare: u16 = 0xffff;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct IOUSBDevRequest {
    pub(crate) bmRequestType: u8,
    pub(crate) bRequest: u8,
    pub(crate) wValue: u16,
    pub(crate) wIndex: u16,
    pub(crate) wLength: u16,
    pub(crate) pData: *mut c_void,
    pub(crate) wLenDone: u32,
}

impl Default for IOUSBDevRequest {
    fn default() -> Self {
        IOUSBDevRequest {
            bmRequestType: 0,
            bRequest: 0,
            wValue: 0,
            wIndex: 0,
            wLength: 0,
            pData: std::ptr::null_mut(),
            wLenDone: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct IOUSBFindInterfaceRequest {
    pub(crate) bInterfaceClass: u16,
    pub(crate) bInterfaceSubClass: u16,
    pub(crate) bInterfaceProtocol: u16,
    pub(crate) bAlternateSetting: u16,
}

#[repr(C)]
pub(crate) struct IOCFPlugInInterface {
    pub(crate) _reserved: *mut c_void,
    pub(crate) QueryInterface: Call<unsafe extern "C" fn(This, CFUUIDBytes, *mut *mut c_void) -> HRESULT>,
    pub(crate) AddRef: Unused,
    pub(crate) Release: Call<unsafe extern "C" fn(This) -> ULONG>,
    pub(crate) version: u16,
    pub(crate) revision: u16,
    pub(crate) Probe: Unused,
    pub(crate) Start: Unused,
    pub(crate) Stop: Unused,
}

/// IOUSBDeviceInterface500.
#[repr(C)]
pub(crate) struct IOUSBDeviceStruct500 {
    pub(crate) _reserved: *mut c_void,
    pub(crate) QueryInterface: Unused,
    pub(crate) AddRef: Unused,
    pub(crate) Release: Call<unsafe extern "C" fn(This) -> ULONG>,
    pub(crate) CreateDeviceAsyncEventSource: Call<unsafe extern "C" fn(This, *mut CFRunLoopSourceRef) -> IOReturn>,
    pub(crate) GetDeviceAsyncEventSource: Unused,
    pub(crate) CreateDeviceAsyncPort: Unused,
    pub(crate) GetDeviceAsyncPort: Unused,
    pub(crate) USBDeviceOpen: Call<unsafe extern "C" fn(This) -> IOReturn>,
    pub(crate) USBDeviceClose: Call<unsafe extern "C" fn(This) -> IOReturn>,
    pub(crate) GetDeviceClass: Unused,
    pub(crate) GetDeviceSubClass: Unused,
    pub(crate) GetDeviceProtocol: Unused,
    pub(crate) GetDeviceVendor: Unused,
    pub(crate) GetDeviceProduct: Unused,
    pub(crate) GetDeviceReleaseNumber: Unused,
    pub(crate) GetDeviceAddress: Unused,
    pub(crate) GetDeviceBusPowerAvailable: Unused,
    pub(crate) GetDeviceSpeed: Unused,
    pub(crate) GetNumberOfConfigurations: Call<unsafe extern "C" fn(This, *mut u8) -> IOReturn>,
    pub(crate) GetLocationID: Unused,
    pub(crate) GetConfigurationDescriptorPtr: Call<unsafe extern "C" fn(This, u8, *mut *const u8) -> IOReturn>,
    pub(crate) GetConfiguration: Call<unsafe extern "C" fn(This, *mut u8) -> IOReturn>,
    pub(crate) SetConfiguration: Call<unsafe extern "C" fn(This, u8) -> IOReturn>,
    pub(crate) GetBusFrameNumber: Unused,
    pub(crate) ResetDevice: Unused,
    pub(crate) DeviceRequest: Call<unsafe extern "C" fn(This, *mut IOUSBDevRequest) -> IOReturn>,
    pub(crate) DeviceRequestAsync: Call<
        unsafe extern "C" fn(This, *mut IOUSBDevRequest, AsyncCallback, *mut c_void) -> IOReturn,
    >,
    pub(crate) CreateInterfaceIterator: Call<
        unsafe extern "C" fn(This, *mut IOUSBFindInterfaceRequest, *mut io_iterator_t) -> IOReturn,
    >,
    pub(crate) USBDeviceOpenSeize: Unused,
    pub(crate) DeviceRequestTO: Unused,
    pub(crate) DeviceRequestAsyncTO: Unused,
    pub(crate) USBDeviceSuspend: Unused,
    pub(crate) USBDeviceAbortPipeZero: Call<unsafe extern "C" fn(This) -> IOReturn>,
    pub(crate) USBGetManufacturerStringIndex: Unused,
    pub(crate) USBGetProductStringIndex: Unused,
    pub(crate) USBGetSerialNumberStringIndex: Unused,
    pub(crate) USBDeviceReEnumerate: Unused,
    pub(crate) GetBusMicroFrameNumber: Unused,
    pub(crate) GetIOUSBLibVersion: Unused,
    pub(crate) GetBusFrameNumberWithTime: Unused,
    pub(crate) GetUSBDeviceInformation: Unused,
    pub(crate) RequestExtraPower: Unused,
    pub(crate) ReturnExtraPower: Unused,
    pub(crate) GetExtraPowerAllocated: Unused,
    pub(crate) GetBandwidthAvailableForDevice: Unused,
}

/// IOUSBInterfaceInterface500.
#[repr(C)]
pub(crate) struct IOUSBInterfaceStruct500 {
    pub(crate) _reserved: *mut c_void,
    pub(crate) QueryInterface: Unused,
    pub(crate) AddRef: Unused,
    pub(crate) Release: Call<unsafe extern "C" fn(This) -> ULONG>,
    pub(crate) CreateInterfaceAsyncEventSource: Call<unsafe extern "C" fn(This, *mut CFRunLoopSourceRef) -> IOReturn>,
    pub(crate) GetInterfaceAsyncEventSource: Unused,
    pub(crate) CreateInterfaceAsyncPort: Unused,
    pub(crate) GetInterfaceAsyncPort: Unused,
    pub(crate) USBInterfaceOpen: Call<unsafe extern "C" fn(This) -> IOReturn>,
    pub(crate) USBInterfaceClose: Call<unsafe extern "C" fn(This) -> IOReturn>,
    pub(crate) GetInterfaceClass: Unused,
    pub(crate) GetInterfaceSubClass: Unused,
    pub(crate) GetInterfaceProtocol: Unused,
    pub(crate) GetDeviceVendor: Unused,
    pub(crate) GetDeviceProduct: Unused,
    pub(crate) GetDeviceReleaseNumber: Unused,
    pub(crate) GetConfigurationValue: Unused,
    pub(crate) GetInterfaceNumber: Call<unsafe extern "C" fn(This, *mut u8) -> IOReturn>,
    pub(crate) GetAlternateSetting: Unused,
    pub(crate) GetNumEndpoints: Call<unsafe extern "C" fn(This, *mut u8) -> IOReturn>,
    pub(crate) GetLocationID: Unused,
    pub(crate) GetDevice: Unused,
    pub(crate) SetAlternateInterface: Call<unsafe extern "C" fn(This, u8) -> IOReturn>,
    pub(crate) GetBusFrameNumber: Unused,
    pub(crate) ControlRequest: Unused,
    pub(crate) ControlRequestAsync: Unused,
    pub(crate) GetPipeProperties: Call<
        unsafe extern "C" fn(This, u8, *mut u8, *mut u8, *mut u8, *mut u16, *mut u8) -> IOReturn,
    >,
    pub(crate) GetPipeStatus: Unused,
    pub(crate) AbortPipe: Call<unsafe extern "C" fn(This, u8) -> IOReturn>,
    pub(crate) ResetPipe: Unused,
    pub(crate) ClearPipeStall: Unused,
    pub(crate) ReadPipe: Unused,
    pub(crate) WritePipe: Unused,
    pub(crate) ReadPipeAsync: Call<
        unsafe extern "C" fn(This, u8, *mut c_void, u32, AsyncCallback, *mut c_void) -> IOReturn,
    >,
    pub(crate) WritePipeAsync: Call<
        unsafe extern "C" fn(This, u8, *mut c_void, u32, AsyncCallback, *mut c_void) -> IOReturn,
    >,
    pub(crate) ReadIsochPipeAsync: Unused,
    pub(crate) WriteIsochPipeAsync: Unused,
    pub(crate) ControlRequestTO: Unused,
    pub(crate) ControlRequestAsyncTO: Unused,
    pub(crate) ReadPipeTO: Unused,
    pub(crate) WritePipeTO: Unused,
    pub(crate) ReadPipeAsyncTO: Call<
        unsafe extern "C" fn(This, u8, *mut c_void, u32, u32, u32, AsyncCallback, *mut c_void) -> IOReturn,
    >,
    pub(crate) WritePipeAsyncTO: Call<
        unsafe extern "C" fn(This, u8, *mut c_void, u32, u32, u32, AsyncCallback, *mut c_void) -> IOReturn,
    >,
    pub(crate) USBInterfaceGetStringIndex: Unused,
    pub(crate) USBInterfaceOpenSeize: Unused,
    pub(crate) ClearPipeStallBothEnds: Call<unsafe extern "C" fn(This, u8) -> IOReturn>,
    pub(crate) SetPipePolicy: Unused,
    pub(crate) GetBandwidthAvailable: Unused,
    pub(crate) GetEndpointProperties: Unused,
    pub(crate) LowLatencyReadIsochPipeAsync: Unused,
    pub(crate) LowLatencyWriteIsochPipeAsync: Unused,
    pub(crate) LowLatencyCreateBuffer: Unused,
    pub(crate) LowLatencyDestroyBuffer: Unused,
    pub(crate) GetBusMicroFrameNumber: Unused,
    pub(crate) GetFrameListTime: Unused,
    pub(crate) GetIOUSBLibVersion: Unused,
    pub(crate) FindNextAssociatedDescriptor: Unused,
    pub(crate) FindNextAltInterface: Unused,
    pub(crate) GetBusFrameNumberWithTime: Unused,
    pub(crate) GetPipePropertiesV2: Unused,
}

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    pub(crate) fn IOCreatePlugInInterfaceForService(
        service: io_service_t,
        pluginType: CFUUIDRef,
        interfaceType: CFUUIDRef,
        theInterface: *mut *mut *mut IOCFPlugInInterface,
        theScore: *mut SInt32,
    ) -> IOReturn;
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    pub(crate) fn CFUUIDGetUUIDBytes(uuid: CFUUIDRef) -> CFUUIDBytes;

    fn CFUUIDGetConstantUUIDWithBytes(
        alloc: *const c_void,
        byte0: u8,
        byte1: u8,
        byte2: u8,
        byte3: u8,
        byte4: u8,
        byte5: u8,
        byte6: u8,
        byte7: u8,
        byte8: u8,
        byte9: u8,
        byte10: u8,
        byte11: u8,
        byte12: u8,
        byte13: u8,
        byte14: u8,
        byte15: u8,
    ) -> CFUUIDRef;
}

fn constant_uuid(b: [u8; 16]) -> CFUUIDRef {
    unsafe {
        CFUUIDGetConstantUUIDWithBytes(
            kCFAllocatorSystemDefault as *const c_void,
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

pub(crate) fn kIOCFPlugInInterfaceID() -> CFUUIDRef {
    constant_uuid([
        0xc2, 0x44, 0xe8, 0x58, 0x10, 0x9c, 0x11, 0xd4, 0x91, 0xd4, 0x00, 0x50, 0xe4, 0xc6, 0x42, 0x6f,
    ])
}

pub(crate) fn kIOUSBDeviceUserClientTypeID() -> CFUUIDRef {
    constant_uuid([
        0x9d, 0xc7, 0xb7, 0x80, 0x9e, 0xc0, 0x11, 0xd4, 0xa5, 0x4f, 0x00, 0x0a, 0x27, 0x05, 0x28, 0x61,
    ])
}

pub(crate) fn kIOUSBInterfaceUserClientTypeID() -> CFUUIDRef {
    constant_uuid([
        0x2d, 0x97, 0x86, 0xc6, 0x9e, 0xf3, 0x11, 0xd4, 0xad, 0x51, 0x00, 0x0a, 0x27, 0x05, 0x28, 0x61,
    ])
}

pub(crate) fn kIOUSBDeviceInterfaceID500() -> CFUUIDRef {
    constant_uuid([
        0xa3, 0x3c, 0xf0, 0x47, 0x4b, 0x5b, 0x48, 0xe2, 0xb5, 0x7d, 0x02, 0x07, 0xfc, 0xea, 0xe1, 0x3b,
    ])
}

pub(crate) fn kIOUSBInterfaceInterfaceID500() -> CFUUIDRef {
    constant_uuid([
        0x6c, 0x0d, 0x38, 0xc3, 0xb0, 0x93, 0x4e, 0xa7, 0x80, 0x9b, 0x09, 0xfb, 0x5d, 0xdd, 0xac, 0x16,
    ])
}
