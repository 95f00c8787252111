//! Windows implementation of the local-attach client, grounded directly in
//! `win32-attach.cpp`: enumerate the `usbip-win2` driver's device-interface
//! GUID, open it, and issue the attach IOCTL.

#![cfg(windows)]

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_Device_Interface_ListW, CM_Get_Device_Interface_List_SizeW,
    CM_GET_DEVICE_INTERFACE_LIST_PRESENT, CR_BUFFER_SMALL, CR_SUCCESS,
};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::error::{AttachError, AttachStage};

/// `{B4030C06-DC5F-4FCC-87EB-E5515A0935C0}`, taken from the `usbip-win2`
/// driver.
const USBIP_WIN2_DEVICE_GUID: GUID = GUID {
    data1: 0xB403_0C06,
    data2: 0xDC5F,
    data3: 0x4FCC,
    data4: [0x87, 0xEB, 0xE5, 0x51, 0x5A, 0x09, 0x35, 0xC0],
};

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_DATA: u32 = 0x0001;
const FILE_WRITE_DATA: u32 = 0x0002;

const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const ATTACH_IOCTL_CODE: u32 = ctl_code(
    FILE_DEVICE_UNKNOWN,
    0x800,
    METHOD_BUFFERED,
    FILE_READ_DATA | FILE_WRITE_DATA,
);

const BUS_ID_FIELD_LEN: usize = 32;
const SERVICE_FIELD_LEN: usize = 32; // NI_MAXSERV
const HOST_FIELD_LEN: usize = 1025; // NI_MAXHOST

/// Mirrors `AttachIOCTL` / `PLUGIN_HARDWARE` in `usbip-win2`.
#[repr(C)]
struct AttachIoctl {
    size: u32,
    port_output: i32,
    bus_id: [u8; BUS_ID_FIELD_LEN],
    service: [u8; SERVICE_FIELD_LEN],
    host: [u8; HOST_FIELD_LEN],
}

fn discover_device_path() -> Result<Vec<u16>, AttachError> {
    loop {
        let mut guid = USBIP_WIN2_DEVICE_GUID;
        let mut cch: u32 = 0;
        let cr = unsafe {
            CM_Get_Device_Interface_List_SizeW(
                &mut cch,
                &mut guid,
                ptr::null(),
                CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
            )
        };
        if cr != CR_SUCCESS {
            return Err(AttachError::new(AttachStage::Discovery, cr));
        }
        if cch == 0 {
            return Err(AttachError::new(AttachStage::Discovery, 0));
        }

        let mut buf = vec![0u16; cch as usize];
        let cr = unsafe {
            CM_Get_Device_Interface_ListW(
                &mut guid,
                ptr::null(),
                buf.as_mut_ptr(),
                cch,
                CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
            )
        };
        match cr {
            CR_SUCCESS => {
                let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
                if end != buf.len().saturating_sub(2) && buf.len() >= 2 {
                    return Err(AttachError::new(AttachStage::Discovery, 0));
                }
                buf.truncate(end);
                return Ok(buf);
            }
            CR_BUFFER_SMALL => continue,
            other => return Err(AttachError::new(AttachStage::Discovery, other)),
        }
    }
}

fn to_fixed_bytes<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Blocking: runs on a `spawn_blocking` thread, since these IOCTLs are
/// synchronous.
pub fn attach_blocking(tcp_port: u16, bus_id: &str) -> Result<u16, AttachError> {
    if bus_id.len() >= BUS_ID_FIELD_LEN {
        return Err(AttachError::new(AttachStage::ArgumentValidation, 0));
    }

    let device_path = discover_device_path()?;

    let mut ioctl = AttachIoctl {
        size: size_of::<AttachIoctl>() as u32,
        port_output: 0,
        bus_id: to_fixed_bytes::<BUS_ID_FIELD_LEN>(bus_id),
        service: to_fixed_bytes::<SERVICE_FIELD_LEN>(&tcp_port.to_string()),
        host: to_fixed_bytes::<HOST_FIELD_LEN>("localhost"),
    };

    let mut path = device_path;
    path.push(0);
    let handle: HANDLE = unsafe {
        CreateFileW(
            path.as_ptr(),
            windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_READ
                | windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(AttachError::new(AttachStage::Open, unsafe { GetLastError() }));
    }

    let writable_len = (size_of::<u32>() + size_of::<i32>()) as u32;
    let mut bytes_returned: u32 = 0;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            ATTACH_IOCTL_CODE,
            &mut ioctl as *mut _ as *mut c_void,
            size_of::<AttachIoctl>() as u32,
            &mut ioctl as *mut _ as *mut c_void,
            writable_len,
            &mut bytes_returned,
            ptr::null_mut(),
        )
    };
    unsafe { CloseHandle(handle) };

    if ok == 0 {
        return Err(AttachError::new(AttachStage::IOControl, unsafe { GetLastError() }));
    }
    if ioctl.port_output <= 0 {
        return Err(AttachError::new(AttachStage::ResponseValidation, 0));
    }
    Ok(ioctl.port_output as u16)
}
