//! Wire codec for the USB/IP protocol: fixed-size, big-endian frame
//! shapes for the control exchange (`OP_REQ_*`/`OP_REP_*`) and the
//! per-URB command/return stream (`USBIP_CMD_*`/`USBIP_RET_*`).
//!
//! Every struct here is `#[repr(C)]` + `Pod`/`Zeroable` so a frame is
//! read or written with a single `bytemuck::bytes_of`/`from_bytes`
//! call against the exact byte count the protocol defines — no field
//! is ever serialized by hand.

use crate::endian::{BeI32, BeU16, BeU32};
use bytemuck::{Pod, Zeroable};

pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

pub const USBIP_DIR_OUT: u32 = 0;
pub const USBIP_DIR_IN: u32 = 1;

pub const ST_OK: u32 = 0;
pub const ST_ERROR: u32 = 1;

// linux include/uapi/linux/usb/ch9.h usb_device_speed
pub const USB_SPEED_UNKNOWN: u32 = 0;
pub const USB_SPEED_LOW: u32 = 1;
pub const USB_SPEED_FULL: u32 = 2;
pub const USB_SPEED_HIGH: u32 = 3;
pub const USB_SPEED_WIRELESS: u32 = 4;
pub const USB_SPEED_SUPER: u32 = 5;
pub const USB_SPEED_SUPER_PLUS: u32 = 6;

pub const USB_BUSID_SIZE: usize = 32;
pub const USB_PATH_SIZE: usize = 256;

/// Common 8-byte header shared by every `OP_REQ_*`/`OP_REP_*` frame.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpHeader {
    pub version: BeU16,
    pub command: BeU16,
    pub status: BeU32,
}

impl UsbIpHeader {
    pub fn new(command: u16, status: u32) -> Self {
        Self {
            version: BeU16::new(USBIP_VERSION),
            command: BeU16::new(command),
            status: BeU32::new(status),
        }
    }
}

/// `OP_REP_DEVLIST` reply header; `num_exported_device` copies of
/// [`UsbDevice`] (each followed by its interfaces) follow on the wire.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct OpRepDevlistHeader {
    pub header: UsbIpHeader,
    pub num_exported_device: BeU32,
}

/// Device record, 0x138 bytes, as embedded in `OP_REP_DEVLIST` and
/// `OP_REP_IMPORT`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbDevice {
    pub path: [u8; USB_PATH_SIZE],
    pub busid: [u8; USB_BUSID_SIZE],
    pub busnum: BeU32,
    pub devnum: BeU32,
    pub speed: BeU32,
    pub id_vendor: BeU16,
    pub id_product: BeU16,
    pub bcd_device: BeU16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

/// Interface tuple following a [`UsbDevice`] record, 4 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbInterface {
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub padding: u8,
}

/// `OP_REQ_IMPORT` request.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct OpReqImport {
    pub header: UsbIpHeader,
    pub busid: [u8; USB_BUSID_SIZE],
}

/// `OP_REP_IMPORT` reply. When `header.status != 0` the `device` field
/// is meaningless — callers construct the error variant with a zeroed
/// device record, never a partially filled one.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct OpRepImport {
    pub header: UsbIpHeader,
    pub device: UsbDevice,
}

/// Shared prefix of `USBIP_CMD_SUBMIT`/`USBIP_RET_SUBMIT`/`USBIP_CMD_UNLINK`/`USBIP_RET_UNLINK`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpHeaderBasic {
    pub command: BeU32,
    pub seqnum: BeU32,
    pub devid: BeU32,
    pub direction: BeU32,
    pub ep: BeU32,
}

impl UsbIpHeaderBasic {
    pub fn new(command: u32, seqnum: u32, devid: u32, direction: u32, ep: u32) -> Self {
        Self {
            command: BeU32::new(command),
            seqnum: BeU32::new(seqnum),
            devid: BeU32::new(devid),
            direction: BeU32::new(direction),
            ep: BeU32::new(ep),
        }
    }
}

/// `USBIP_CMD_SUBMIT`, 48 bytes. `transfer_buffer_length` bytes of OUT
/// payload, then (if `number_of_packets > 0`) that many
/// [`UsbIpIsoPacketDescriptor`]s, follow on the wire.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpCmdSubmit {
    pub header: UsbIpHeaderBasic,
    pub transfer_flags: BeU32,
    pub transfer_buffer_length: BeI32,
    pub start_frame: BeI32,
    pub number_of_packets: BeI32,
    pub interval: BeI32,
    pub setup: [u8; 8],
}

/// `USBIP_RET_SUBMIT`, 48 bytes. IN payload (`actual_length` bytes),
/// then iso descriptors, follow on the wire. `setup` is unused on
/// return but present to keep the header fixed at 48 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpRetSubmit {
    pub header: UsbIpHeaderBasic,
    pub status: BeI32,
    pub actual_length: BeI32,
    pub start_frame: BeI32,
    pub number_of_packets: BeI32,
    pub error_count: BeI32,
    pub setup: [u8; 8],
}

/// `USBIP_CMD_UNLINK`, 48 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpCmdUnlink {
    pub header: UsbIpHeaderBasic,
    pub unlink_seqnum: BeU32,
    pub padding: [u8; 24],
}

/// `USBIP_RET_UNLINK`, 48 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpRetUnlink {
    pub header: UsbIpHeaderBasic,
    pub status: BeI32,
    pub padding: [u8; 24],
}

/// Isochronous packet descriptor, 16 bytes, repeated `number_of_packets`
/// times after the payload of an iso `CMD_SUBMIT`/`RET_SUBMIT`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UsbIpIsoPacketDescriptor {
    pub offset: BeU32,
    pub length: BeU32,
    pub actual_length: BeU32,
    pub status: BeI32,
}

// USB transfer flags (linux include/uapi/linux/usb.h, subset actually consulted)
pub const URB_SHORT_NOT_OK: u32 = 0x0000_0001;
pub const URB_ISO_ASAP: u32 = 0x0000_0002;
pub const URB_ZERO_PACKET: u32 = 0x0000_0040;

// USB endpoint transfer types
pub const USB_ENDPOINT_XFER_CONTROL: u8 = 0;
pub const USB_ENDPOINT_XFER_ISOC: u8 = 1;
pub const USB_ENDPOINT_XFER_BULK: u8 = 2;
pub const USB_ENDPOINT_XFER_INT: u8 = 3;

/// Direction tag carried on the wire as `USBIP_DIR_{OUT,IN}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_wire(value: u32) -> anyhow::Result<Self> {
        match value {
            USBIP_DIR_OUT => Ok(Direction::Out),
            USBIP_DIR_IN => Ok(Direction::In),
            other => Err(anyhow::anyhow!("invalid URB direction {other}")),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Direction::Out => USBIP_DIR_OUT,
            Direction::In => USBIP_DIR_IN,
        }
    }
}

/// Extracts the NUL-padded ASCII busid field used by [`OpReqImport`]
/// and [`UsbDevice`] as a `&str`, trimming trailing NULs.
pub fn busid_str(field: &[u8]) -> anyhow::Result<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).map_err(|e| anyhow::anyhow!("non-UTF8 busid field: {e}"))
}

/// Writes `s` into a fixed-size NUL-padded field, erroring if it does
/// not fit (including the terminating NUL expected by peers).
pub fn write_fixed_str(dst: &mut [u8], s: &str) -> anyhow::Result<()> {
    if s.len() >= dst.len() {
        anyhow::bail!("string {s:?} does not fit in {}-byte field", dst.len());
    }
    dst.fill(0);
    dst[..s.len()].copy_from_slice(s.as_bytes());
    Ok(())
}
