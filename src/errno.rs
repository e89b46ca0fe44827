//! USB-layer completion status to Linux errno mapping (spec.md §4.F
//! "Status mapping"). The mapping is deliberately not "fixed" per
//! spec.md §9: `Nak -> -EPROTO` is the source behavior, kept as-is.

/// Completion status as reported by the capture-driver adapter,
/// independent of any particular kernel's USB stack error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    Ok,
    Stall,
    DeviceNotResponding,
    Crc,
    Nak,
    Underrun,
    Overrun,
    Unknown,
}

pub const EPIPE: i32 = -32;
pub const ETIME: i32 = -62;
pub const EILSEQ: i32 = -84;
pub const EPROTO: i32 = -71;
pub const EREMOTEIO: i32 = -121;
pub const EOVERFLOW: i32 = -75;
pub const ECONNRESET: i32 = -104;

/// Maps a [`UsbStatus`] to the Linux errno `usbip` expects in
/// `RET_SUBMIT.status` (0 for success, negative errno otherwise).
pub fn to_errno(status: UsbStatus) -> i32 {
    match status {
        UsbStatus::Ok => 0,
        UsbStatus::Stall => EPIPE,
        UsbStatus::DeviceNotResponding => ETIME,
        UsbStatus::Crc => EILSEQ,
        UsbStatus::Nak => EPROTO,
        UsbStatus::Underrun => EREMOTEIO,
        UsbStatus::Overrun => EOVERFLOW,
        UsbStatus::Unknown => EPROTO,
    }
}
