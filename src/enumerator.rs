//! Device enumeration (spec.md §4.A "Device enumerator"): the opaque
//! boundary between the core and whatever platform mechanism lists
//! locally attached USB devices. The trait and its `Mock` are the
//! primary surface this crate is tested against; [`LinuxSysfsEnumerator`]
//! is a thin, best-effort real backend.

use crate::bus_id::BusId;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

/// Everything the core needs to know about a connected device to list
/// it and, if shared, describe it on the wire (spec.md §3
/// "ExportedDevice").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub bus_id: BusId,
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub bcd_device: u16,
    pub speed: u32,
    pub num_configurations: u8,
    pub configuration_value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

impl ExportedDevice {
    pub fn instance_id(&self) -> String {
        format!("USB\\VID_{:04X}&PID_{:04X}", self.vendor_id, self.product_id)
    }
}

/// Lists currently connected devices. Implementations must silently
/// drop nodes they cannot fully read rather than fail the whole scan
/// (spec.md §4.A "Edge cases": a device disappearing mid-enumeration
/// is not an error).
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn list_connected(&self) -> anyhow::Result<Vec<ExportedDevice>>;

    /// Convenience wrapper used by the control-channel handler
    /// (spec.md §4.D `OP_REQ_IMPORT`): `None` if the bus-id is not
    /// currently present.
    async fn find(&self, bus_id: BusId) -> anyhow::Result<Option<ExportedDevice>> {
        Ok(self
            .list_connected()
            .await?
            .into_iter()
            .find(|d| d.bus_id == bus_id))
    }
}

/// Fixed-catalog enumerator for tests: returns whatever was configured
/// regardless of the host's actual hardware.
pub struct MockEnumerator {
    devices: Vec<ExportedDevice>,
}

impl MockEnumerator {
    pub fn new(devices: Vec<ExportedDevice>) -> Self {
        Self { devices }
    }

    pub fn empty() -> Self {
        Self { devices: Vec::new() }
    }
}

#[async_trait]
impl DeviceEnumerator for MockEnumerator {
    async fn list_connected(&self) -> anyhow::Result<Vec<ExportedDevice>> {
        let mut devices = self.devices.clone();
        devices.sort_by_key(|d| d.bus_id);
        Ok(devices)
    }
}

/// Reads `/sys/bus/usb/devices/*` the way the kernel's own `usbip`
/// tooling does: one directory per device, attribute files for the
/// descriptor fields. Interface directories are the device's own
/// directory suffixed `:<config>.<interface>`.
pub struct LinuxSysfsEnumerator {
    root: std::path::PathBuf,
}

impl LinuxSysfsEnumerator {
    pub fn new() -> Self {
        Self {
            root: Path::new("/sys/bus/usb/devices").to_path_buf(),
        }
    }

    #[cfg(test)]
    fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_attr_u32(dir: &Path, name: &str, radix: u32) -> Option<u32> {
        let text = tokio::fs::read_to_string(dir.join(name)).await.ok()?;
        u32::from_str_radix(text.trim().trim_start_matches("0x"), radix).ok()
    }

    async fn read_attr_u16_hex(dir: &Path, name: &str) -> Option<u16> {
        let text = tokio::fs::read_to_string(dir.join(name)).await.ok()?;
        u16::from_str_radix(text.trim(), 16).ok()
    }

    async fn read_device(dir: &Path) -> Option<ExportedDevice> {
        let busnum = Self::read_attr_u32(dir, "busnum", 10).await?;
        let devnum = Self::read_attr_u32(dir, "devnum", 10).await?;
        let bus_id = BusId::new(busnum as u16, devnum as u16)?;
        let vendor_id = Self::read_attr_u16_hex(dir, "idVendor").await?;
        let product_id = Self::read_attr_u16_hex(dir, "idProduct").await?;
        let bcd_device = Self::read_attr_u16_hex(dir, "bcdDevice").await.unwrap_or(0);
        let device_class = Self::read_attr_u32(dir, "bDeviceClass", 16).await.unwrap_or(0) as u8;
        let device_subclass = Self::read_attr_u32(dir, "bDeviceSubClass", 16).await.unwrap_or(0) as u8;
        let device_protocol = Self::read_attr_u32(dir, "bDeviceProtocol", 16).await.unwrap_or(0) as u8;
        let num_configurations = Self::read_attr_u32(dir, "bNumConfigurations", 10).await.unwrap_or(0) as u8;
        let configuration_value = Self::read_attr_u32(dir, "bConfigurationValue", 10).await.unwrap_or(0) as u8;
        let speed = match tokio::fs::read_to_string(dir.join("speed")).await.ok() {
            Some(s) => match s.trim() {
                "1.5" => crate::proto::USB_SPEED_LOW,
                "12" => crate::proto::USB_SPEED_FULL,
                "480" => crate::proto::USB_SPEED_HIGH,
                "5000" => crate::proto::USB_SPEED_SUPER,
                "10000" => crate::proto::USB_SPEED_SUPER_PLUS,
                _ => crate::proto::USB_SPEED_UNKNOWN,
            },
            None => crate::proto::USB_SPEED_UNKNOWN,
        };

        let mut interfaces = Vec::new();
        let prefix = format!("{busnum}-{devnum}:");
        if let Ok(mut entries) = tokio::fs::read_dir(dir.parent().unwrap_or(dir)).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with(&prefix) {
                    continue;
                }
                let iface_dir = entry.path();
                let class = Self::read_attr_u32(&iface_dir, "bInterfaceClass", 16).await.unwrap_or(0) as u8;
                let subclass = Self::read_attr_u32(&iface_dir, "bInterfaceSubClass", 16).await.unwrap_or(0) as u8;
                let protocol = Self::read_attr_u32(&iface_dir, "bInterfaceProtocol", 16).await.unwrap_or(0) as u8;
                interfaces.push(InterfaceInfo {
                    interface_class: class,
                    interface_subclass: subclass,
                    interface_protocol: protocol,
                });
            }
        }

        Some(ExportedDevice {
            bus_id,
            path: dir.to_string_lossy().into_owned(),
            vendor_id,
            product_id,
            device_class,
            device_subclass,
            device_protocol,
            bcd_device,
            speed,
            num_configurations,
            configuration_value,
            interfaces,
        })
    }
}

impl Default for LinuxSysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceEnumerator for LinuxSysfsEnumerator {
    async fn list_connected(&self) -> anyhow::Result<Vec<ExportedDevice>> {
        let mut devices = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(devices),
            Err(e) => return Err(e.into()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Interface nodes ("1-2:1.0") and root hubs ("usb1") are not
            // devices in their own right; skip them here.
            if name.contains(':') || name.starts_with("usb") {
                continue;
            }
            if let Some(device) = Self::read_device(&entry.path()).await {
                devices.push(device);
            }
        }
        devices.sort_by_key(|d| d.bus_id);
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bus: u16, port: u16) -> ExportedDevice {
        ExportedDevice {
            bus_id: BusId::new(bus, port).unwrap(),
            path: format!("/sys/bus/usb/devices/{bus}-{port}"),
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            bcd_device: 0x0100,
            speed: crate::proto::USB_SPEED_HIGH,
            num_configurations: 1,
            configuration_value: 1,
            interfaces: vec![InterfaceInfo {
                interface_class: 8,
                interface_subclass: 6,
                interface_protocol: 0x50,
            }],
        }
    }

    #[tokio::test]
    async fn mock_sorts_by_bus_id() {
        let mock = MockEnumerator::new(vec![sample(2, 1), sample(1, 9)]);
        let listed = mock.list_connected().await.unwrap();
        assert_eq!(listed[0].bus_id, BusId::new(1, 9).unwrap());
        assert_eq!(listed[1].bus_id, BusId::new(2, 1).unwrap());
    }

    #[tokio::test]
    async fn find_returns_none_for_absent_device() {
        let mock = MockEnumerator::new(vec![sample(1, 1)]);
        assert!(mock.find(BusId::new(9, 9).unwrap()).await.unwrap().is_none());
        assert!(mock.find(BusId::new(1, 1).unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn instance_id_matches_vid_pid() {
        let d = sample(1, 1);
        assert_eq!(d.instance_id(), "USB\\VID_1234&PID_5678");
    }

    #[tokio::test]
    async fn sysfs_reads_device_and_interface_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let dev_dir = dir.path().join("1-2");
        tokio::fs::create_dir_all(&dev_dir).await.unwrap();
        tokio::fs::write(dev_dir.join("busnum"), "1\n").await.unwrap();
        tokio::fs::write(dev_dir.join("devnum"), "2\n").await.unwrap();
        tokio::fs::write(dev_dir.join("idVendor"), "1234\n").await.unwrap();
        tokio::fs::write(dev_dir.join("idProduct"), "5678\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bcdDevice"), "0100\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bDeviceClass"), "00\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bDeviceSubClass"), "00\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bDeviceProtocol"), "00\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bNumConfigurations"), "1\n").await.unwrap();
        tokio::fs::write(dev_dir.join("bConfigurationValue"), "1\n").await.unwrap();
        tokio::fs::write(dev_dir.join("speed"), "480\n").await.unwrap();

        let iface_dir = dir.path().join("1-2:1.0");
        tokio::fs::create_dir_all(&iface_dir).await.unwrap();
        tokio::fs::write(iface_dir.join("bInterfaceClass"), "08\n").await.unwrap();
        tokio::fs::write(iface_dir.join("bInterfaceSubClass"), "06\n").await.unwrap();
        tokio::fs::write(iface_dir.join("bInterfaceProtocol"), "50\n").await.unwrap();

        let enumerator = LinuxSysfsEnumerator::with_root(dir.path());
        let devices = enumerator.list_connected().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].bus_id, BusId::new(1, 2).unwrap());
        assert_eq!(devices[0].vendor_id, 0x1234);
        assert_eq!(devices[0].speed, crate::proto::USB_SPEED_HIGH);
        assert_eq!(devices[0].interfaces.len(), 1);
        assert_eq!(devices[0].interfaces[0].interface_class, 8);
    }
}
