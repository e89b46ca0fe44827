//! Connected-client protocol handler (spec.md §4.E): serves
//! `OP_REQ_DEVLIST`/`OP_REQ_IMPORT` on a freshly accepted connection,
//! then hands the socket to the attached-client engine on successful
//! import.

use crate::bus_id::BusId;
use crate::capture::CaptureDriver;
use crate::config::ServerConfig;
use crate::endian::{BeU16, BeU32};
use crate::engine::{self, AttachedSessionArgs};
use crate::enumerator::{DeviceEnumerator, ExportedDevice};
use crate::proto::*;
use crate::registry::Registry;
use bytemuck::bytes_of;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConnectedClientContext {
    pub registry: Registry,
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub capture: Arc<dyn CaptureDriver>,
    pub config: Arc<ServerConfig>,
    pub capture_sink: Option<tokio::sync::mpsc::Sender<crate::capture_sink::CaptureEvent>>,
}

/// Runs a single connection until it closes or is handed off to the
/// attached-client engine. Never returns an error: every failure path
/// is either a protocol-level reply or a logged transport error.
pub async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectedClientContext>, cancellation: CancellationToken) {
    loop {
        let mut header_buf = [0u8; std::mem::size_of::<UsbIpHeader>()];
        let read = tokio::select! {
            r = stream.read_exact(&mut header_buf) => r,
            _ = cancellation.cancelled() => return,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%peer, "client disconnected before issuing a command");
                return;
            }
            Err(e) => {
                warn!(%peer, "read error: {e}");
                return;
            }
        }

        let header: &UsbIpHeader = bytemuck::from_bytes(&header_buf);
        let version = header.version.get();
        let command = header.command.get();

        if version != USBIP_VERSION {
            warn!(%peer, version, "rejecting mismatched protocol version");
            let _ = reply_error_header(&mut stream, command).await;
            return;
        }

        match command {
            OP_REQ_DEVLIST => {
                if handle_devlist(&mut stream, &ctx).await.is_err() {
                    return;
                }
            }
            OP_REQ_IMPORT => {
                match handle_import(&mut stream, peer, header_buf, &ctx).await {
                    Ok(Some((bus_id, session_id))) => {
                        run_handoff(stream, peer, bus_id, session_id, ctx, cancellation).await;
                        return;
                    }
                    Ok(None) => continue,
                    Err(_) => return,
                }
            }
            other => {
                warn!(%peer, command = other, "unknown opcode");
                let _ = reply_error_header(&mut stream, other).await;
                return;
            }
        }
    }
}

async fn reply_error_header(stream: &mut TcpStream, command: u16) -> std::io::Result<()> {
    let reply = UsbIpHeader::new(command, ST_ERROR);
    stream.write_all(bytes_of(&reply)).await?;
    stream.flush().await
}

async fn handle_devlist(stream: &mut TcpStream, ctx: &ConnectedClientContext) -> anyhow::Result<()> {
    let connected = ctx.enumerator.list_connected().await?;
    let shared = ctx.registry.list_shared().await;
    let devices: Vec<ExportedDevice> = connected
        .into_iter()
        .filter(|d| shared.iter().any(|s| s.record.bus_id == d.bus_id))
        .collect();

    let reply_header = OpRepDevlistHeader {
        header: UsbIpHeader::new(OP_REP_DEVLIST, ST_OK),
        num_exported_device: BeU32::new(devices.len() as u32),
    };
    stream.write_all(bytes_of(&reply_header)).await?;
    for device in &devices {
        let record = exported_device_to_wire(device)?;
        stream.write_all(bytes_of(&record)).await?;
        for iface in &device.interfaces {
            let wire_iface = UsbInterface {
                b_interface_class: iface.interface_class,
                b_interface_sub_class: iface.interface_subclass,
                b_interface_protocol: iface.interface_protocol,
                padding: 0,
            };
            stream.write_all(bytes_of(&wire_iface)).await?;
        }
    }
    stream.flush().await?;
    info!(count = devices.len(), "served OP_REQ_DEVLIST");
    Ok(())
}

/// Returns `Ok(Some((bus_id, session_id)))` if the import succeeded
/// and the socket must be handed off to the attached engine,
/// `Ok(None)` if the connection should keep serving more commands.
async fn handle_import(
    stream: &mut TcpStream,
    peer: SocketAddr,
    header_buf: [u8; 8],
    ctx: &Arc<ConnectedClientContext>,
) -> anyhow::Result<Option<(BusId, u64)>> {
    let mut import_buf = [0u8; std::mem::size_of::<OpReqImport>()];
    import_buf[..header_buf.len()].copy_from_slice(&header_buf);
    stream.read_exact(&mut import_buf[header_buf.len()..]).await?;
    let import_req: &OpReqImport = bytemuck::from_bytes(&import_buf);
    let requested_busid = busid_str(&import_req.busid)?;

    let bus_id: BusId = match requested_busid.parse() {
        Ok(b) => b,
        Err(_) => {
            warn!(%peer, busid = requested_busid, "malformed bus-id in OP_REQ_IMPORT");
            reply_import_error(stream).await?;
            return Ok(None);
        }
    };

    let device = match ctx.enumerator.find(bus_id).await? {
        Some(d) => d,
        None => {
            info!(%peer, %bus_id, "import requested for device not currently present");
            reply_import_error(stream).await?;
            return Ok(None);
        }
    };

    if !ctx.registry.is_shared(bus_id).await {
        info!(%peer, %bus_id, "import requested for unshared device");
        reply_import_error(stream).await?;
        return Ok(None);
    }

    let session_id = engine::next_session_id();
    if let Err(e) = ctx.registry.mark_attached(bus_id, peer, session_id).await {
        info!(%peer, %bus_id, "import rejected: {e}");
        reply_import_error(stream).await?;
        return Ok(None);
    }

    let wire_device = exported_device_to_wire(&device)?;
    let reply = OpRepImport {
        header: UsbIpHeader::new(OP_REP_IMPORT, ST_OK),
        device: wire_device,
    };
    stream.write_all(bytes_of(&reply)).await?;
    stream.flush().await?;
    info!(%peer, %bus_id, session_id, "attached");

    Ok(Some((bus_id, session_id)))
}

async fn reply_import_error(stream: &mut TcpStream) -> anyhow::Result<()> {
    let reply = UsbIpHeader::new(OP_REP_IMPORT, ST_ERROR);
    stream.write_all(bytes_of(&reply)).await?;
    stream.flush().await?;
    Ok(())
}

fn exported_device_to_wire(device: &ExportedDevice) -> anyhow::Result<UsbDevice> {
    let mut path = [0u8; USB_PATH_SIZE];
    write_fixed_str(&mut path, &device.path)?;
    let mut busid = [0u8; USB_BUSID_SIZE];
    write_fixed_str(&mut busid, &device.bus_id.to_string())?;
    Ok(UsbDevice {
        path,
        busid,
        busnum: BeU32::new(device.bus_id.bus() as u32),
        devnum: BeU32::new(device.bus_id.port() as u32),
        speed: BeU32::new(device.speed),
        id_vendor: BeU16::new(device.vendor_id),
        id_product: BeU16::new(device.product_id),
        bcd_device: BeU16::new(device.bcd_device),
        b_device_class: device.device_class,
        b_device_sub_class: device.device_subclass,
        b_device_protocol: device.device_protocol,
        b_configuration_value: device.configuration_value,
        b_num_configurations: device.num_configurations,
        b_num_interfaces: device.interfaces.len() as u8,
    })
}

/// Called by the listener once `handle_connection` has consumed the
/// socket past `OP_REQ_IMPORT`; kept separate so the listener can
/// spawn the attached session without the protocol handler needing to
/// know about `AttachedSessionArgs` plumbing.
pub async fn run_handoff(
    stream: TcpStream,
    peer: SocketAddr,
    bus_id: BusId,
    session_id: u64,
    ctx: Arc<ConnectedClientContext>,
    cancellation: CancellationToken,
) {
    let capture_handle = match ctx.capture.open(bus_id).await {
        Ok(h) => h,
        Err(e) => {
            warn!(%peer, %bus_id, "capture open failed during handoff: {e}");
            ctx.registry.mark_detached(bus_id).await;
            return;
        }
    };
    let args = AttachedSessionArgs {
        bus_id,
        device_id: bus_id.device_id(),
        client_address: peer,
        session_id,
        registry: ctx.registry.clone(),
        capture: ctx.capture.clone(),
        capture_handle,
        config: ctx.config.clone(),
        cancellation,
        capture_sink: ctx.capture_sink.clone(),
    };
    engine::run_attached_session(stream, args).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCaptureDriver;
    use crate::enumerator::{InterfaceInfo, MockEnumerator};
    use crate::privilege::AlwaysAllow;

    fn sample(bus_id: BusId) -> ExportedDevice {
        ExportedDevice {
            bus_id,
            path: format!("/sys/bus/usb/devices/{bus_id}"),
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

    async fn context_with(bus_id: BusId, shared: bool) -> (Arc<ConnectedClientContext>, Registry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("devices.json"), Arc::new(AlwaysAllow))
            .await
            .unwrap();
        if shared {
            registry.bind(bus_id, "desc".into(), "inst".into(), true).await.unwrap();
        }
        let enumerator = Arc::new(MockEnumerator::new(vec![sample(bus_id)]));
        let capture = Arc::new(MockCaptureDriver::new(vec![sample(bus_id)]));
        let ctx = Arc::new(ConnectedClientContext {
            registry: registry.clone(),
            enumerator,
            capture,
            config: Arc::new(ServerConfig::default()),
            capture_sink: None,
        });
        (ctx, registry, dir)
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn devlist_filters_to_shared_only() {
        let bus_id = BusId::new(3, 4).unwrap();
        let (ctx, _registry, _dir) = context_with(bus_id, true).await;
        let (mut client, server) = connected_pair().await;
        let peer = server.peer_addr().unwrap();
        let cancellation = CancellationToken::new();
        tokio::spawn(handle_connection(server, peer, ctx, cancellation));

        let req = UsbIpHeader::new(OP_REQ_DEVLIST, ST_OK);
        client.write_all(bytes_of(&req)).await.unwrap();

        let mut head = [0u8; std::mem::size_of::<OpRepDevlistHeader>()];
        client.read_exact(&mut head).await.unwrap();
        let head: &OpRepDevlistHeader = bytemuck::from_bytes(&head);
        assert_eq!(head.header.status.get(), ST_OK);
        assert_eq!(head.num_exported_device.get(), 1);
    }

    #[tokio::test]
    async fn import_unshared_device_is_rejected() {
        let bus_id = BusId::new(3, 4).unwrap();
        let (ctx, _registry, _dir) = context_with(bus_id, false).await;
        let (mut client, server) = connected_pair().await;
        let peer = server.peer_addr().unwrap();
        tokio::spawn(handle_connection(server, peer, ctx, CancellationToken::new()));

        let mut busid_field = [0u8; USB_BUSID_SIZE];
        write_fixed_str(&mut busid_field, "3-4").unwrap();
        let req = OpReqImport {
            header: UsbIpHeader::new(OP_REQ_IMPORT, ST_OK),
            busid: busid_field,
        };
        client.write_all(bytes_of(&req)).await.unwrap();

        let mut reply = [0u8; std::mem::size_of::<UsbIpHeader>()];
        client.read_exact(&mut reply).await.unwrap();
        let reply: &UsbIpHeader = bytemuck::from_bytes(&reply);
        assert_eq!(reply.status.get(), ST_ERROR);
    }

    #[tokio::test]
    async fn import_shared_device_succeeds_and_marks_attached() {
        let bus_id = BusId::new(3, 4).unwrap();
        let (ctx, registry, _dir) = context_with(bus_id, true).await;
        let (mut client, server) = connected_pair().await;
        let peer = server.peer_addr().unwrap();
        tokio::spawn(handle_connection(server, peer, ctx, CancellationToken::new()));

        let mut busid_field = [0u8; USB_BUSID_SIZE];
        write_fixed_str(&mut busid_field, "3-4").unwrap();
        let req = OpReqImport {
            header: UsbIpHeader::new(OP_REQ_IMPORT, ST_OK),
            busid: busid_field,
        };
        client.write_all(bytes_of(&req)).await.unwrap();

        let mut reply = [0u8; std::mem::size_of::<OpRepImport>()];
        client.read_exact(&mut reply).await.unwrap();
        let reply: &OpRepImport = bytemuck::from_bytes(&reply);
        assert_eq!(reply.header.status.get(), ST_OK);
        assert_eq!(busid_str(&reply.device.busid).unwrap(), "3-4");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let shared = registry.list_shared().await;
        assert!(matches!(
            shared[0].attachment,
            crate::registry::AttachmentState::Attached { .. }
        ));
    }
}
