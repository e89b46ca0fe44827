//! The attached-client I/O engine (spec.md §4.F): the full-duplex URB
//! pipeline that is handed a TCP socket after a successful
//! `OP_REQ_IMPORT`. Three tasks — reader, submitter/completion demux,
//! writer — cooperate through bounded channels, exactly as spec.md §5
//! describes the concurrency model.

use crate::bus_id::BusId;
use crate::capture::{CaptureDriver, CaptureHandle, IsoPacketDescriptor, UrbCompletion, UrbRequest};
use crate::config::ServerConfig;
use crate::endian::{BeI32, BeU32};
use crate::proto::*;
use crate::registry::Registry;
use bytemuck::bytes_of;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture_sink::CaptureEvent;

/// Direction-tagged completion target for a submitted URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbDirection {
    Out,
    In,
}

/// spec.md §3 "UrbContext": per in-flight URB bookkeeping the reader
/// creates on `CMD_SUBMIT` and the submitter destroys on completion.
struct UrbContext {
    seqnum: u32,
    endpoint: u8,
    direction: UrbDirection,
    submit_time: Instant,
    original_transfer_buffer_length: i32,
    cancel: CancellationToken,
}

enum EngineCommand {
    Submit {
        ctx: UrbContext,
        request: UrbRequest,
    },
    Unlink {
        unlink_cmd_seqnum: u32,
        target_seqnum: u32,
    },
}

enum WriterFrame {
    RetSubmit {
        seqnum: u32,
        devid: u32,
        direction: u32,
        ep: u32,
        status: i32,
        actual_length: i32,
        start_frame: i32,
        number_of_packets: i32,
        error_count: i32,
        payload: Option<Vec<u8>>,
        iso_packets: Vec<UsbIpIsoPacketDescriptor>,
    },
    RetUnlink {
        seqnum: u32,
        status: i32,
    },
}

/// Everything an attached session needs beyond the socket itself.
pub struct AttachedSessionArgs {
    pub bus_id: BusId,
    pub device_id: u32,
    pub client_address: SocketAddr,
    pub session_id: u64,
    pub registry: Registry,
    pub capture: Arc<dyn CaptureDriver>,
    pub capture_handle: CaptureHandle,
    pub config: Arc<ServerConfig>,
    pub cancellation: CancellationToken,
    pub capture_sink: Option<mpsc::Sender<CaptureEvent>>,
}

/// Runs the attached session to completion, then performs the
/// shutdown protocol in spec.md §4.F ("Shutdown"): release the
/// device, mark detached, close the socket. Always returns `Ok(())`
/// once cleanup has run; transport errors are logged, not returned,
/// since there is no remaining reply channel once the socket dies.
pub async fn run_attached_session(stream: TcpStream, args: AttachedSessionArgs) {
    let AttachedSessionArgs {
        bus_id,
        device_id,
        client_address,
        session_id,
        registry,
        capture,
        capture_handle,
        config,
        cancellation,
        capture_sink,
    } = args;

    let (read_half, write_half) = stream.into_split();
    let (to_submitter, from_reader) = mpsc::channel::<EngineCommand>(config.completion_queue_depth);
    let (to_writer, from_submitter) = mpsc::channel::<WriterFrame>(config.completion_queue_depth);

    let reader_cancel = cancellation.clone();
    let reader_config = config.clone();
    let reader_task = tokio::spawn(async move {
        reader_loop(read_half, to_submitter, reader_config, reader_cancel).await
    });

    let submitter_cancel = cancellation.clone();
    let submitter_task = tokio::spawn(submitter_loop(
        from_reader,
        to_writer,
        capture.clone(),
        capture_handle,
        config.clone(),
        device_id,
        submitter_cancel,
        capture_sink,
    ));

    let writer_cancel = cancellation.clone();
    let writer_task = tokio::spawn(writer_loop(write_half, from_submitter, writer_cancel));

    let _ = reader_task.await;
    cancellation.cancel();
    let _ = submitter_task.await;
    let _ = writer_task.await;

    if let Err(e) = capture.reset(capture_handle).await {
        warn!(%bus_id, "capture reset on shutdown failed: {e}");
    }
    if let Err(e) = capture.release(capture_handle).await {
        warn!(%bus_id, "capture release on shutdown failed: {e}");
    }
    registry.mark_detached(bus_id).await;
    info!(%bus_id, %client_address, session_id, "attached session closed");
}

async fn reader_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    to_submitter: mpsc::Sender<EngineCommand>,
    config: Arc<ServerConfig>,
    cancellation: CancellationToken,
) {
    loop {
        let mut frame = [0u8; std::mem::size_of::<UsbIpCmdSubmit>()];
        let read_result = tokio::select! {
            r = read_half.read_exact(&mut frame) => r,
            _ = cancellation.cancelled() => return,
        };
        if read_result.is_err() {
            cancellation.cancel();
            return;
        }

        let basic: &UsbIpHeaderBasic = bytemuck::from_bytes(&frame[..std::mem::size_of::<UsbIpHeaderBasic>()]);
        let command = basic.command.get();

        match command {
            USBIP_CMD_SUBMIT => {
                let cmd: &UsbIpCmdSubmit = bytemuck::from_bytes(&frame);
                let seqnum = cmd.header.seqnum.get();
                let ep = cmd.header.ep.get();
                let transfer_buffer_length = cmd.transfer_buffer_length.get();
                let number_of_packets = cmd.number_of_packets.get();

                if ep > 15 || number_of_packets < 0 || transfer_buffer_length < 0
                    || transfer_buffer_length as u32 > config.max_transfer_buffer_bytes
                {
                    warn!(seqnum, ep, transfer_buffer_length, "rejecting malformed CMD_SUBMIT");
                    cancellation.cancel();
                    return;
                }

                let direction = match Direction::from_wire(cmd.header.direction.get()) {
                    Ok(d) => d,
                    Err(_) => {
                        cancellation.cancel();
                        return;
                    }
                };

                let out_data = if direction == Direction::Out && transfer_buffer_length > 0 {
                    let mut buf = vec![0u8; transfer_buffer_length as usize];
                    if tokio::select! {
                        r = read_half.read_exact(&mut buf) => r,
                        _ = cancellation.cancelled() => return,
                    }
                    .is_err()
                    {
                        cancellation.cancel();
                        return;
                    }
                    Some(buf)
                } else {
                    None
                };

                let iso_packets = if number_of_packets > 0 {
                    let mut iso_bytes = vec![0u8; number_of_packets as usize * std::mem::size_of::<UsbIpIsoPacketDescriptor>()];
                    if tokio::select! {
                        r = read_half.read_exact(&mut iso_bytes) => r,
                        _ = cancellation.cancelled() => return,
                    }
                    .is_err()
                    {
                        cancellation.cancel();
                        return;
                    }
                    iso_bytes
                        .chunks_exact(std::mem::size_of::<UsbIpIsoPacketDescriptor>())
                        .map(|chunk| {
                            let desc: &UsbIpIsoPacketDescriptor = bytemuck::from_bytes(chunk);
                            IsoPacketDescriptor {
                                offset: desc.offset.get(),
                                length: desc.length.get(),
                                actual_length: desc.actual_length.get(),
                                status: desc.status.get(),
                            }
                        })
                        .collect()
                } else {
                    Vec::new()
                };

                let setup = if ep == 0 { Some(cmd.setup) } else { None };

                let ctx = UrbContext {
                    seqnum,
                    endpoint: ep as u8,
                    direction: match direction {
                        Direction::In => UrbDirection::In,
                        Direction::Out => UrbDirection::Out,
                    },
                    submit_time: Instant::now(),
                    original_transfer_buffer_length: transfer_buffer_length,
                    cancel: cancellation.child_token(),
                };

                let request = UrbRequest {
                    endpoint: ep as u8,
                    direction_in: direction == Direction::In,
                    transfer_flags: cmd.transfer_flags.get(),
                    setup,
                    out_data,
                    transfer_buffer_length,
                    start_frame: cmd.start_frame.get(),
                    number_of_packets,
                    interval: cmd.interval.get(),
                    iso_packets,
                };

                if to_submitter.send(EngineCommand::Submit { ctx, request }).await.is_err() {
                    return;
                }
            }
            USBIP_CMD_UNLINK => {
                let cmd: &UsbIpCmdUnlink = bytemuck::from_bytes(&frame);
                let unlink_cmd_seqnum = cmd.header.seqnum.get();
                let target_seqnum = cmd.unlink_seqnum.get();
                if to_submitter
                    .send(EngineCommand::Unlink {
                        unlink_cmd_seqnum,
                        target_seqnum,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            other => {
                warn!(command = other, "unknown URB command, closing session");
                cancellation.cancel();
                return;
            }
        }
    }
}

struct PendingUrb {
    endpoint: u8,
    cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
async fn submitter_loop(
    mut from_reader: mpsc::Receiver<EngineCommand>,
    to_writer: mpsc::Sender<WriterFrame>,
    capture: Arc<dyn CaptureDriver>,
    handle: CaptureHandle,
    config: Arc<ServerConfig>,
    device_id: u32,
    cancellation: CancellationToken,
    capture_sink: Option<mpsc::Sender<CaptureEvent>>,
) {
    let endpoint_permits: Mutex<HashMap<u8, Arc<Semaphore>>> = Mutex::new(HashMap::new());
    let payload_budget = Arc::new(Semaphore::new(config.max_outstanding_payload_bytes.min(u32::MAX as u64) as usize));
    let pending: Arc<Mutex<HashMap<u32, PendingUrb>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let command = tokio::select! {
            c = from_reader.recv() => c,
            _ = cancellation.cancelled() => break,
        };
        let Some(command) = command else { break };

        match command {
            EngineCommand::Submit { ctx, request } => {
                let endpoint_semaphore = {
                    let mut permits = endpoint_permits.lock().await;
                    permits
                        .entry(ctx.endpoint)
                        .or_insert_with(|| Arc::new(Semaphore::new(config.max_in_flight_per_endpoint as usize)))
                        .clone()
                };
                let payload_len = request
                    .out_data
                    .as_ref()
                    .map(|d| d.len())
                    .unwrap_or(request.transfer_buffer_length.max(0) as usize);

                let endpoint_permit = match endpoint_semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let payload_permit = match payload_budget.clone().acquire_many_owned(payload_len.max(1) as u32).await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let seqnum = ctx.seqnum;
                pending.lock().await.insert(
                    seqnum,
                    PendingUrb {
                        endpoint: ctx.endpoint,
                        cancel: ctx.cancel.clone(),
                    },
                );

                let submit_result = capture.submit_urb(handle, request.clone()).await;
                let (cookie, completion_rx) = match submit_result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(seqnum, "capture submit failed: {e}");
                        pending.lock().await.remove(&seqnum);
                        let _ = to_writer
                            .send(WriterFrame::RetSubmit {
                                seqnum,
                                devid: device_id,
                                direction: if matches!(ctx.direction, UrbDirection::In) { USBIP_DIR_IN } else { USBIP_DIR_OUT },
                                ep: ctx.endpoint as u32,
                                status: crate::errno::EPROTO,
                                actual_length: 0,
                                start_frame: 0,
                                number_of_packets: 0,
                                error_count: 0,
                                payload: None,
                                iso_packets: Vec::new(),
                            })
                            .await;
                        continue;
                    }
                };

                let to_writer = to_writer.clone();
                let pending = pending.clone();
                let capture = capture.clone();
                let capture_sink = capture_sink.clone();
                let ctx_cancel = ctx.cancel.clone();
                let submit_time = ctx.submit_time;
                tokio::spawn(async move {
                    let _endpoint_permit = endpoint_permit;
                    let _payload_permit = payload_permit;
                    let completion = tokio::select! {
                        c = completion_rx => c.ok(),
                        _ = ctx_cancel.cancelled() => {
                            let _ = capture.cancel_urb(handle, cookie).await;
                            None
                        }
                    };
                    pending.lock().await.remove(&seqnum);
                    let completion = completion.unwrap_or(UrbCompletion {
                        status: crate::errno::ECONNRESET,
                        actual_length: 0,
                        start_frame: 0,
                        number_of_packets: 0,
                        error_count: 0,
                        in_data: None,
                        iso_packets: Vec::new(),
                    });
                    if let Some(sink) = &capture_sink {
                        let _ = sink.try_send(CaptureEvent {
                            endpoint: ctx.endpoint,
                            direction_in: matches!(ctx.direction, UrbDirection::In),
                            seqnum,
                            status: completion.status,
                            payload_len: completion.actual_length.max(0) as usize,
                            elapsed: submit_time.elapsed(),
                        });
                    }
                    let iso_packets = completion
                        .iso_packets
                        .iter()
                        .map(|p| UsbIpIsoPacketDescriptor {
                            offset: BeU32::new(p.offset),
                            length: BeU32::new(p.length),
                            actual_length: BeU32::new(p.actual_length),
                            status: BeI32::new(p.status),
                        })
                        .collect();
                    let _ = to_writer
                        .send(WriterFrame::RetSubmit {
                            seqnum,
                            devid: device_id,
                            direction: if matches!(ctx.direction, UrbDirection::In) { USBIP_DIR_IN } else { USBIP_DIR_OUT },
                            ep: ctx.endpoint as u32,
                            status: completion.status,
                            actual_length: completion.actual_length,
                            start_frame: completion.start_frame,
                            number_of_packets: completion.number_of_packets,
                            error_count: completion.error_count,
                            payload: completion.in_data,
                            iso_packets,
                        })
                        .await;
                    let _ = ctx.original_transfer_buffer_length;
                });
            }
            EngineCommand::Unlink {
                unlink_cmd_seqnum,
                target_seqnum,
            } => {
                let found = pending.lock().await.remove(&target_seqnum);
                let status = match found {
                    Some(entry) => {
                        entry.cancel.cancel();
                        let _ = entry.endpoint;
                        crate::errno::ECONNRESET
                    }
                    None => 0,
                };
                if to_writer
                    .send(WriterFrame::RetUnlink {
                        seqnum: unlink_cmd_seqnum,
                        status,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut from_submitter: mpsc::Receiver<WriterFrame>,
    cancellation: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            f = from_submitter.recv() => f,
            _ = cancellation.cancelled() => return,
        };
        let Some(frame) = frame else { return };

        let write_result = match frame {
            WriterFrame::RetSubmit {
                seqnum,
                devid,
                direction,
                ep,
                status,
                actual_length,
                start_frame,
                number_of_packets,
                error_count,
                payload,
                iso_packets,
            } => {
                let ret = UsbIpRetSubmit {
                    header: UsbIpHeaderBasic::new(USBIP_RET_SUBMIT, seqnum, devid, direction, ep),
                    status: BeI32::new(status),
                    actual_length: BeI32::new(actual_length),
                    start_frame: BeI32::new(start_frame),
                    number_of_packets: BeI32::new(number_of_packets),
                    error_count: BeI32::new(error_count),
                    setup: [0u8; 8],
                };
                let mut buf = bytes_of(&ret).to_vec();
                if let Some(payload) = payload {
                    buf.extend_from_slice(&payload);
                }
                // Iso completions carry their packet buffers and the
                // updated descriptor vector back to back, mirroring
                // CMD_SUBMIT's own data-then-descriptors layout.
                for desc in &iso_packets {
                    buf.extend_from_slice(bytes_of(desc));
                }
                write_half.write_all(&buf).await
            }
            WriterFrame::RetUnlink { seqnum, status } => {
                let ret = UsbIpRetUnlink {
                    header: UsbIpHeaderBasic::new(USBIP_RET_UNLINK, seqnum, 0, 0, 0),
                    status: BeI32::new(status),
                    padding: [0u8; 24],
                };
                write_half.write_all(bytes_of(&ret)).await
            }
        };

        if write_result.is_err() {
            cancellation.cancel();
            return;
        }
        if write_half.flush().await.is_err() {
            cancellation.cancel();
            return;
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCaptureDriver;
    use crate::enumerator::{ExportedDevice, InterfaceInfo};
    use crate::privilege::AlwaysAllow;

    fn sample_device(bus_id: BusId) -> ExportedDevice {
        ExportedDevice {
            bus_id,
            path: "/sys/bus/usb/devices/1-1".into(),
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

    async fn spawn_session() -> (TcpStream, Registry, tempfile::TempDir) {
        let bus_id = BusId::new(1, 1).unwrap();
        let capture = Arc::new(MockCaptureDriver::new(vec![sample_device(bus_id)]));
        let (client, registry, dir, _capture) = spawn_session_with_capture(capture).await;
        (client, registry, dir)
    }

    /// Like `spawn_session`, but lets the test inject its own capture
    /// driver (e.g. one with a deliberately slow completion) and hands
    /// it back so the test can inspect it afterwards. `capture` must
    /// already know about a device at bus-id 1-1.
    async fn spawn_session_with_capture(
        capture: Arc<MockCaptureDriver>,
    ) -> (TcpStream, Registry, tempfile::TempDir, Arc<MockCaptureDriver>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("devices.json"), Arc::new(AlwaysAllow))
            .await
            .unwrap();
        let bus_id = BusId::new(1, 1).unwrap();
        registry
            .bind(bus_id, "desc".into(), "inst".into(), true)
            .await
            .unwrap();
        let client_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        registry.mark_attached(bus_id, client_addr, 1).await.unwrap();

        let handle = capture.open(bus_id).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let args = AttachedSessionArgs {
            bus_id,
            device_id: bus_id.device_id(),
            client_address: client_addr,
            session_id: next_session_id(),
            registry: registry.clone(),
            capture: capture.clone(),
            capture_handle: handle,
            config: Arc::new(ServerConfig::default()),
            cancellation: CancellationToken::new(),
            capture_sink: None,
        };
        tokio::spawn(run_attached_session(server_stream, args));
        (client, registry, dir, capture)
    }

    #[tokio::test]
    async fn control_request_round_trip() {
        let (mut client, _registry, _dir) = spawn_session().await;

        let cmd = UsbIpCmdSubmit {
            header: UsbIpHeaderBasic::new(USBIP_CMD_SUBMIT, 1, 0x00010001, USBIP_DIR_IN, 0),
            transfer_flags: BeU32::new(0),
            transfer_buffer_length: BeI32::new(18),
            start_frame: BeI32::new(0),
            number_of_packets: BeI32::new(0),
            interval: BeI32::new(0),
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        };
        client.write_all(bytes_of(&cmd)).await.unwrap();

        let mut ret_buf = [0u8; std::mem::size_of::<UsbIpRetSubmit>()];
        client.read_exact(&mut ret_buf).await.unwrap();
        let ret: &UsbIpRetSubmit = bytemuck::from_bytes(&ret_buf);
        assert_eq!(ret.header.seqnum.get(), 1);
        assert_eq!(ret.status.get(), 0);
        assert_eq!(ret.actual_length.get(), 18);

        let mut payload = [0u8; 18];
        client.read_exact(&mut payload).await.unwrap();
    }

    #[tokio::test]
    async fn unlink_unknown_seqnum_returns_zero_status() {
        let (mut client, _registry, _dir) = spawn_session().await;

        let unlink = UsbIpCmdUnlink {
            header: UsbIpHeaderBasic::new(USBIP_CMD_UNLINK, 99, 0x00010001, 0, 0),
            unlink_seqnum: BeU32::new(12345),
            padding: [0u8; 24],
        };
        client.write_all(bytes_of(&unlink)).await.unwrap();

        let mut ret_buf = [0u8; std::mem::size_of::<UsbIpRetUnlink>()];
        client.read_exact(&mut ret_buf).await.unwrap();
        let ret: &UsbIpRetUnlink = bytemuck::from_bytes(&ret_buf);
        assert_eq!(ret.header.seqnum.get(), 99);
        assert_eq!(ret.status.get(), 0);
    }

    #[tokio::test]
    async fn disconnect_releases_and_marks_detached() {
        let (client, registry, _dir) = spawn_session().await;
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let shared = registry.list_shared().await;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].attachment, crate::registry::AttachmentState::Unattached);
    }

    /// Disconnecting with a URB still in flight must cancel it right
    /// away instead of leaving it to run out the capture driver's full
    /// completion delay: `UrbContext.cancel` is a child of the session
    /// cancellation token precisely so `run_attached_session`'s
    /// `cancellation.cancel()` reaches every pending URB.
    #[tokio::test]
    async fn disconnect_cancels_in_flight_urbs() {
        let bus_id = BusId::new(1, 1).unwrap();
        let capture = Arc::new(
            MockCaptureDriver::new(vec![sample_device(bus_id)])
                .with_completion_delay(std::time::Duration::from_secs(5)),
        );
        let (mut client, registry, _dir, capture) = spawn_session_with_capture(capture).await;

        let cmd = UsbIpCmdSubmit {
            header: UsbIpHeaderBasic::new(USBIP_CMD_SUBMIT, 1, 0x00010001, USBIP_DIR_IN, 1),
            transfer_flags: BeU32::new(0),
            transfer_buffer_length: BeI32::new(64),
            start_frame: BeI32::new(0),
            number_of_packets: BeI32::new(0),
            interval: BeI32::new(0),
            setup: [0u8; 8],
        };
        client.write_all(bytes_of(&cmd)).await.unwrap();
        // Give the submitter a moment to actually call submit_urb
        // before we disconnect, so there is something to cancel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        assert_eq!(capture.cancel_count().await, 1, "in-flight urb was not cancelled on disconnect");
        let shared = registry.list_shared().await;
        assert_eq!(shared[0].attachment, crate::registry::AttachmentState::Unattached);
    }
}
