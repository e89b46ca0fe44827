//! Manual pcapng block writer (spec.md §6 "Capture-file format",
//! §4.H). No pcap crate appears anywhere in the retrieved pack, so
//! blocks are assembled by hand the same way the wire codec hand-rolls
//! USB/IP frames: fixed layouts, explicit byte order, no intermediate
//! serde representation.

use crate::capture_sink::CaptureEvent;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const BLOCK_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;
const BLOCK_INTERFACE_STATISTICS: u32 = 0x0000_0005;

/// `LINKTYPE_USB_LINUX_MMAPPED`, spec.md §6.
const LINKTYPE_USB_LINUX_MMAPPED: u16 = 220;

const OPT_END_OF_OPT: u16 = 0;
const OPT_IF_TSRESOL: u16 = 9;
const OPT_ISB_IFRECV: u16 = 2;
const OPT_ISB_IFDROP: u16 = 4;

fn wrap_block(block_type: u32, body: &[u8]) -> Vec<u8> {
    let pad = (4 - (body.len() % 4)) % 4;
    let total_len = (4 + 4 + body.len() + pad + 4) as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend_from_slice(&block_type.to_le_bytes());
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend(std::iter::repeat(0u8).take(pad));
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf
}

fn section_header_block() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes()); // major
    body.extend_from_slice(&0u16.to_le_bytes()); // minor
    body.extend_from_slice(&(-1i64).to_le_bytes()); // section length unknown
    wrap_block(BLOCK_SECTION_HEADER, &body)
}

fn interface_description_block() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&LINKTYPE_USB_LINUX_MMAPPED.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u32.to_le_bytes()); // snaplen, unlimited
    // if_tsresol: negative power of 10, 7 => 10^-7 s == 100ns resolution
    body.extend_from_slice(&OPT_IF_TSRESOL.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(7u8);
    body.extend_from_slice(&[0u8; 3]); // option padding to 4-byte boundary
    body.extend_from_slice(&OPT_END_OF_OPT.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    wrap_block(BLOCK_INTERFACE_DESCRIPTION, &body)
}

fn now_100ns() -> u64 {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_nanos() as u64 / 100
}

/// Linux usbmon "mmapped" packet header, 64 bytes, matching the
/// fields consumed by Wireshark's `usbmon` dissector for link-type
/// 220. Variable-length ISO descriptors are not emitted; `ndesc` is
/// always zero here.
fn usbmon_header(event: &CaptureEvent, ts_100ns: u64) -> [u8; 64] {
    let mut header = [0u8; 64];
    let event_type = if event.status == 0 { b'C' } else { b'E' };
    let xfer_type: u8 = match event.endpoint {
        0 => 2, // control
        _ => 3, // bulk (the adapter boundary does not currently distinguish interrupt/iso here)
    };
    let epnum = event.endpoint | if event.direction_in { 0x80 } else { 0x00 };
    let ts_sec = (ts_100ns / 10_000_000) as i64;
    let ts_usec = ((ts_100ns % 10_000_000) / 10) as i32;

    header[0..8].copy_from_slice(&(event.seqnum as u64).to_le_bytes());
    header[8] = event_type;
    header[9] = xfer_type;
    header[10] = epnum;
    header[11] = 0; // devnum, unknown at this boundary
    header[12..14].copy_from_slice(&0u16.to_le_bytes()); // busnum
    header[14] = 0; // flag_setup
    header[15] = 0; // flag_data
    header[16..24].copy_from_slice(&ts_sec.to_le_bytes());
    header[24..28].copy_from_slice(&ts_usec.to_le_bytes());
    header[28..32].copy_from_slice(&event.status.to_le_bytes());
    header[32..36].copy_from_slice(&(event.payload_len as u32).to_le_bytes());
    header[36..40].copy_from_slice(&(event.payload_len as u32).to_le_bytes());
    // setup_or_iso[8] left zeroed; interval/start_frame/xfer_flags/ndesc left zeroed
    header
}

fn enhanced_packet_block(event: &CaptureEvent) -> Vec<u8> {
    let ts = now_100ns();
    let header = usbmon_header(event, ts);
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // interface id
    body.extend_from_slice(&((ts >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&(ts as u32).to_le_bytes());
    let captured_len = header.len() as u32;
    body.extend_from_slice(&captured_len.to_le_bytes());
    body.extend_from_slice(&captured_len.to_le_bytes());
    body.extend_from_slice(&header);
    wrap_block(BLOCK_ENHANCED_PACKET, &body)
}

fn interface_statistics_block(written: u64, dropped: u64) -> Vec<u8> {
    let ts = now_100ns();
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&((ts >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&(ts as u32).to_le_bytes());
    body.extend_from_slice(&OPT_ISB_IFRECV.to_le_bytes());
    body.extend_from_slice(&8u16.to_le_bytes());
    body.extend_from_slice(&written.to_le_bytes());
    body.extend_from_slice(&OPT_ISB_IFDROP.to_le_bytes());
    body.extend_from_slice(&8u16.to_le_bytes());
    body.extend_from_slice(&dropped.to_le_bytes());
    body.extend_from_slice(&OPT_END_OF_OPT.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    wrap_block(BLOCK_INTERFACE_STATISTICS, &body)
}

pub struct PcapNgWriter<W> {
    inner: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> PcapNgWriter<W> {
    pub async fn new(mut inner: W) -> anyhow::Result<Self> {
        inner.write_all(&section_header_block()).await?;
        inner.write_all(&interface_description_block()).await?;
        Ok(Self { inner, written: 0 })
    }

    pub async fn write_event(&mut self, event: &CaptureEvent) -> anyhow::Result<()> {
        self.inner.write_all(&enhanced_packet_block(event)).await?;
        self.written += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> anyhow::Result<()> {
        self.inner.write_all(&interface_statistics_block(self.written, 0)).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_well_formed_blocks() {
        let mut buf = Vec::new();
        {
            let mut writer = PcapNgWriter::new(&mut buf).await.unwrap();
            writer
                .write_event(&CaptureEvent {
                    endpoint: 1,
                    direction_in: true,
                    seqnum: 42,
                    status: 0,
                    payload_len: 64,
                    elapsed: Duration::from_millis(1),
                })
                .await
                .unwrap();
            writer.finish().await.unwrap();
        }
        let magic = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        assert_eq!(magic, BYTE_ORDER_MAGIC);
        let section_type = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(section_type, BLOCK_SECTION_HEADER);

        // Every block's trailing length must match its leading length.
        let mut offset = 0usize;
        while offset < buf.len() {
            let block_type = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
            let total_len = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let trailer = u32::from_le_bytes(buf[offset + total_len - 4..offset + total_len].try_into().unwrap()) as usize;
            assert_eq!(total_len, trailer, "block 0x{block_type:08x} length mismatch");
            offset += total_len;
        }
        assert_eq!(offset, buf.len());
    }
}
