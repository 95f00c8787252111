//! Per-connection protocol dispatcher.
//!
//! Reads a 4-byte command discriminator, classifies it against the fixed
//! set of USB/IP opcodes, reads the rest of that (always fixed-size)
//! record, and dispatches. Never does length-prefixed parsing — the only
//! variable-length read is the OUT-transfer payload, whose length is given
//! by `transferBufferLength`.

use std::io::Cursor;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::registry::Registry;
use crate::request::Request;
use crate::wire::opcodes::{
    Direction, Speed, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT,
    USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK, VERSION,
};
use crate::wire::usbip::{
    BasicHeader, CmdSubmit, CmdUnlink, DeviceRecord, InterfaceRecord, RetUnlink, SetupHeader,
};

/// Reads the remaining bytes of a fixed-size record, given the 4 bytes of
/// its leading opcode word that the caller already consumed.
async fn read_rest(
    reader: &mut (impl AsyncReadExt + Unpin),
    total_size: usize,
    leading: [u8; 4],
) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; total_size];
    buf[..4].copy_from_slice(&leading);
    reader.read_exact(&mut buf[4..]).await?;
    Ok(buf)
}

/// Runs the protocol dispatcher loop for a single accepted connection.
/// Returns when the peer closes the connection, sends a malformed or
/// out-of-place opcode (terminates the connection), or an I/O error
/// occurs.
pub async fn run_connection(
    stream: TcpStream,
    registry: Arc<RwLock<Registry>>,
) -> Result<(), ServerError> {
    stream.set_nodelay(true).ok();
    let (mut reader, write_half) = stream.into_split();
    let writer: crate::request::SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));

    loop {
        let word = match reader.read_u32().await {
            Ok(w) => w,
            Err(err) => {
                let err = ServerError::from_io(err);
                match err {
                    ServerError::PeerClosed | ServerError::ConnectionReset => {
                        info!("client connection closed");
                        return Ok(());
                    }
                    other => return Err(other),
                }
            }
        };
        let leading = word.to_be_bytes();
        let version = (word >> 16) as u16;

        if version == VERSION {
            match word {
                OP_REQ_DEVLIST => handle_req_devlist(&mut reader, &writer, &registry, leading).await?,
                OP_REQ_IMPORT => handle_req_import(&mut reader, &writer, &registry, leading).await?,
                _ => {
                    warn!(opcode = format!("0x{word:08x}"), "unknown setup opcode, terminating connection");
                    return Err(ServerError::Protocol(format!("unknown setup opcode 0x{word:08x}")));
                }
            }
        } else if word >> 16 == 0 {
            match word {
                USBIP_CMD_SUBMIT => handle_cmd_submit(&mut reader, &writer, &registry, leading).await?,
                USBIP_CMD_UNLINK => handle_cmd_unlink(&mut reader, &writer, leading).await?,
                USBIP_RET_SUBMIT | USBIP_RET_UNLINK => {
                    warn!(
                        opcode = format!("0x{word:08x}"),
                        "peer sent a RET record; terminating connection"
                    );
                    return Err(ServerError::Protocol(
                        "received USBIP_RET_SUBMIT/USBIP_RET_UNLINK from client".to_string(),
                    ));
                }
                _ => {
                    warn!(opcode = format!("0x{word:08x}"), "unknown command code, terminating connection");
                    return Err(ServerError::Protocol(format!("unknown command code 0x{word:08x}")));
                }
            }
        } else {
            warn!(opcode = format!("0x{word:08x}"), "malformed opcode, terminating connection");
            return Err(ServerError::Protocol(format!("malformed opcode 0x{word:08x}")));
        }
    }
}

async fn handle_req_devlist(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &crate::request::SharedWriter,
    registry: &Arc<RwLock<Registry>>,
    leading: [u8; 4],
) -> Result<(), ServerError> {
    let buf = read_rest(reader, SetupHeader::SIZE, leading).await.map_err(ServerError::from_io)?;
    let _header = SetupHeader::decode(&mut Cursor::new(&buf)).map_err(ServerError::from_io)?;

    let registry = registry.read().await;
    let mut out = Vec::new();
    let reply_header = SetupHeader {
        version: VERSION,
        code: (OP_REP_DEVLIST & 0xFFFF) as u16,
        status: 0,
    };
    reply_header.encode(&mut out).map_err(ServerError::from_io)?;
    crate::wire::primitives::write_u32_be(&mut out, registry.len() as u32).map_err(ServerError::from_io)?;

    for device in registry.devices_in_order() {
        let record = device_record(device);
        record.encode(&mut out).map_err(ServerError::from_io)?;
        for iface in &device.interfaces {
            iface.encode(&mut out).map_err(ServerError::from_io)?;
        }
    }

    let mut w = writer.lock().await;
    w.write_all(&out).await.map_err(ServerError::from_io)?;
    Ok(())
}

async fn handle_req_import(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &crate::request::SharedWriter,
    registry: &Arc<RwLock<Registry>>,
    leading: [u8; 4],
) -> Result<(), ServerError> {
    const TOTAL_SIZE: usize = SetupHeader::SIZE + DeviceRecord::BUS_ID_LEN;
    let buf = read_rest(reader, TOTAL_SIZE, leading).await.map_err(ServerError::from_io)?;
    let mut cursor = Cursor::new(&buf);
    let _header = SetupHeader::decode(&mut cursor).map_err(ServerError::from_io)?;
    let requested_bus_id =
        crate::wire::primitives::read_fixed_str(&mut cursor, DeviceRecord::BUS_ID_LEN)
            .map_err(ServerError::from_io)?;

    let registry = registry.read().await;
    let found = registry.find_by_bus_id(&requested_bus_id);

    let mut out = Vec::new();
    let reply_header = SetupHeader {
        version: VERSION,
        code: (OP_REP_IMPORT & 0xFFFF) as u16,
        status: if found.is_some() { 0 } else { 1 },
    };
    reply_header.encode(&mut out).map_err(ServerError::from_io)?;
    let record = match found {
        Some(device) => device_record(device),
        None => DeviceRecord::default(),
    };
    record.encode(&mut out).map_err(ServerError::from_io)?;

    let mut w = writer.lock().await;
    w.write_all(&out).await.map_err(ServerError::from_io)?;
    Ok(())
}

async fn handle_cmd_submit(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &crate::request::SharedWriter,
    registry: &Arc<RwLock<Registry>>,
    leading: [u8; 4],
) -> Result<(), ServerError> {
    let buf = read_rest(reader, CmdSubmit::SIZE, leading).await.map_err(ServerError::from_io)?;
    let cmd = CmdSubmit::decode(&mut Cursor::new(&buf)).map_err(ServerError::from_io)?;

    let device = {
        let registry = registry.read().await;
        registry.find_by_device_id(cmd.header.device_id).cloned()
    };
    let Some(device) = device else {
        warn!(device_id = format!("0x{:08x}", cmd.header.device_id), "CMD_SUBMIT for unknown device, terminating connection");
        return Err(ServerError::Protocol("CMD_SUBMIT for unknown device-id".to_string()));
    };

    let endpoint = cmd.header.endpoint as u8;
    let setup = cmd.setup;

    let payload = if cmd.header.direction == Direction::Out && cmd.transfer_buffer_length > 0 {
        let mut buf = vec![0u8; cmd.transfer_buffer_length as usize];
        reader.read_exact(&mut buf).await.map_err(ServerError::from_io)?;
        buf
    } else {
        Vec::new()
    };

    let request = Request::new(
        Arc::clone(&device),
        cmd.header.sequence_number,
        cmd.transfer_buffer_length,
        Arc::clone(writer),
    );

    let status = match cmd.header.direction {
        Direction::In => {
            device
                .dispatch_input(
                    request,
                    endpoint,
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    setup.length,
                )
                .await
        }
        Direction::Out => {
            device
                .dispatch_output(
                    request,
                    endpoint,
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    setup.length,
                    payload,
                )
                .await
        }
    };

    if status != 0 {
        warn!(
            bus_id = %device.bus_id(),
            status,
            "device callback returned non-zero status; continuing"
        );
    }
    Ok(())
}

async fn handle_cmd_unlink(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &crate::request::SharedWriter,
    leading: [u8; 4],
) -> Result<(), ServerError> {
    let buf = read_rest(reader, CmdUnlink::SIZE, leading).await.map_err(ServerError::from_io)?;
    let unlink = CmdUnlink::decode(&mut Cursor::new(&buf)).map_err(ServerError::from_io)?;

    let ret = RetUnlink {
        header: BasicHeader {
            command_code: USBIP_RET_UNLINK,
            sequence_number: unlink.header.sequence_number,
            device_id: unlink.header.device_id,
            direction: unlink.header.direction,
            endpoint: unlink.header.endpoint,
        },
        status: 0,
    };

    let mut w = writer.lock().await;
    w.write_all(&ret.to_bytes()).await.map_err(ServerError::from_io)?;
    Ok(())
}

fn device_record(device: &crate::device::Device) -> DeviceRecord {
    DeviceRecord {
        path: format!("/virtual/usbip/{}", device.bus_id()),
        bus_id: device.bus_id(),
        bus_num: device.bus_num,
        dev_num: device.dev_num,
        speed: Speed::Full,
        vendor: device.device_descriptor.vendor_id,
        product: device.device_descriptor.product_id,
        bcd_device: device.device_descriptor.bcd_device,
        class: device.device_descriptor.device_class,
        subclass: device.device_descriptor.device_subclass,
        protocol: device.device_descriptor.device_protocol,
        configuration_value: 1,
        num_configurations: device.device_descriptor.num_configurations,
        num_interfaces: device.interfaces.len() as u8,
    }
}
