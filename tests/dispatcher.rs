//! End-to-end protocol tests: a real loopback TCP connection driving
//! `dispatcher::run_connection` against a registry of synthetic devices,
//! exercising the handshake, descriptor, and deferred-report paths.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use usbip_virtpp::hid::{HidDevice, HidDeviceConfig};
use usbip_virtpp::registry::Registry;
use usbip_virtpp::wire::descriptors::DeviceDescriptor;
use usbip_virtpp::wire::opcodes::{
    Direction, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, USBIP_CMD_SUBMIT,
    USBIP_RET_SUBMIT, VERSION,
};
use usbip_virtpp::wire::usbip::{BasicHeader, DeviceRecord, RetSubmit, Setup, SetupHeader};
use usbip_virtpp::xpad::{XPad, XPadConfig};

const MOUSE_REPORT_DESCRIPTOR: &[u8] = &[0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0xC0];

async fn spawn_server_with(
    build: impl FnOnce(&mut Registry),
) -> (TcpStream, tokio::task::JoinHandle<()>) {
    let mut registry = Registry::new();
    build(&mut registry);
    let registry = Arc::new(tokio::sync::RwLock::new(registry));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.unwrap();
        let _ = usbip_virtpp::dispatcher::run_connection(stream, registry).await;
    });

    let client = TcpStream::connect(addr).await.unwrap();
    (client, handle)
}

fn encode_setup_request(code: u16, trailer: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    SetupHeader {
        version: VERSION,
        code,
        status: 0,
    }
    .encode(&mut buf)
    .unwrap();
    buf.extend_from_slice(trailer);
    buf
}

fn encode_cmd_submit(device_id: u32, sequence_number: u32, setup: Setup, length: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    BasicHeader {
        command_code: USBIP_CMD_SUBMIT,
        sequence_number,
        device_id,
        direction: Direction::In,
        endpoint: 0,
    }
    .encode(&mut buf)
    .unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap(); // transfer_flags
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, length).unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap(); // start_frame
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap(); // number_of_packets
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap(); // interval
    setup.encode(&mut buf).unwrap();
    buf
}

async fn read_ret_submit(client: &mut TcpStream, payload_len: usize) -> (RetSubmit, Vec<u8>) {
    let mut header_buf = vec![0u8; RetSubmit::SIZE];
    client.read_exact(&mut header_buf).await.unwrap();
    let ret = RetSubmit::decode_for_test(&header_buf);
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        client.read_exact(&mut payload).await.unwrap();
    }
    (ret, payload)
}

trait RetSubmitTestExt {
    fn decode_for_test(buf: &[u8]) -> Self;
}

impl RetSubmitTestExt for RetSubmit {
    fn decode_for_test(buf: &[u8]) -> Self {
        let mut cursor = Cursor::new(buf);
        let header = BasicHeader::decode(&mut cursor).unwrap();
        let status = usbip_virtpp::wire::primitives::read_i32_be(&mut cursor).unwrap();
        let actual_length = usbip_virtpp::wire::primitives::read_u32_be(&mut cursor).unwrap();
        let start_frame = usbip_virtpp::wire::primitives::read_u32_be(&mut cursor).unwrap();
        let number_of_packets = usbip_virtpp::wire::primitives::read_u32_be(&mut cursor).unwrap();
        let error_count = usbip_virtpp::wire::primitives::read_u32_be(&mut cursor).unwrap();
        RetSubmit {
            header,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
        }
    }
}

#[tokio::test]
async fn handshake_devlist_reports_registered_devices() {
    let (mut client, handle) = spawn_server_with(|registry| {
        HidDevice::register(
            registry,
            HidDeviceConfig {
                vendor_id: 0x4242,
                product_id: 0x0001,
                device_version: 0x0100,
                language_id: 0x0409,
                manufacturer: "Test".to_string(),
                product: "Mouse".to_string(),
                interface: "Mouse".to_string(),
                serial_number: "0000".to_string(),
                report_descriptors: vec![MOUSE_REPORT_DESCRIPTOR.to_vec()],
                auto_attach: false,
                on_get_input_report: Arc::new(|request, _id, len| {
                    Box::pin(async move {
                        let _ = request.send_reply(&vec![0u8; len as usize]).await;
                        0
                    })
                }),
                on_set_output_report: None,
            },
        );
    })
    .await;

    client
        .write_all(&encode_setup_request((OP_REQ_DEVLIST & 0xFFFF) as u16, &[]))
        .await
        .unwrap();

    let mut reply = vec![0u8; SetupHeader::SIZE + 4];
    client.read_exact(&mut reply).await.unwrap();
    let header = SetupHeader::decode(&mut Cursor::new(&reply[..SetupHeader::SIZE])).unwrap();
    assert_eq!(header.version, VERSION);
    assert_eq!(header.code, (OP_REP_DEVLIST & 0xFFFF) as u16);
    let count = u32::from_be_bytes(reply[SetupHeader::SIZE..].try_into().unwrap());
    assert_eq!(count, 1);

    let mut device_buf = vec![0u8; DeviceRecord::SIZE + 4];
    client.read_exact(&mut device_buf).await.unwrap();
    let record = DeviceRecord::decode(&mut Cursor::new(&device_buf[..DeviceRecord::SIZE])).unwrap();
    assert_eq!(record.bus_id, "1-1");
    assert_eq!(record.vendor, 0x4242);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn import_unknown_bus_id_reports_failure_status() {
    let (mut client, handle) = spawn_server_with(|_registry| {}).await;

    let mut trailer = vec![0u8; DeviceRecord::BUS_ID_LEN];
    trailer[..3].copy_from_slice(b"1-1");
    client
        .write_all(&encode_setup_request((OP_REQ_IMPORT & 0xFFFF) as u16, &trailer))
        .await
        .unwrap();

    let mut reply = vec![0u8; SetupHeader::SIZE + DeviceRecord::SIZE];
    client.read_exact(&mut reply).await.unwrap();
    let header = SetupHeader::decode(&mut Cursor::new(&reply[..SetupHeader::SIZE])).unwrap();
    assert_eq!(header.code, (OP_REP_IMPORT & 0xFFFF) as u16);
    assert_eq!(header.status, 1);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn import_then_get_device_descriptor() {
    let (mut client, handle) = spawn_server_with(|registry| {
        HidDevice::register(
            registry,
            HidDeviceConfig {
                vendor_id: 0x1234,
                product_id: 0x5678,
                device_version: 0x0100,
                language_id: 0x0409,
                manufacturer: "Test".to_string(),
                product: "Mouse".to_string(),
                interface: "Mouse".to_string(),
                serial_number: "0000".to_string(),
                report_descriptors: vec![MOUSE_REPORT_DESCRIPTOR.to_vec()],
                auto_attach: false,
                on_get_input_report: Arc::new(|request, _id, len| {
                    Box::pin(async move {
                        let _ = request.send_reply(&vec![0u8; len as usize]).await;
                        0
                    })
                }),
                on_set_output_report: None,
            },
        );
    })
    .await;

    let mut trailer = vec![0u8; DeviceRecord::BUS_ID_LEN];
    trailer[..3].copy_from_slice(b"1-1");
    client
        .write_all(&encode_setup_request((OP_REQ_IMPORT & 0xFFFF) as u16, &trailer))
        .await
        .unwrap();
    let mut import_reply = vec![0u8; SetupHeader::SIZE + DeviceRecord::SIZE];
    client.read_exact(&mut import_reply).await.unwrap();
    let header = SetupHeader::decode(&mut Cursor::new(&import_reply[..SetupHeader::SIZE])).unwrap();
    assert_eq!(header.status, 0);

    // GET_DESCRIPTOR(DEVICE): requestType=0x80 (IN, device, standard),
    // request=0x06, value = (DEVICE<<8)|0, length = 18.
    let setup = Setup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: DeviceDescriptor::SIZE as u16,
    };
    client
        .write_all(&encode_cmd_submit(0x0001_0001, 1, setup, DeviceDescriptor::SIZE as u32))
        .await
        .unwrap();

    let (ret, payload) = read_ret_submit(&mut client, DeviceDescriptor::SIZE).await;
    assert_eq!(ret.header.sequence_number, 1);
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length as usize, DeviceDescriptor::SIZE);
    let decoded = DeviceDescriptor::decode(&mut Cursor::new(&payload)).unwrap();
    assert_eq!(decoded.vendor_id, 0x1234);
    assert_eq!(decoded.product_id, 0x5678);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn get_string_descriptor_lang_id() {
    let (mut client, handle) = spawn_server_with(|registry| {
        HidDevice::register(
            registry,
            HidDeviceConfig {
                vendor_id: 0x1234,
                product_id: 0x5678,
                device_version: 0x0100,
                language_id: 0x0409,
                manufacturer: "Test".to_string(),
                product: "Mouse".to_string(),
                interface: "Mouse".to_string(),
                serial_number: "0000".to_string(),
                report_descriptors: vec![MOUSE_REPORT_DESCRIPTOR.to_vec()],
                auto_attach: false,
                on_get_input_report: Arc::new(|request, _id, len| {
                    Box::pin(async move {
                        let _ = request.send_reply(&vec![0u8; len as usize]).await;
                        0
                    })
                }),
                on_set_output_report: None,
            },
        );
    })
    .await;

    let setup = Setup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0300, // STRING, index 0 (LangID)
        index: 0,
        length: 4,
    };
    client
        .write_all(&encode_cmd_submit(0x0001_0001, 7, setup, 4))
        .await
        .unwrap();

    let (ret, payload) = read_ret_submit(&mut client, 4).await;
    assert_eq!(ret.header.sequence_number, 7);
    assert_eq!(ret.status, 0);
    assert_eq!(payload, [0x04, 0x03, 0x09, 0x04]);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn interrupt_in_defers_until_mark_dirty() {
    let mut registry = Registry::new();
    let hid = HidDevice::register(
        &mut registry,
        HidDeviceConfig {
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version: 0x0100,
            language_id: 0x0409,
            manufacturer: "Test".to_string(),
            product: "Mouse".to_string(),
            interface: "Mouse".to_string(),
            serial_number: "0000".to_string(),
            report_descriptors: vec![MOUSE_REPORT_DESCRIPTOR.to_vec()],
            auto_attach: false,
            on_get_input_report: Arc::new(|request, _id, len| {
                Box::pin(async move {
                    let mut data = vec![0u8; len as usize];
                    if let Some(first) = data.first_mut() {
                        *first = 0xAB;
                    }
                    let _ = request.send_reply(&data).await;
                    0
                })
            }),
            on_set_output_report: None,
        },
    );

    let registry = Arc::new(tokio::sync::RwLock::new(registry));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.unwrap();
        let _ = usbip_virtpp::dispatcher::run_connection(stream, registry).await;
    });
    let mut client = TcpStream::connect(addr).await.unwrap();

    let setup = Setup {
        request_type: 0x81, // IN, endpoint recipient
        request: 0,
        value: 0,
        index: 1,
        length: 1,
    };
    let mut buf = Vec::new();
    BasicHeader {
        command_code: USBIP_CMD_SUBMIT,
        sequence_number: 99,
        device_id: 0x0001_0001,
        direction: Direction::In,
        endpoint: 1,
    }
    .encode(&mut buf)
    .unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 1).unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap();
    usbip_virtpp::wire::primitives::write_u32_be(&mut buf, 0).unwrap();
    setup.encode(&mut buf).unwrap();
    client.write_all(&buf).await.unwrap();

    // No reply yet: nothing is queued for send until mark_dirty fires.
    tokio::time::sleep(Duration::from_millis(50)).await;

    hid.mark_dirty().await;

    let (ret, payload) = read_ret_submit(&mut client, 1).await;
    assert_eq!(ret.header.sequence_number, 99);
    assert_eq!(payload, [0xAB]);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn xpad_ms_os_string_descriptor() {
    let (mut client, handle) = spawn_server_with(|registry| {
        XPad::register(registry, XPadConfig { auto_attach: false });
    })
    .await;

    let setup = Setup {
        request_type: 0x80,
        request: 0x06,
        value: 0x03EE, // STRING, index 0xEE (MS OS descriptor)
        index: 0,
        length: 0x12,
    };
    client
        .write_all(&encode_cmd_submit(0x0001_0001, 3, setup, 0x12))
        .await
        .unwrap();

    let (ret, payload) = read_ret_submit(&mut client, 0x12).await;
    assert_eq!(ret.status, 0);
    assert_eq!(payload.len(), 0x12);
    assert_eq!(payload[0], 0x12);
    assert_eq!(payload[1], 0x03);

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}
