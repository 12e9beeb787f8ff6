//! # Meshtastic Serial Transport
//!
//! Concrete [`Connector`] for a Meshtastic node on a serial device. Bluetooth
//! links bound with `rfcomm` show up as `/dev/rfcomm*` and are handled the same way.
//!
//! ## Session lifecycle
//!
//! 1. Open the device (falling back to the first USB serial port when `auto_scan`
//!    is set and the configured path fails).
//! 2. Send `ToRadio.want_config_id` with a random id.
//! 3. A dedicated reader thread decodes `FromRadio` frames: the matching
//!    `config_complete_id` raises [`LinkNotice::Ready`], text packets go to the
//!    ingest channel, `rebooted` or a read error raises [`LinkNotice::Lost`].
//! 4. Every [`HEARTBEAT_INTERVAL`] the reader thread writes a `ToRadio.heartbeat`
//!    so the firmware keeps serving the stream client; a failed write is a lost link.
//! 5. [`Link::close`] stops the reader thread and releases the port.
//!
//! ## Configuration
//!
//! ```toml
//! [link]
//! port = "/dev/rfcomm0"
//! baud_rate = 115200
//! auto_scan = true
//! ```

pub mod framer;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use prost::Message as _;

use crate::link::{Connector, LinkNotice, PacketSink, Session, TransportError};
use crate::message::RawPacket;
use crate::protobuf::{
    from_radio, mesh_packet, to_radio, Data, FromRadio, Heartbeat, MeshPacket, PortNum,
    ToRadio, BROADCAST_ADDR,
};

#[cfg(feature = "serial")]
use crate::link::Link;

/// What one decoded `FromRadio` frame means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready,
    Rebooted,
    MyNode(u32),
    Packet(RawPacket),
    Other,
}

/// Interpret a frame payload. `want_config_id` is the id sent at open; only its
/// matching `config_complete_id` counts as readiness.
pub fn classify(payload: &[u8], want_config_id: u32) -> Inbound {
    let Ok(msg) = FromRadio::decode(payload) else {
        return Inbound::Other;
    };
    match msg.payload_variant {
        Some(from_radio::PayloadVariant::ConfigCompleteId(id)) if id == want_config_id => {
            Inbound::Ready
        }
        Some(from_radio::PayloadVariant::Rebooted(true)) => Inbound::Rebooted,
        Some(from_radio::PayloadVariant::MyInfo(info)) => Inbound::MyNode(info.my_node_num),
        Some(from_radio::PayloadVariant::Packet(pkt)) => Inbound::Packet(to_raw_packet(&pkt)),
        _ => Inbound::Other,
    }
}

fn to_raw_packet(pkt: &MeshPacket) -> RawPacket {
    let sender = Some(format!("!{:08x}", pkt.from));
    let timestamp = (pkt.rx_time > 0).then(|| f64::from(pkt.rx_time));
    match &pkt.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) => {
            let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
            let text = (port == PortNum::TextMessageApp)
                .then(|| String::from_utf8_lossy(&data.payload).into_owned());
            RawPacket {
                text,
                sender,
                timestamp,
                port: Some(port.label().to_string()),
            }
        }
        Some(mesh_packet::PayloadVariant::Encrypted(_)) => RawPacket {
            sender,
            timestamp,
            port: Some("ENCRYPTED".to_string()),
            ..Default::default()
        },
        None => RawPacket {
            sender,
            timestamp,
            ..Default::default()
        },
    }
}

/// Framed `ToRadio` carrying a primary-channel text broadcast.
pub fn text_frame(text: &str) -> Result<Vec<u8>, TransportError> {
    let pkt = MeshPacket {
        to: BROADCAST_ADDR,
        channel: 0,
        hop_limit: 3,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        })),
        ..Default::default()
    };
    encode_to_radio(ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::Packet(pkt)),
    })
}

/// Framed `ToRadio.want_config_id`.
pub fn want_config_frame(id: u32) -> Result<Vec<u8>, TransportError> {
    encode_to_radio(ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::WantConfigId(id)),
    })
}

/// Framed `ToRadio.heartbeat`.
pub fn heartbeat_frame(nonce: u32) -> Result<Vec<u8>, TransportError> {
    encode_to_radio(ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat { nonce })),
    })
}

/// Keep-alive period while a session is open. The firmware drops stream clients
/// that stay silent for much longer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// When the next heartbeat is owed, and the nonce it carries.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    next: Instant,
    nonce: u32,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now + interval,
            nonce: 0,
        }
    }

    /// Returns the nonce to send when a heartbeat is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        if now < self.next {
            return None;
        }
        self.next = now + self.interval;
        self.nonce = self.nonce.wrapping_add(1);
        Some(self.nonce)
    }
}

fn encode_to_radio(msg: ToRadio) -> Result<Vec<u8>, TransportError> {
    let payload = msg.encode_to_vec();
    framer::encode_frame(&payload)
        .ok_or_else(|| TransportError::Send(format!("frame too large ({} bytes)", payload.len())))
}

fn new_config_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

pub struct SerialConnector {
    baud_rate: u32,
    auto_scan: bool,
}

impl SerialConnector {
    pub fn new(baud_rate: u32, auto_scan: bool) -> Self {
        Self {
            baud_rate,
            auto_scan,
        }
    }
}

#[cfg(not(feature = "serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, address: &str, _packets: PacketSink) -> Result<Session, TransportError> {
        debug!("serial open requested for {} without serial support", address);
        Err(TransportError::Open {
            address: address.to_string(),
            reason: "serial support not compiled in (enable the `serial` feature)".to_string(),
        })
    }
}

#[cfg(feature = "serial")]
mod serial {
    use super::*;

    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use log::{info, trace};
    use serialport::SerialPort;
    use tokio::sync::mpsc;

    use super::framer::StreamFramer;

    const READ_TIMEOUT: Duration = Duration::from_millis(100);
    const SETTLE: Duration = Duration::from_millis(150);

    type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

    #[async_trait]
    impl Connector for SerialConnector {
        async fn open(&self, address: &str, packets: PacketSink) -> Result<Session, TransportError> {
            let baud = self.baud_rate;
            let scan = self.auto_scan;
            let requested = address.to_string();
            let (port, path) = tokio::task::spawn_blocking(move || open_port(&requested, baud, scan))
                .await
                .map_err(|e| TransportError::Open {
                    address: address.to_string(),
                    reason: e.to_string(),
                })??;

            let reader_port = port.try_clone().map_err(|e| TransportError::Open {
                address: path.clone(),
                reason: format!("cannot clone port handle: {}", e),
            })?;
            let writer: SharedPort = Arc::new(Mutex::new(port));

            let config_id = new_config_id();
            write_frame(writer.clone(), want_config_frame(config_id)?)
                .await
                .map_err(|e| TransportError::Open {
                    address: path.clone(),
                    reason: e.to_string(),
                })?;
            debug!("want_config_id=0x{:08x} sent on {}", config_id, path);

            let (notice_tx, notices) = mpsc::channel(8);
            let stop = Arc::new(AtomicBool::new(false));
            let reader_stop = stop.clone();
            let heartbeat_port = writer.clone();
            let reader = std::thread::Builder::new()
                .name("meshtastic-rx".to_string())
                .spawn(move || {
                    read_loop(
                        reader_port,
                        heartbeat_port,
                        config_id,
                        packets,
                        notice_tx,
                        reader_stop,
                    )
                })?;

            info!("opened {} at {} baud", path, baud);
            Ok(Session {
                link: Box::new(SerialLink {
                    path,
                    port: writer,
                    stop,
                    reader: Some(reader),
                }),
                notices,
            })
        }
    }

    struct SerialLink {
        path: String,
        port: SharedPort,
        stop: Arc<AtomicBool>,
        reader: Option<JoinHandle<()>>,
    }

    #[async_trait]
    impl Link for SerialLink {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            let frame = text_frame(text)?;
            write_frame(self.port.clone(), frame)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn close(&mut self) {
            self.stop.store(true, Ordering::Release);
            if let Some(handle) = self.reader.take() {
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
            }
            debug!("closed {}", self.path);
        }
    }

    async fn write_frame(port: SharedPort, frame: Vec<u8>) -> std::io::Result<()> {
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| std::io::Error::other("serial port lock poisoned"))?;
            port.write_all(&frame)?;
            port.flush()
        })
        .await
        .map_err(std::io::Error::other)?
    }

    fn open_port(
        path: &str,
        baud: u32,
        auto_scan: bool,
    ) -> Result<(Box<dyn SerialPort>, String), TransportError> {
        let first = match open_path(path, baud) {
            Ok(port) => return Ok((port, path.to_string())),
            Err(e) => e,
        };
        if auto_scan {
            let candidates = serialport::available_ports().unwrap_or_default();
            for info in candidates {
                if info.port_name == path
                    || !matches!(info.port_type, serialport::SerialPortType::UsbPort(_))
                {
                    continue;
                }
                if let Ok(port) = open_path(&info.port_name, baud) {
                    info!("{} unavailable ({}); using {}", path, first, info.port_name);
                    return Ok((port, info.port_name));
                }
            }
        }
        Err(TransportError::Open {
            address: path.to_string(),
            reason: first.to_string(),
        })
    }

    fn open_path(path: &str, baud: u32) -> serialport::Result<Box<dyn SerialPort>> {
        let mut port = serialport::new(path, baud)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()?;
        // ESP32 boards want DTR/RTS asserted before they talk.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(SETTLE);
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(port)
    }

    fn write_heartbeat(port: &SharedPort, nonce: u32) -> Result<(), TransportError> {
        let frame = heartbeat_frame(nonce)?;
        let mut port = port
            .lock()
            .map_err(|_| TransportError::Send("serial port lock poisoned".into()))?;
        port.write_all(&frame)?;
        port.flush()?;
        Ok(())
    }

    fn read_loop(
        mut port: Box<dyn SerialPort>,
        writer: SharedPort,
        config_id: u32,
        packets: PacketSink,
        notices: mpsc::Sender<LinkNotice>,
        stop: Arc<AtomicBool>,
    ) {
        let mut framer = StreamFramer::new();
        let mut buf = [0u8; 1024];
        let mut heartbeat = HeartbeatSchedule::new(HEARTBEAT_INTERVAL, Instant::now());
        while !stop.load(Ordering::Acquire) {
            if let Some(nonce) = heartbeat.poll(Instant::now()) {
                if let Err(e) = write_heartbeat(&writer, nonce) {
                    let reason = format!("heartbeat write failed: {}", e);
                    let _ = notices.blocking_send(LinkNotice::Lost(reason));
                    return;
                }
                trace!("heartbeat nonce={}", nonce);
            }
            let n = match port.read(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    let _ = notices.blocking_send(LinkNotice::Lost(e.to_string()));
                    return;
                }
            };
            if n == 0 {
                continue;
            }
            framer.push(&buf[..n]);
            while let Some(frame) = framer.next_frame() {
                match classify(&frame, config_id) {
                    Inbound::Ready => {
                        let _ = notices.blocking_send(LinkNotice::Ready);
                    }
                    Inbound::Rebooted => {
                        let _ = notices.blocking_send(LinkNotice::Lost("device rebooted".into()));
                        return;
                    }
                    Inbound::MyNode(num) => debug!("node number 0x{:08x}", num),
                    Inbound::Packet(packet) => {
                        if packets.blocking_send(packet).is_err() {
                            return;
                        }
                    }
                    Inbound::Other => trace!("unhandled FromRadio frame ({} bytes)", frame.len()),
                }
            }
        }
    }
}
