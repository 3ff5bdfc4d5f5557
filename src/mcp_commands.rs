//! Erzeugung der zu sendenden MCP Frames

use crate::{
  layout_objects::Orientation,
  layout_world::BoosterState,
  mcp_address::{local_id_accessory, local_id_loco, Protocol},
  mcp_crc::crc16_ccitt,
  mcp_frame::{build_id, Frame, McpCommand, MAX_DATA_LEN},
};

/// Version die in Ping Antworten gemeldet wird: 3.8
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 8;

/// Gerätekennungen in Ping Antworten (Bytes 6..8)
pub const DEVICE_GFP: u16 = 0x0000;
pub const DEVICE_GLEISBOX: u16 = 0x0010;
pub const DEVICE_GLEISBOX_2: u16 = 0x0011;
pub const DEVICE_CONNECT6021: u16 = 0x0020;
pub const DEVICE_MS2: u16 = 0x0030;
pub const DEVICE_MS2_2: u16 = 0x0032;
pub const DEVICE_MS2_3: u16 = 0x0033;
pub const DEVICE_MS2_4: u16 = 0x0034;
pub const DEVICE_LINK_S88: u16 = 0x0040;
pub const DEVICE_CS2_SLAVE_2: u16 = 0xEEEE;
pub const DEVICE_WIRELESS: u16 = 0xFFE0;
pub const DEVICE_CS2_SLAVE: u16 = 0xFFF0;
pub const DEVICE_CS2_MASTER: u16 = 0xFFFF;

/// System Subkommandos (Byte 4)
pub const SYSTEM_STOP: u8 = 0x00;
pub const SYSTEM_GO: u8 = 0x01;
pub const SYSTEM_HALT: u8 = 0x02;
pub const SYSTEM_LOCO_EMERGENCY_STOP: u8 = 0x03;

/// Frame mit bis zu 8 Bytes Nutzdaten, Prio 0
fn build(command: McpCommand, response: bool, hash: u16, payload: &[u8]) -> Frame {
  let mut data = [0; MAX_DATA_LEN];
  let length = payload.len().min(MAX_DATA_LEN);
  data[..length].copy_from_slice(&payload[..length]);
  Frame::from_parts(
    build_id(0, command as u8, response, hash),
    length as u8,
    data,
  )
}

/// Booster ein / aus / anhalten (an alle, UID 0)
pub fn booster(hash: u16, state: BoosterState) -> Frame {
  let sub = match state {
    BoosterState::Stop => SYSTEM_STOP,
    BoosterState::Go => SYSTEM_GO,
    BoosterState::Halt => SYSTEM_HALT,
  };
  build(McpCommand::System, false, hash, &[0, 0, 0, 0, sub])
}

/// Nothalt einer Lok
pub fn loco_emergency_stop(hash: u16, protocol: Protocol, address: u16) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.push(SYSTEM_LOCO_EMERGENCY_STOP);
  build(McpCommand::System, false, hash, &payload)
}

/// Geschwindigkeit 0..1000
pub fn loco_speed(hash: u16, protocol: Protocol, address: u16, speed: u16) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.extend_from_slice(&speed.to_be_bytes());
  build(McpCommand::LocoSpeed, false, hash, &payload)
}

/// Fahrtrichtung: 1 = rechts (vorwärts), 2 = links (rückwärts)
pub fn loco_orientation(
  hash: u16, protocol: Protocol, address: u16, orientation: Orientation,
) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.push(if orientation.is_right() { 1 } else { 2 });
  build(McpCommand::LocoDirection, false, hash, &payload)
}

pub fn loco_function(hash: u16, protocol: Protocol, address: u16, nr: u8, on: bool) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.push(nr);
  payload.push(on as u8);
  build(McpCommand::LocoFunction, false, hash, &payload)
}

/// Zubehör schalten
/// # Arguments
/// * hash - Eigener Hash
/// * protocol - Protokoll Dekoder
/// * address - Adresse 1 basiert
/// * state - 0 = rot / rund, 1 = grün / gerade
/// * on - Strom ein / aus
pub fn accessory(hash: u16, protocol: Protocol, address: u16, state: u8, on: bool) -> Frame {
  let mut payload = local_id_accessory(protocol, address)
    .to_be_bytes()
    .to_vec();
  payload.push(state & 0x03);
  payload.push(on as u8);
  build(McpCommand::Accessory, false, hash, &payload)
}

/// CV lesen, ein Byte
pub fn program_read(hash: u16, protocol: Protocol, address: u16, cv: u16) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.extend_from_slice(&cv.to_be_bytes());
  payload.push(1);
  build(McpCommand::ReadConfig, false, hash, &payload)
}

/// CV schreiben, flags Bit 7 = Programmieren auf dem Hauptgleis
pub fn program_write(
  hash: u16, protocol: Protocol, address: u16, cv: u16, value: u8, flags: u8,
) -> Frame {
  let mut payload = local_id_loco(protocol, address).to_be_bytes().to_vec();
  payload.extend_from_slice(&cv.to_be_bytes());
  payload.push(value);
  payload.push(flags);
  build(McpCommand::WriteConfig, false, hash, &payload)
}

/// Ping an alle Teilnehmer
pub fn ping(hash: u16) -> Frame {
  build(McpCommand::Ping, false, hash, &[])
}

/// Antwort auf Ping: eigene UID, Version, Gerätekennung CS2 Slave
pub fn ping_response(uid: u32, hash: u16) -> Frame {
  let mut payload = uid.to_be_bytes().to_vec();
  payload.extend_from_slice(&[VERSION_MAJOR, VERSION_MINOR]);
  payload.extend_from_slice(&DEVICE_CS2_SLAVE.to_be_bytes());
  build(McpCommand::Ping, true, hash, &payload)
}

/// Anforderung einer Konfigurationsdatei, z.B. "loks". Name max. 8 Zeichen.
pub fn request_config_data(hash: u16, name: &str) -> Frame {
  let mut payload = [0u8; MAX_DATA_LEN];
  for (i, b) in name.bytes().take(MAX_DATA_LEN).enumerate() {
    payload[i] = b;
  }
  build(McpCommand::RequestConfigData, false, hash, &payload)
}

/// Alle Frames eines Config Data Streams: Ankündigung mit Länge und CRC, danach je 8 Bytes.
/// Der letzte Frame wird mit 0 aufgefüllt, der CRC wird über die aufgefüllten Daten berechnet.
/// # Arguments
/// * hash - Eigener Hash
/// * data - Zu sendende Daten (gespeichert oder bereits komprimiert)
pub fn config_stream_frames(hash: u16, data: &[u8]) -> Vec<Frame> {
  let mut padded = data.to_vec();
  padded.resize(data.len().div_ceil(MAX_DATA_LEN) * MAX_DATA_LEN, 0);
  let mut announce = (data.len() as u32).to_be_bytes().to_vec();
  announce.extend_from_slice(&crc16_ccitt(&padded).to_be_bytes());
  let mut frames = vec![build(McpCommand::ConfigDataStream, false, hash, &announce)];
  for chunk in padded.chunks(MAX_DATA_LEN) {
    frames.push(build(McpCommand::ConfigDataStream, false, hash, chunk));
  }
  frames
}
