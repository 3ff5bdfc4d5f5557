//! MCP Frame (Märklin CAN Protokoll) Codec
//!
//! Aufbau eines Frames auf dem Netzwerk (UDP/TCP/Seriell), immer 13 Bytes:
//! - 4 Bytes CAN ID, Big Endian
//!   - Bit 25..28 Prio
//!   - Bit 17..24 Kommando
//!   - Bit 16     Response
//!   - Bit  0..15 Hash
//! - 1 Byte  Länge Nutzdaten (0..8)
//! - 8 Bytes Nutzdaten, nicht verwendete Bytes sind 0

use std::fmt;

use thiserror::Error;

/// Länge eines Frames auf dem Netzwerk
pub const FRAME_LEN: usize = 13;
/// Max. Anzahl Nutzdatenbytes
pub const MAX_DATA_LEN: usize = 8;
/// Maske Hash Erkennung CS2 Frames (Bit 7..9)
const CS2_HASH_MASK: u32 = 0x0000_0380;
/// Bit 8 und 9 gesetzt, Bit 7 nicht -> CS2 Hash
const CS2_HASH_FLAG: u32 = 0x0000_0300;

/// Fehler beim Parsen / Erzeugen eines Frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
  /// Empfangene Anzahl Bytes ist nicht 13
  #[error("ungültige Framegrösse: {size} Bytes, erwartet 13")]
  InvalidSize { size: usize },
  /// Längenbyte > 8
  #[error("ungültige Länge Nutzdaten: {length}")]
  InvalidLength { length: usize },
}

/// Alle bekannten Kommandos (8 Bit, ohne Response Bit)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum McpCommand {
  System = 0x00,
  Discovery = 0x01,
  Bind = 0x02,
  Verify = 0x03,
  LocoSpeed = 0x04,
  LocoDirection = 0x05,
  LocoFunction = 0x06,
  ReadConfig = 0x07,
  WriteConfig = 0x08,
  Accessory = 0x0B,
  S88Polling = 0x10,
  S88Event = 0x11,
  Sx1Event = 0x12,
  Ping = 0x18,
  Bootloader = 0x1B,
  ConfigChannelStatus = 0x1D,
  AccessoryUpdate = 0x1E,
  MfxRaw = 0x1F,
  RequestConfigData = 0x20,
  ConfigDataStream = 0x21,
  Connect6021 = 0x22,
}

impl McpCommand {
  /// Liefert das Kommando zu einem 8 Bit Kommandocode, None wenn unbekannt
  pub fn from_u8(code: u8) -> Option<McpCommand> {
    Some(match code {
      0x00 => McpCommand::System,
      0x01 => McpCommand::Discovery,
      0x02 => McpCommand::Bind,
      0x03 => McpCommand::Verify,
      0x04 => McpCommand::LocoSpeed,
      0x05 => McpCommand::LocoDirection,
      0x06 => McpCommand::LocoFunction,
      0x07 => McpCommand::ReadConfig,
      0x08 => McpCommand::WriteConfig,
      0x0B => McpCommand::Accessory,
      0x10 => McpCommand::S88Polling,
      0x11 => McpCommand::S88Event,
      0x12 => McpCommand::Sx1Event,
      0x18 => McpCommand::Ping,
      0x1B => McpCommand::Bootloader,
      0x1D => McpCommand::ConfigChannelStatus,
      0x1E => McpCommand::AccessoryUpdate,
      0x1F => McpCommand::MfxRaw,
      0x20 => McpCommand::RequestConfigData,
      0x21 => McpCommand::ConfigDataStream,
      0x22 => McpCommand::Connect6021,
      _ => return None,
    })
  }
}

/// Ein MCP Frame
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
  //CAN ID (29 Bit, Bit 29..31 werden nicht interpretiert)
  id: u32,
  //Anzahl gültige Bytes in data
  length: u8,
  //Nutzdaten, ab length immer 0
  data: [u8; MAX_DATA_LEN],
}

impl Frame {
  /// Neuer Frame aus roher CAN ID und Nutzdaten
  /// # Arguments
  /// * id - CAN ID
  /// * payload - Nutzdaten, max. 8 Bytes
  pub fn from_id(id: u32, payload: &[u8]) -> Result<Frame, FramingError> {
    if payload.len() > MAX_DATA_LEN {
      return Err(FramingError::InvalidLength {
        length: payload.len(),
      });
    }
    let mut data = [0; MAX_DATA_LEN];
    data[..payload.len()].copy_from_slice(payload);
    Ok(Frame {
      id,
      length: payload.len() as u8,
      data,
    })
  }

  /// Neuer Frame aus Kopfdaten und Datenbuffer, Länge wird auf 8 begrenzt
  /// # Arguments
  /// * id - CAN ID
  /// * length - Anzahl gültiger Bytes in data
  /// * data - Nutzdaten
  pub fn from_parts(id: u32, length: u8, mut data: [u8; MAX_DATA_LEN]) -> Frame {
    let length = length.min(MAX_DATA_LEN as u8);
    data[length as usize..].fill(0);
    Frame { id, length, data }
  }

  /// Neuer Frame mit Prio 0
  /// # Arguments
  /// * command - Kommando
  /// * response - Response Bit
  /// * hash - Hash des Absenders
  /// * payload - Nutzdaten, max. 8 Bytes
  pub fn new(
    command: McpCommand, response: bool, hash: u16, payload: &[u8],
  ) -> Result<Frame, FramingError> {
    Frame::from_id(build_id(0, command as u8, response, hash), payload)
  }

  /// Frame aus 13 Bytes Netzwerkdaten dekodieren
  /// # Arguments
  /// * raw - Empfangene Bytes, müssen genau 13 sein
  pub fn decode(raw: &[u8]) -> Result<Frame, FramingError> {
    if raw.len() != FRAME_LEN {
      return Err(FramingError::InvalidSize { size: raw.len() });
    }
    let length = raw[4] as usize;
    if length > MAX_DATA_LEN {
      return Err(FramingError::InvalidLength { length });
    }
    let id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Frame::from_id(id, &raw[5..5 + length])
  }

  /// Frame als 13 Bytes Netzwerkdaten
  pub fn encode(&self) -> [u8; FRAME_LEN] {
    let mut raw = [0; FRAME_LEN];
    raw[0..4].copy_from_slice(&self.id.to_be_bytes());
    raw[4] = self.length;
    raw[5..].copy_from_slice(&self.data);
    raw
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn priority(&self) -> u8 {
    ((self.id >> 25) & 0x0F) as u8
  }

  /// 8 Bit Kommando ohne Response Bit
  pub fn command(&self) -> u8 {
    ((self.id >> 17) & 0xFF) as u8
  }

  /// 9 Bit Kommando inkl. Response Bit, so wie in den Kommandotabellen angegeben
  pub fn command_with_response(&self) -> u16 {
    ((self.id >> 16) & 0x1FF) as u16
  }

  pub fn is_response(&self) -> bool {
    (self.id & 0x0001_0000) != 0
  }

  pub fn hash(&self) -> u16 {
    (self.id & 0xFFFF) as u16
  }

  pub fn len(&self) -> usize {
    self.length as usize
  }

  /// Gültige Nutzdaten
  pub fn payload(&self) -> &[u8] {
    &self.data[..self.length as usize]
  }

  /// Nutzdatenbyte, 0 wenn ausserhalb der Länge
  pub fn byte(&self, index: usize) -> u8 {
    if index < self.len() {
      self.data[index]
    } else {
      0
    }
  }

  /// u16 Big Endian aus Nutzdaten ab offset
  pub fn payload_u16(&self, offset: usize) -> u16 {
    u16::from_be_bytes([self.byte(offset), self.byte(offset + 1)])
  }

  /// u32 Big Endian aus Nutzdaten ab offset
  pub fn payload_u32(&self, offset: usize) -> u32 {
    u32::from_be_bytes([
      self.byte(offset),
      self.byte(offset + 1),
      self.byte(offset + 2),
      self.byte(offset + 3),
    ])
  }

  /// Hexdump für trace Ausgaben
  pub fn to_hex(&self) -> String {
    let mut text = format!("{:08X} {}", self.id, self.length);
    for byte in self.payload() {
      text.push_str(&format!(" {:02X}", byte));
    }
    text
  }
}

impl fmt::Debug for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Frame({})", self.to_hex())
  }
}

/// CAN ID zusammensetzen
/// # Arguments
/// * prio - Prio (4 Bit)
/// * command - 8 Bit Kommando
/// * response - Response Bit
/// * hash - Hash des Absenders
pub fn build_id(prio: u8, command: u8, response: bool, hash: u16) -> u32 {
  (((prio & 0x0F) as u32) << 25) | ((command as u32) << 17) | ((response as u32) << 16) | hash as u32
}

/// Berechnet den Hash aus einer UID.
/// Bit 7 ist immer 0, Bit 8 und 9 immer 1 damit CS2 Frames von CS1 Frames unterschieden werden können.
pub fn calc_hash(uid: u32) -> u16 {
  let calc = (uid >> 16) ^ (uid & 0xFFFF);
  let hash = ((calc << 3) | 0x0300) & 0xFF00;
  (hash | (calc & 0x007F)) as u16
}

/// Heuristik ob ein Frame von einer CS1 / MS1 stammt.
/// Die Märklin Beschreibung stimmt nicht immer, deshalb die zusätzlichen Bitmuster.
/// # Arguments
/// * id - CAN ID
pub fn is_cs1_frame(id: u32) -> bool {
  if (id & CS2_HASH_MASK) == CS2_HASH_FLAG {
    return false;
  }
  (id & 0x1C00_0000) != 0 || (id & 0x1FFF_0080) == 0x80
}

/// Alle Frames aus einem UDP Datagramm, 13 Bytes Schritte.
/// Ein Rest < 13 Bytes liefert InvalidSize.
/// # Arguments
/// * datagram - Empfangenes Datagramm
pub fn frames_from_datagram(
  datagram: &[u8],
) -> impl Iterator<Item = Result<Frame, FramingError>> + '_ {
  datagram.chunks(FRAME_LEN).map(Frame::decode)
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn decode_ping_test() {
    let raw = [
      0x00, 0x31, 0x23, 0x4C, 8, 0x12, 0x34, 0x56, 0x78, 3, 8, 0xFF, 0xF0,
    ];
    let frame = Frame::decode(&raw).expect("Gültiger Ping Response");
    assert_eq!(frame.command(), McpCommand::Ping as u8);
    assert_eq!(frame.command_with_response(), 0x31);
    assert!(frame.is_response());
    assert_eq!(frame.hash(), 0x234C);
    assert_eq!(frame.payload_u32(0), 0x1234_5678);
    assert_eq!(frame.payload_u16(6), 0xFFF0);
    assert_eq!(frame.encode(), raw);
  }

  #[test]
  fn decode_length_test() {
    //Länge 9 -> Fehler
    let mut raw = [0u8; FRAME_LEN];
    raw[4] = 9;
    assert_eq!(
      Frame::decode(&raw),
      Err(FramingError::InvalidLength { length: 9 })
    );
    //Zu kurz
    assert_eq!(
      Frame::decode(&raw[..12]),
      Err(FramingError::InvalidSize { size: 12 })
    );
    //Bytes ausserhalb der Länge werden ignoriert
    let raw = [0x00, 0x00, 0x03, 0x00, 4, 1, 2, 3, 4, 0xAA, 0xBB, 0xCC, 0xDD];
    let frame = Frame::decode(&raw).expect("Länge 4 gültig");
    assert_eq!(frame.payload(), &[1, 2, 3, 4]);
    assert_eq!(&frame.encode()[9..], &[0, 0, 0, 0]);
    assert_eq!(frame.byte(5), 0);
  }

  #[test]
  fn new_frame_test() {
    let frame = Frame::new(McpCommand::ConfigDataStream, true, 0x4711, &[0; 6])
      .expect("6 Bytes gültig");
    assert_eq!(frame.id(), 0x0043_4711);
    assert_eq!(frame.priority(), 0);
    assert!(Frame::new(McpCommand::Ping, false, 0, &[0; 9]).is_err());
    assert_eq!(build_id(3, 0x18, false, 0x0300) >> 25, 3);
    //from_parts begrenzt und löscht Bytes ausserhalb der Länge
    let frame = Frame::from_parts(0x0030_0300, 2, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(frame.encode()[5..], [1, 2, 0, 0, 0, 0, 0, 0]);
    assert_eq!(Frame::from_parts(0, 12, [9; 8]).len(), 8);
  }

  #[test]
  fn hash_test() {
    assert_eq!(calc_hash(0), 0x0300);
    assert_eq!(calc_hash(0x1234_5678), 0x234C);
    //Alle Hashes müssen als CS2 Frames erkannt werden
    for uid in [0u32, 1, 0x4711, 0xFFFF_FFFF, 0x5A3F_0011] {
      let hash = calc_hash(uid) as u32;
      assert_eq!(hash & CS2_HASH_MASK, CS2_HASH_FLAG);
      assert!(!is_cs1_frame(hash));
    }
  }

  #[test]
  fn cs1_frame_test() {
    assert!(!is_cs1_frame(0x0031_234C));
    assert!(is_cs1_frame(0x0800_0100));
    assert!(is_cs1_frame(0x0000_0080));
    assert!(!is_cs1_frame(0x0000_0001));
  }

  #[test]
  fn datagram_test() {
    let a = Frame::new(McpCommand::System, false, 0x0300, &[0, 0, 0, 0, 1]).unwrap();
    let b = Frame::new(McpCommand::Ping, false, 0x0300, &[]).unwrap();
    let mut datagram = a.encode().to_vec();
    datagram.extend_from_slice(&b.encode());
    let frames: Vec<_> = frames_from_datagram(&datagram).collect();
    assert_eq!(frames, vec![Ok(a), Ok(b)]);
    //Ein Byte zu viel
    let frames: Vec<_> = frames_from_datagram(&datagram[..14]).collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], Ok(a));
    assert_eq!(frames[1], Err(FramingError::InvalidSize { size: 1 }));
  }

  proptest! {
    #[test]
    fn prop_roundtrip(id in any::<u32>(), payload in proptest::collection::vec(any::<u8>(), 0..=8)) {
      let frame = Frame::from_id(id, &payload).unwrap();
      prop_assert_eq!(Frame::decode(&frame.encode()), Ok(frame));
    }

    #[test]
    fn prop_length_rejected(id in any::<u32>(), length in 9u8..=255) {
      let mut raw = [0u8; FRAME_LEN];
      raw[0..4].copy_from_slice(&id.to_be_bytes());
      raw[4] = length;
      prop_assert_eq!(Frame::decode(&raw), Err(FramingError::InvalidLength { length: length as usize }));
    }

    #[test]
    fn prop_hash_deterministic(uid in any::<u32>()) {
      prop_assert_eq!(calc_hash(uid), calc_hash(uid));
      prop_assert_eq!(calc_hash(uid) & 0x0380, 0x0300);
    }
  }
}
