//! Umrechnung der MCP "Local ID" (32 Bit in den Nutzdaten) in Protokoll und Adresse
//!
//! Bereiche der Local ID (nur die unteren 16 Bit sind relevant):
//! - 0x0000..0x03FF MM Lok
//! - 0x1000, 0x2000 MM (von CS2 nicht verwendet)
//! - 0x2C00..0x2FFF Mehrfachtraktion
//! - 0x3000..0x33FF MM Zubehör
//! - 0x3800..0x3FFF DCC Zubehör
//! - 0x4000..0x7FFF MFX Lok
//! - 0xC000..0xFFFF DCC Lok

use std::fmt;

/// Protokoll eines Dekoders
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
  None,
  MM,
  MFX,
  DCC,
  MultipleUnit,
}

impl Protocol {
  /// Liefert das Protokoll aus einem Text, so wie es auch gespeichert wird
  pub fn from_str(text: &str) -> Option<Protocol> {
    Some(match text {
      "none" => Protocol::None,
      "mm" => Protocol::MM,
      "mfx" => Protocol::MFX,
      "dcc" => Protocol::DCC,
      "multipleunit" => Protocol::MultipleUnit,
      _ => return None,
    })
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Protocol::None => "none",
      Protocol::MM => "mm",
      Protocol::MFX => "mfx",
      Protocol::DCC => "dcc",
      Protocol::MultipleUnit => "multipleunit",
    })
  }
}

/// Protokoll und Adresse
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
  pub protocol: Protocol,
  pub address: u16,
}

impl ProtocolAddress {
  pub fn new(protocol: Protocol, address: u16) -> ProtocolAddress {
    ProtocolAddress { protocol, address }
  }
}

/// Zerlegt eine Local ID in Protokoll und Adresse.
/// Unbekannte Bereiche liefern Protocol::None mit Adresse 0.
/// # Arguments
/// * local_id - Local ID aus den Nutzdaten (Bytes 0..4)
pub fn parse_address_protocol(local_id: u32) -> ProtocolAddress {
  let input = (local_id & 0xFFFF) as u16;
  match input & 0xFC00 {
    0x0000 | 0x1000 | 0x2000 | 0x3000 => {
      return ProtocolAddress::new(Protocol::MM, input & 0x03FF);
    }
    0x2C00 => {
      return ProtocolAddress::new(Protocol::MultipleUnit, input & 0x03FF);
    }
    0x3800 | 0x3C00 => {
      return ProtocolAddress::new(Protocol::DCC, input & 0x03FF);
    }
    //0x0800 / 0x2800 SX1 wird von der CS2 nicht verwendet
    _ => {}
  }
  let address = input & 0x3FFF;
  match input & 0xC000 {
    0x4000 => ProtocolAddress::new(Protocol::MFX, address),
    0xC000 => ProtocolAddress::new(Protocol::DCC, address),
    _ => ProtocolAddress::new(Protocol::None, 0),
  }
}

/// Local ID für ein Lok Kommando
/// # Arguments
/// * protocol - Protokoll der Lok
/// * address - Adresse der Lok
pub fn local_id_loco(protocol: Protocol, address: u16) -> u32 {
  let local_id = address as u32;
  match protocol {
    Protocol::DCC => local_id | 0xC000,
    Protocol::MFX => local_id | 0x4000,
    Protocol::MultipleUnit => local_id | 0x2000,
    //MM, Adresse direkt
    _ => local_id,
  }
}

/// Local ID für ein Zubehör Kommando.
/// Die Adresse in der Anwendung beginnt bei 1, im Protokoll bei 0.
/// # Arguments
/// * protocol - Protokoll des Zubehördekoders
/// * address - Adresse, 1 basiert
pub fn local_id_accessory(protocol: Protocol, address: u16) -> u32 {
  let local_id = address.saturating_sub(1) as u32;
  match protocol {
    Protocol::DCC => local_id | 0x3800,
    _ => local_id | 0x3000,
  }
}
