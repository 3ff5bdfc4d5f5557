//! Parser für die Lokliste einer CS2 Master ("loks", Format lokomotive.cs2)
//!
//! Beispiel:
//! ```text
//! [lokomotive]
//! version
//!  .minor=3
//! lokomotive
//!  .name=BR 89
//!  .uid=0x4006
//!  .funktionen
//!  ..nr=0
//!  ..typ=1
//! ```

use std::{iter::Peekable, str::Lines};

use log::{debug, info, warn};

use crate::mcp_address::{parse_address_protocol, Protocol, ProtocolAddress};

/// Art einer Lokfunktion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cs2FunctionType {
  Permanent,
  Once,
  /// Zeitfunktion, Dauer in Sekunden
  Timer(u16),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cs2Function {
  pub nr: u8,
  pub icon: u8,
  pub function_type: Cs2FunctionType,
}

/// Eine Lok aus der Lokliste
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Cs2Loco {
  pub name: String,
  /// Vorheriger Name bei Umbenennung
  pub old_name: Option<String>,
  /// Lok wurde auf der CS2 gelöscht
  pub remove: bool,
  pub address: Option<ProtocolAddress>,
  pub functions: Vec<Cs2Function>,
  /// Loks einer Mehrfachtraktion
  pub slaves: Vec<(ProtocolAddress, String)>,
}

/// " .key=value" zerlegen
fn key_value(line: &str) -> Option<(&str, &str)> {
  let stripped = line.strip_prefix(" .")?;
  if stripped.starts_with('.') {
    return None;
  }
  Some(stripped.split_once('=').unwrap_or((stripped, "")))
}

/// " ..key=value" zerlegen
fn subkey_value(line: &str) -> Option<(&str, &str)> {
  let stripped = line.strip_prefix(" ..")?;
  stripped.split_once('=')
}

/// Hex Zahl "0x4006" oder "4006"
fn hex_value(value: &str) -> u32 {
  let value = value.trim();
  let value = value
    .strip_prefix("0x")
    .or_else(|| value.strip_prefix("0X"))
    .unwrap_or(value);
  u32::from_str_radix(value, 16).unwrap_or(0)
}

fn int_value<T: std::str::FromStr + Default>(value: &str) -> T {
  value.trim().parse().unwrap_or_default()
}

/// Block " .funktionen" mit Unterschlüsseln
fn parse_function(lines: &mut Peekable<Lines<'_>>) -> Option<Cs2Function> {
  let mut nr = 0;
  let mut icon = 0;
  let mut function_type = None;
  while let Some((key, value)) = lines.peek().copied().and_then(subkey_value) {
    match key {
      "nr" => nr = int_value(value),
      "typ" | "typ2" => {
        let typ: u8 = int_value(value);
        icon = typ & 0x7F;
        //Bit 7: 0 = Dauerfunktion, 1 = Moment
        function_type = Some(if typ & 0x80 == 0 {
          Cs2FunctionType::Permanent
        } else {
          Cs2FunctionType::Once
        });
      }
      "dauer" | "dauer2" => function_type = Some(Cs2FunctionType::Timer(int_value(value))),
      _ => {}
    }
    lines.next();
  }
  function_type.map(|function_type| Cs2Function {
    nr,
    icon,
    function_type,
  })
}

/// Block " .traktion" mit Unterschlüsseln
fn parse_traktion(lines: &mut Peekable<Lines<'_>>) -> (ProtocolAddress, String) {
  let mut address = ProtocolAddress::new(Protocol::None, 0);
  let mut name = String::new();
  while let Some((key, value)) = lines.peek().copied().and_then(subkey_value) {
    match key {
      "lok" => address = parse_address_protocol(hex_value(value)),
      "lokname" => name = value.to_string(),
      _ => {}
    }
    lines.next();
  }
  (address, name)
}

/// Block "lokomotive"
fn parse_loco(lines: &mut Peekable<Lines<'_>>) -> Cs2Loco {
  let mut loco = Cs2Loco::default();
  while let Some(&line) = lines.peek() {
    if !line.starts_with(' ') {
      break;
    }
    let Some((key, value)) = key_value(line) else {
      //Unterschlüssel ohne bekannten Block
      lines.next();
      continue;
    };
    lines.next();
    match key {
      "name" => loco.name = value.to_string(),
      "vorname" => loco.old_name = Some(value.to_string()),
      "toRemove" => loco.remove = true,
      "uid" => loco.address = Some(parse_address_protocol(hex_value(value))),
      "funktionen" | "funktionen_2" | "fkt" | "fkt2" => {
        if let Some(function) = parse_function(lines) {
          loco.functions.push(function);
        }
      }
      "traktion" => loco.slaves.push(parse_traktion(lines)),
      _ => {}
    }
  }
  info!(
    "CS2 Lok {} {:?} mit {} Funktionen",
    loco.name,
    loco.address,
    loco.functions.len()
  );
  loco
}

/// Alle " .key=value" Zeilen überspringen, "minor" wird geprüft
fn skip_block(lines: &mut Peekable<Lines<'_>>) {
  while let Some((key, value)) = lines.peek().copied().and_then(key_value) {
    if key == "minor" && value != "3" && value != "4" {
      warn!("Unbekannte CS2 Version minor={}", value);
    }
    lines.next();
  }
}

/// Lokliste parsen
/// # Arguments
/// * text - Inhalt der Datei
pub fn parse_loks(text: &str) -> Vec<Cs2Loco> {
  let mut locos = Vec::new();
  let mut lines = text.lines().peekable();
  match lines.next() {
    Some("[lokomotive]") => {}
    other => {
      debug!("Keine CS2 Lokliste: {:?}", other);
      return locos;
    }
  }
  while let Some(line) = lines.next() {
    match line.trim_end() {
      "" => break,
      "version" | "session" => skip_block(&mut lines),
      "lokomotive" => locos.push(parse_loco(&mut lines)),
      other => {
        debug!("CS2 Lokliste: unbekannter Block {}", other);
        break;
      }
    }
  }
  locos
}

#[cfg(test)]
mod tests {
  use super::*;

  const LOKS: &str = "[lokomotive]
version
 .minor=3
session
 .id=7
lokomotive
 .name=BR 89
 .uid=0x4006
 .mfxuid=0x7fc8a1b2
 .funktionen
 ..nr=0
 ..typ=1
 .funktionen
 ..nr=1
 ..typ=136
 .funktionen
 ..nr=2
 ..typ=1
 ..dauer=5
 .funktionen
 ..nr=3
lokomotive
 .name=Doppel
 .vorname=Doppeltraktion
 .uid=0x2c01
 .traktion
 ..lok=0xc003
 ..lokname=V 100
lokomotive
 .name=Alt
 .toRemove
 .uid=0x18
";

  #[test]
  fn parse_loks_test() {
    let locos = parse_loks(LOKS);
    assert_eq!(locos.len(), 3);
    let br89 = &locos[0];
    assert_eq!(br89.name, "BR 89");
    assert_eq!(br89.address, Some(ProtocolAddress::new(Protocol::MFX, 6)));
    assert_eq!(
      br89.functions,
      vec![
        Cs2Function {
          nr: 0,
          icon: 1,
          function_type: Cs2FunctionType::Permanent
        },
        Cs2Function {
          nr: 1,
          icon: 8,
          function_type: Cs2FunctionType::Once
        },
        Cs2Function {
          nr: 2,
          icon: 1,
          function_type: Cs2FunctionType::Timer(5)
        },
      ]
    );
    let doppel = &locos[1];
    assert_eq!(doppel.old_name.as_deref(), Some("Doppeltraktion"));
    assert_eq!(
      doppel.address,
      Some(ProtocolAddress::new(Protocol::MultipleUnit, 1))
    );
    assert_eq!(
      doppel.slaves,
      vec![(ProtocolAddress::new(Protocol::DCC, 3), "V 100".to_string())]
    );
    assert!(locos[2].remove);
    assert_eq!(
      locos[2].address,
      Some(ProtocolAddress::new(Protocol::MM, 24))
    );
  }

  #[test]
  fn invalid_file_test() {
    assert!(parse_loks("").is_empty());
    assert!(parse_loks("[gleisbild]\nseite\n").is_empty());
    assert!(parse_loks("[lokomotive]\n").is_empty());
  }
}
