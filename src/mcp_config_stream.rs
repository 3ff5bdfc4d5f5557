//! Empfang Config Data Stream (Kommando 0x21)
//!
//! Ablauf:
//! - Frame mit Länge 6 oder 7: Ankündigung, Bytes 0..4 Länge, Bytes 4..6 CRC, optional Byte 6
//! - Frames mit Länge 8: Daten, bis die angekündigte Länge erreicht ist
//! - CRC-16/CCITT über alle empfangenen Bytes (inkl. Auffüllung des letzten Frames)
//! - Byte 0 == 0: komprimiert, Bytes 0..4 Länge entpackt, ab Byte 4 zlib Daten

use std::io::Read;

use chrono::{DateTime, Local};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
  mcp_crc::crc16_ccitt,
  mcp_frame::{Frame, MAX_DATA_LEN},
};

/// Maske / Muster CAN ID Broadcast Trigger mit Filename (0x21 Response mit Hash 0x47xx)
const TRIGGER_MASK: u32 = 0x01FF_FF00;
const TRIGGER_ID: u32 = 0x0043_4700;
/// Grösste angenommene Länge eines Streams. Grössere Ankündigungen werden verworfen.
pub const MAX_STREAM_SIZE: u32 = 4 * 1024 * 1024;

/// Fehler beim Abschluss eines Streams
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
  #[error("CRC Fehler: erwartet 0x{expected:04X}, berechnet 0x{actual:04X}")]
  Crc { expected: u16, actual: u16 },
  #[error("Daten konnten nicht entpackt werden: {0}")]
  Inflate(String),
  #[error("Angekündigte Länge {size} grösser als {max}")]
  TooLarge { size: u32, max: u32 },
}

/// Vollständig und fehlerfrei empfangene Daten
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigData {
  /// Angeforderter Name, z.B. "loks", leer wenn unbekannt
  pub name: String,
  /// Entpackte bzw. gespeicherte Daten
  pub data: Vec<u8>,
  pub compressed: bool,
  pub received_at: DateTime<Local>,
}

/// Ergebnis der Verarbeitung eines Frames
#[derive(Debug, Clone, PartialEq)]
pub enum StreamProgress {
  /// Frame gehört zu keinem Stream oder hat ungültige Länge
  Ignored,
  Announced { total_size: u32, crc: u16 },
  Accumulating { received: usize, total: usize },
  /// Broadcast Trigger, keine Daten
  Trigger { name: String },
  Complete(ConfigData),
  CrcError { expected: u16, actual: u16 },
  /// Entpacken fehlgeschlagen, raw enthält die empfangenen Daten zur Diagnose
  InflateError { error: StreamError, raw: Vec<u8> },
  /// Ankündigung verworfen, ein laufender Stream ist abgebrochen
  Rejected(StreamError),
}

/// Zustand des Empfängers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Idle,
  Announced,
  Accumulating,
}

/// Laufender Stream
#[derive(Debug)]
struct ConfigDataStream {
  total_size: u32,
  crc16: u16,
  received: Vec<u8>,
  received_count: usize,
  name: String,
}

/// Zusammensetzen eines Config Data Streams, eine Instanz pro Verbindung
#[derive(Debug, Default)]
pub struct ConfigStreamReassembler {
  stream: Option<ConfigDataStream>,
  //Name aus der letzten Anforderung (Kommando 0x20)
  requested_name: String,
}

/// Nullterminierter ASCII Name aus Nutzdaten
pub fn name_from_payload(payload: &[u8]) -> String {
  payload
    .iter()
    .take_while(|b| **b != 0)
    .map(|b| *b as char)
    .collect()
}

/// Entpackt zlib Daten, ohne zlib Header als raw deflate
/// # Arguments
/// * compressed - Komprimierte Daten
/// * inflated_size - Erwartete Grösse entpackt
pub fn inflate(compressed: &[u8], inflated_size: usize) -> Result<Vec<u8>, StreamError> {
  let mut data = Vec::with_capacity(inflated_size);
  let zlib_header = compressed.len() >= 2
    && (compressed[0] & 0x0F) == 8
    && (((compressed[0] as u16) << 8) | compressed[1] as u16) % 31 == 0;
  let result = if zlib_header {
    ZlibDecoder::new(compressed)
      .take(inflated_size as u64)
      .read_to_end(&mut data)
  } else {
    DeflateDecoder::new(compressed)
      .take(inflated_size as u64)
      .read_to_end(&mut data)
  };
  result.map_err(|err| StreamError::Inflate(err.to_string()))?;
  if data.len() != inflated_size {
    warn!(
      "Entpackte Grösse {} statt angekündigt {}",
      data.len(),
      inflated_size
    );
  }
  Ok(data)
}

impl ConfigStreamReassembler {
  pub fn new() -> ConfigStreamReassembler {
    ConfigStreamReassembler::default()
  }

  /// Name der angeforderten Datei, wird dem nächsten vollständigen Stream zugeordnet
  pub fn set_requested_name(&mut self, name: &str) {
    self.requested_name = name.to_string();
  }

  pub fn state(&self) -> StreamState {
    match &self.stream {
      None => StreamState::Idle,
      Some(stream) if stream.received_count == 0 => StreamState::Announced,
      Some(_) => StreamState::Accumulating,
    }
  }

  /// Verarbeitet einen Frame des Kommandos 0x21
  pub fn push(&mut self, frame: &Frame) -> StreamProgress {
    match frame.len() {
      6 | 7 => self.announce(frame),
      8 => {
        if (frame.id() & TRIGGER_MASK) == TRIGGER_ID {
          let name = name_from_payload(frame.payload());
          debug!(
            "Config Data Broadcast Trigger ID 0x{:02X} für {}",
            frame.id() & 0xFF,
            name
          );
          return StreamProgress::Trigger { name };
        }
        self.append(frame)
      }
      length => {
        debug!("Config Data Stream mit unerwarteter Länge {}", length);
        StreamProgress::Ignored
      }
    }
  }

  fn announce(&mut self, frame: &Frame) -> StreamProgress {
    let total_size = frame.payload_u32(0);
    let crc = frame.payload_u16(4);
    if self.stream.take().is_some() {
      debug!("Config Data Stream neu angekündigt, bisherige Daten verworfen");
    }
    if total_size > MAX_STREAM_SIZE {
      let err = StreamError::TooLarge {
        size: total_size,
        max: MAX_STREAM_SIZE,
      };
      warn!("Config Data Stream verworfen: {}", err);
      return StreamProgress::Rejected(err);
    }
    debug!(
      "Config Data Stream: Länge 0x{:08X} CRC 0x{:04X}",
      total_size, crc
    );
    self.stream = Some(ConfigDataStream {
      total_size,
      crc16: crc,
      received: vec![0; total_size as usize + MAX_DATA_LEN],
      received_count: 0,
      name: self.requested_name.clone(),
    });
    StreamProgress::Announced { total_size, crc }
  }

  fn append(&mut self, frame: &Frame) -> StreamProgress {
    let Some(stream) = self.stream.as_mut() else {
      debug!("Config Data ohne Ankündigung ignoriert");
      return StreamProgress::Ignored;
    };
    let total = stream.total_size as usize;
    if stream.received_count < total {
      let start = stream.received_count;
      stream.received[start..start + MAX_DATA_LEN].copy_from_slice(frame.payload());
      stream.received_count += MAX_DATA_LEN;
    }
    if stream.received_count < total {
      return StreamProgress::Accumulating {
        received: stream.received_count,
        total,
      };
    }
    //Vollständig, Stream ist in jedem Fall abgeschlossen
    match self.stream.take() {
      Some(stream) => self.complete(stream),
      None => StreamProgress::Ignored,
    }
  }

  fn complete(&mut self, stream: ConfigDataStream) -> StreamProgress {
    let actual = crc16_ccitt(&stream.received[..stream.received_count]);
    if actual != stream.crc16 {
      let err = StreamError::Crc {
        expected: stream.crc16,
        actual,
      };
      warn!("Config Data {}: {}", stream.name, err);
      return StreamProgress::CrcError {
        expected: stream.crc16,
        actual,
      };
    }
    let total = stream.total_size as usize;
    let compressed = total > 0 && stream.received[0] == 0;
    let data = if compressed {
      if total < 4 {
        return StreamProgress::InflateError {
          error: StreamError::Inflate(format!("Stream zu kurz: {} Bytes", total)),
          raw: stream.received[..total].to_vec(),
        };
      }
      let inflated_size = u32::from_be_bytes([
        stream.received[0],
        stream.received[1],
        stream.received[2],
        stream.received[3],
      ]) as usize;
      match inflate(&stream.received[4..total], inflated_size) {
        Ok(data) => data,
        Err(err) => {
          warn!("Config Data {}: {}", stream.name, err);
          let mut raw = stream.received;
          raw.truncate(total);
          return StreamProgress::InflateError { error: err, raw };
        }
      }
    } else {
      stream.received[..total].to_vec()
    };
    info!(
      "Config Data {} mit CRC 0x{:04X}, Länge {}, {} Bytes {}",
      stream.name,
      stream.crc16,
      total,
      data.len(),
      if compressed { "entpackt" } else { "unkomprimiert" }
    );
    self.requested_name.clear();
    StreamProgress::Complete(ConfigData {
      name: stream.name,
      data,
      compressed,
      received_at: Local::now(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{mcp_commands::config_stream_frames, mcp_frame::McpCommand};
  use flate2::{write::ZlibEncoder, Compression};
  use std::io::Write;

  fn data_frame(payload: &[u8]) -> Frame {
    Frame::new(McpCommand::ConfigDataStream, false, 0x4711, payload).unwrap()
  }

  fn announce_frame(total: u32, crc: u16) -> Frame {
    let mut payload = total.to_be_bytes().to_vec();
    payload.extend_from_slice(&crc.to_be_bytes());
    data_frame(&payload)
  }

  fn complete(progress: StreamProgress) -> ConfigData {
    match progress {
      StreamProgress::Complete(data) => data,
      other => panic!("Complete erwartet, erhalten {:?}", other),
    }
  }

  #[test]
  fn complete_stored_test() {
    let data: Vec<u8> = (1..=24).collect();
    let mut reassembler = ConfigStreamReassembler::new();
    assert_eq!(reassembler.state(), StreamState::Idle);
    let progress = reassembler.push(&announce_frame(24, crc16_ccitt(&data)));
    assert_eq!(
      progress,
      StreamProgress::Announced {
        total_size: 24,
        crc: crc16_ccitt(&data)
      }
    );
    assert_eq!(reassembler.state(), StreamState::Announced);
    assert_eq!(
      reassembler.push(&data_frame(&data[0..8])),
      StreamProgress::Accumulating {
        received: 8,
        total: 24
      }
    );
    assert_eq!(reassembler.state(), StreamState::Accumulating);
    reassembler.push(&data_frame(&data[8..16]));
    let result = complete(reassembler.push(&data_frame(&data[16..24])));
    assert_eq!(result.data, data);
    assert!(!result.compressed);
    assert_eq!(reassembler.state(), StreamState::Idle);
  }

  #[test]
  fn crc_error_test() {
    let data: Vec<u8> = (1..=24).collect();
    for flip in 0..24 {
      let mut corrupt = data.clone();
      corrupt[flip] ^= 0x01;
      let mut reassembler = ConfigStreamReassembler::new();
      reassembler.push(&announce_frame(24, crc16_ccitt(&data)));
      reassembler.push(&data_frame(&corrupt[0..8]));
      reassembler.push(&data_frame(&corrupt[8..16]));
      match reassembler.push(&data_frame(&corrupt[16..24])) {
        StreamProgress::CrcError { expected, actual } => {
          assert_eq!(expected, crc16_ccitt(&data));
          assert_eq!(actual, crc16_ccitt(&corrupt));
        }
        other => panic!("CrcError erwartet, erhalten {:?}", other),
      }
      assert_eq!(reassembler.state(), StreamState::Idle);
    }
  }

  #[test]
  fn scenario_crc_mismatch_test() {
    let mut reassembler = ConfigStreamReassembler::new();
    let progress = reassembler.push(&announce_frame(0x10, 0xABCD));
    assert!(matches!(progress, StreamProgress::Announced { .. }));
    let data = [0x55u8; 16];
    assert_ne!(crc16_ccitt(&data), 0xABCD);
    assert!(matches!(
      reassembler.push(&data_frame(&data[..8])),
      StreamProgress::Accumulating { .. }
    ));
    assert_eq!(
      reassembler.push(&data_frame(&data[8..])),
      StreamProgress::CrcError {
        expected: 0xABCD,
        actual: crc16_ccitt(&data)
      }
    );
  }

  #[test]
  fn reset_on_new_announce_test() {
    let data: Vec<u8> = (1..=16).collect();
    let mut reassembler = ConfigStreamReassembler::new();
    reassembler.push(&announce_frame(16, 0x1234));
    reassembler.push(&data_frame(&[0xEE; 8]));
    //Neue Ankündigung, alte Daten dürfen nicht mehr enthalten sein
    reassembler.push(&announce_frame(16, crc16_ccitt(&data)));
    assert_eq!(reassembler.state(), StreamState::Announced);
    reassembler.push(&data_frame(&data[..8]));
    let result = complete(reassembler.push(&data_frame(&data[8..])));
    assert_eq!(result.data, data);
  }

  #[test]
  fn trigger_and_idle_test() {
    let mut reassembler = ConfigStreamReassembler::new();
    //Daten ohne Ankündigung
    assert_eq!(
      reassembler.push(&data_frame(&[1; 8])),
      StreamProgress::Ignored
    );
    reassembler.push(&announce_frame(8, crc16_ccitt(b"lokliste")));
    //Broadcast Trigger wird nicht als Daten übernommen
    let trigger = Frame::from_id(0x0043_4711, b"loks\0\0\0\0").unwrap();
    assert_eq!(
      reassembler.push(&trigger),
      StreamProgress::Trigger {
        name: "loks".to_string()
      }
    );
    assert_eq!(reassembler.state(), StreamState::Announced);
    let result = complete(reassembler.push(&data_frame(b"lokliste")));
    assert_eq!(result.data, b"lokliste");
    //Ungültige Länge
    assert_eq!(
      reassembler.push(&data_frame(&[1, 2, 3])),
      StreamProgress::Ignored
    );
  }

  #[test]
  fn compressed_test() {
    let text = b"[lokomotive]\nlokomotive\n .name=BR 89\n .uid=0x4006\n".repeat(4);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&text).unwrap();
    let mut stream = (text.len() as u32).to_be_bytes().to_vec();
    stream.extend_from_slice(&encoder.finish().unwrap());
    let mut reassembler = ConfigStreamReassembler::new();
    reassembler.set_requested_name("loks");
    let mut last = StreamProgress::Ignored;
    for frame in config_stream_frames(0x4711, &stream) {
      last = reassembler.push(&frame);
    }
    let result = complete(last);
    assert!(result.compressed);
    assert_eq!(result.name, "loks");
    assert_eq!(result.data, text);
  }

  #[test]
  fn inflate_error_test() {
    //Byte 0 == 0 aber keine gültigen komprimierten Daten
    let stream = [0, 0, 0, 100, 0xFF, 0xFF, 0xFF, 0xFF];
    let mut reassembler = ConfigStreamReassembler::new();
    let mut last = StreamProgress::Ignored;
    for frame in config_stream_frames(0x4711, &stream) {
      last = reassembler.push(&frame);
    }
    match last {
      StreamProgress::InflateError { error, raw } => {
        assert!(matches!(error, StreamError::Inflate(_)));
        assert_eq!(raw, stream);
      }
      other => panic!("InflateError erwartet, erhalten {:?}", other),
    }
    assert_eq!(reassembler.state(), StreamState::Idle);
  }

  #[test]
  fn too_large_announce_test() {
    let data: Vec<u8> = (1..=8).collect();
    let mut reassembler = ConfigStreamReassembler::new();
    reassembler.push(&announce_frame(8, crc16_ccitt(&data)));
    assert_eq!(reassembler.state(), StreamState::Announced);
    assert_eq!(
      reassembler.push(&announce_frame(0xFFFF_FFF0, 0x1234)),
      StreamProgress::Rejected(StreamError::TooLarge {
        size: 0xFFFF_FFF0,
        max: MAX_STREAM_SIZE
      })
    );
    //Laufender Stream abgebrochen, Daten werden ignoriert
    assert_eq!(reassembler.state(), StreamState::Idle);
    assert_eq!(reassembler.push(&data_frame(&data)), StreamProgress::Ignored);
    //Grösste erlaubte Länge wird angenommen
    assert!(matches!(
      reassembler.push(&announce_frame(MAX_STREAM_SIZE, 0)),
      StreamProgress::Announced { .. }
    ));
  }

  #[test]
  fn raw_deflate_test() {
    let mut encoder =
      flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"gleisbild").unwrap();
    let compressed = encoder.finish().unwrap();
    assert_eq!(inflate(&compressed, 9).unwrap(), b"gleisbild");
  }
}
