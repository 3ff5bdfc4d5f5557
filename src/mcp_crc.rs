//! CRC-16/CCITT für den Config Data Stream

/// Startwert
const CRC_SEED: u16 = 0xFFFF;
/// Polynom x^16 + x^12 + x^5 + 1
const CRC_POLY: u16 = 0x1021;

/// Berechnet den CRC-16/CCITT (Startwert 0xFFFF, nicht reflektiert) über alle Bytes
/// # Arguments
/// * bytes - Daten über die der CRC berechnet wird
pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
  let mut crc = CRC_SEED;
  for &b in bytes {
    crc ^= (b as u16) << 8;
    for _ in 0..8 {
      if (crc & 0x8000) != 0 {
        crc = (crc << 1) ^ CRC_POLY;
      } else {
        crc <<= 1;
      }
    }
  }
  crc
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn crc16_ccitt_test() {
    //Referenzwert CRC-16/CCITT-FALSE
    assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    //Keine Daten -> Startwert
    assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    //Ein Bit Unterschied -> anderer CRC
    assert_ne!(crc16_ccitt(b"123456788"), crc16_ccitt(b"123456789"));
  }
}
