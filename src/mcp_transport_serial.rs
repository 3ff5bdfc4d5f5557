//! MCP über eine serielle Schnittstelle (z.B. USB Gleisbox Adapter)
//!
//! Die Schnittstelle (Baudrate etc.) muss extern eingestellt sein (stty).
//! Frames zu je 13 Bytes wie bei TCP.

use std::{
  fs::{File, OpenOptions},
  io::{self, Read, Write},
};

use nix::poll::{poll, PollFd, PollFlags};

use crate::{
  mcp_frame::{Frame, FRAME_LEN},
  mcp_transport::{io_error, FrameTransport, TransportError, RECEIVE_TIMEOUT},
};

pub struct SerialTransport {
  device: String,
  file: File,
  buffer: [u8; FRAME_LEN],
  filled: usize,
}

impl SerialTransport {
  /// # Arguments
  /// * device - Device File, z.B. /dev/ttyUSB0
  pub fn open(device: &str) -> Result<SerialTransport, TransportError> {
    let file = OpenOptions::new().read(true).write(true).open(device)?;
    Ok(SerialTransport {
      device: device.to_string(),
      file,
      buffer: [0; FRAME_LEN],
      filled: 0,
    })
  }

  /// Wartet bis Daten vorhanden sind, false bei Timeout
  fn wait_readable(&self) -> Result<bool, TransportError> {
    let mut fds = [PollFd::new(&self.file, PollFlags::POLLIN)];
    let ready = poll(&mut fds, RECEIVE_TIMEOUT.as_millis() as i32).map_err(io::Error::from)?;
    Ok(ready > 0)
  }
}

impl FrameTransport for SerialTransport {
  fn receive_frame(&mut self) -> Result<Frame, TransportError> {
    while self.filled < FRAME_LEN {
      if !self.wait_readable()? {
        return Err(TransportError::TimedOut);
      }
      match self.file.read(&mut self.buffer[self.filled..]) {
        Ok(0) => return Err(TransportError::Closed),
        Ok(size) => self.filled += size,
        Err(err) => return Err(io_error(err)),
      }
    }
    self.filled = 0;
    Ok(Frame::decode(&self.buffer)?)
  }

  fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
    self.file.write_all(&frame.encode()).map_err(io_error)
  }

  fn name(&self) -> String {
    format!("Seriell {}", self.device)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mcp_frame::McpCommand;
  use std::{env, fs, process};

  #[test]
  fn file_test() {
    let path = env::temp_dir().join(format!("mcpd_serial_{}", process::id()));
    let frame = Frame::new(McpCommand::S88Event, true, 0x4711, &[0, 1, 0, 2, 0, 1, 0, 5]).unwrap();
    let mut raw = frame.encode().to_vec();
    //Unvollständiger zweiter Frame
    raw.extend_from_slice(&[0, 0, 0]);
    fs::write(&path, &raw).unwrap();
    let mut transport = SerialTransport::open(path.to_str().unwrap()).unwrap();
    assert_eq!(transport.receive_frame().unwrap(), frame);
    assert!(matches!(
      transport.receive_frame(),
      Err(TransportError::Closed)
    ));
    assert!(transport.name().starts_with("Seriell"));
    fs::remove_file(&path).unwrap();
  }
}
