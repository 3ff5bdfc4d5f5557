//! MCP direkt auf dem CAN Bus über SocketCAN (Linux), z.B. can0 an der Gleisbox
//!
//! Die MCP ID ist die 29 Bit Extended CAN ID, die Nutzdaten entsprechen den CAN Daten.

use std::io;

use log::debug;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};

use crate::{
  mcp_frame::Frame,
  mcp_transport::{io_error, FrameTransport, TransportError, RECEIVE_TIMEOUT},
};

pub struct CanTransport {
  interface: String,
  socket: CanSocket,
}

impl CanTransport {
  /// # Arguments
  /// * interface - CAN Interface, z.B. "can0"
  pub fn open(interface: &str) -> Result<CanTransport, TransportError> {
    let socket = CanSocket::open(interface)?;
    socket.set_read_timeout(RECEIVE_TIMEOUT)?;
    Ok(CanTransport {
      interface: interface.to_string(),
      socket,
    })
  }
}

/// CAN Frame -> MCP Frame, None für Error und Remote Frames
pub fn frame_from_can(can_frame: &CanFrame) -> Option<Result<Frame, TransportError>> {
  if !matches!(can_frame, CanFrame::Data(_)) {
    return None;
  }
  let id = match can_frame.id() {
    Id::Extended(id) => id.as_raw(),
    Id::Standard(id) => id.as_raw() as u32,
  };
  Some(Frame::from_id(id, can_frame.data()).map_err(TransportError::from))
}

/// MCP Frame -> CAN Frame mit Extended ID
pub fn frame_to_can(frame: &Frame) -> Result<CanFrame, TransportError> {
  let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "Ungültiger CAN Frame");
  let id = ExtendedId::new(frame.id() & 0x1FFF_FFFF).ok_or_else(invalid)?;
  Ok(CanFrame::new(id, frame.payload()).ok_or_else(invalid)?)
}

impl FrameTransport for CanTransport {
  fn receive_frame(&mut self) -> Result<Frame, TransportError> {
    let can_frame = self.socket.read_frame().map_err(io_error)?;
    frame_from_can(&can_frame).unwrap_or_else(|| {
      debug!("{}: CAN Frame {:?} ignoriert", self.interface, can_frame);
      Err(TransportError::TimedOut)
    })
  }

  fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
    let can_frame = frame_to_can(frame)?;
    self.socket.write_frame(&can_frame).map_err(io_error)
  }

  fn name(&self) -> String {
    format!("CAN {}", self.interface)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mcp_frame::McpCommand;

  #[test]
  fn can_conversion_test() {
    let frame = Frame::new(McpCommand::LocoSpeed, true, 0x4711, &[0, 0, 0x40, 6, 0, 50]).unwrap();
    let can_frame = frame_to_can(&frame).unwrap();
    assert!(can_frame.is_extended());
    assert_eq!(can_frame.data(), frame.payload());
    assert_eq!(frame_from_can(&can_frame).unwrap().unwrap(), frame);
  }
}
