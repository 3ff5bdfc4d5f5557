//! MCP über TCP (CS2 Port 15731), Frames zu je 13 Bytes ohne weitere Trennung

use std::{
  io::{Read, Write},
  net::TcpStream,
};

use crate::{
  mcp_frame::{Frame, FRAME_LEN},
  mcp_transport::{io_error, FrameTransport, TransportError, RECEIVE_TIMEOUT},
};

pub const DEFAULT_PORT: u16 = 15731;

pub struct TcpTransport {
  stream: TcpStream,
  peer: String,
  //Teilweise empfangener Frame bleibt über Timeouts hinweg erhalten
  buffer: [u8; FRAME_LEN],
  filled: usize,
}

impl TcpTransport {
  pub fn connect(host: &str, port: u16) -> Result<TcpTransport, TransportError> {
    TcpTransport::from_stream(TcpStream::connect((host, port))?)
  }

  /// Bestehende Verbindung, z.B. ein Client des CS2 Servers
  pub fn from_stream(stream: TcpStream) -> Result<TcpTransport, TransportError> {
    stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let peer = stream
      .peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_default();
    Ok(TcpTransport {
      stream,
      peer,
      buffer: [0; FRAME_LEN],
      filled: 0,
    })
  }
}

impl FrameTransport for TcpTransport {
  fn receive_frame(&mut self) -> Result<Frame, TransportError> {
    while self.filled < FRAME_LEN {
      match self.stream.read(&mut self.buffer[self.filled..]) {
        Ok(0) => return Err(TransportError::Closed),
        Ok(size) => self.filled += size,
        Err(err) => return Err(io_error(err)),
      }
    }
    self.filled = 0;
    Ok(Frame::decode(&self.buffer)?)
  }

  fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
    self.stream.write_all(&frame.encode()).map_err(io_error)
  }

  fn name(&self) -> String {
    format!("TCP {}", self.peer)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mcp_frame::McpCommand;
  use std::net::TcpListener;

  fn connected() -> (TcpTransport, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let transport = TcpTransport::connect("127.0.0.1", port).unwrap();
    let (server, _) = listener.accept().unwrap();
    (transport, server)
  }

  #[test]
  fn partial_frame_test() {
    let (mut transport, mut server) = connected();
    let frame = Frame::new(McpCommand::Accessory, true, 0x4711, &[0, 0, 0x30, 0, 1, 1]).unwrap();
    let raw = frame.encode();
    server.write_all(&raw[..5]).unwrap();
    server.flush().unwrap();
    assert!(matches!(
      transport.receive_frame(),
      Err(TransportError::TimedOut)
    ));
    server.write_all(&raw[5..]).unwrap();
    assert_eq!(transport.receive_frame().unwrap(), frame);
    transport.send_frame(&frame).unwrap();
    let mut echo = [0; FRAME_LEN];
    server.read_exact(&mut echo).unwrap();
    assert_eq!(echo, raw);
    drop(server);
    assert!(matches!(
      transport.receive_frame(),
      Err(TransportError::Closed)
    ));
  }
}
