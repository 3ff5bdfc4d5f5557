//! MCP über UDP (CS2 / CAN-Gateway)
//!
//! Empfang auf einem lokalen Port (Default 15730), Senden an Host/Port des Gateways (Default 15731).
//! Ein Datagramm kann mehrere Frames zu je 13 Bytes enthalten.

use std::{
  collections::VecDeque,
  io,
  net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use log::debug;

use crate::{
  mcp_frame::{frames_from_datagram, Frame, FramingError},
  mcp_transport::{io_error, FrameTransport, TransportError, RECEIVE_TIMEOUT},
};

pub const DEFAULT_SEND_PORT: u16 = 15731;
pub const DEFAULT_RECEIVE_PORT: u16 = 15730;

//Maximale Grösse eines Datagramms
const MAX_DATAGRAM: usize = 1500;

pub struct UdpTransport {
  socket_rx: UdpSocket,
  socket_tx: UdpSocket,
  peer: SocketAddr,
  //Restliche Frames des letzten Datagramms
  pending: VecDeque<Result<Frame, FramingError>>,
}

impl UdpTransport {
  /// # Arguments
  /// * host - Gateway, Name oder IP
  /// * send_port - Port des Gateways
  /// * receive_port - Lokaler Empfangsport
  pub fn open(host: &str, send_port: u16, receive_port: u16) -> Result<UdpTransport, TransportError> {
    let peer = (host, send_port).to_socket_addrs()?.next().ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::NotFound,
        format!("Host {} nicht gefunden", host),
      )
    })?;
    let socket_rx = UdpSocket::bind(("0.0.0.0", receive_port))?;
    let socket_tx = UdpSocket::bind(("0.0.0.0", 0))?;
    UdpTransport::from_sockets(socket_rx, socket_tx, peer)
  }

  /// Mit bereits gebundenen Sockets
  pub fn from_sockets(
    socket_rx: UdpSocket, socket_tx: UdpSocket, peer: SocketAddr,
  ) -> Result<UdpTransport, TransportError> {
    socket_rx.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    Ok(UdpTransport {
      socket_rx,
      socket_tx,
      peer,
      pending: VecDeque::new(),
    })
  }
}

impl FrameTransport for UdpTransport {
  fn receive_frame(&mut self) -> Result<Frame, TransportError> {
    if self.pending.is_empty() {
      let mut buffer = [0; MAX_DATAGRAM];
      let (size, from) = self.socket_rx.recv_from(&mut buffer).map_err(io_error)?;
      debug!("UDP {} Bytes von {}", size, from);
      self.pending.extend(frames_from_datagram(&buffer[..size]));
    }
    match self.pending.pop_front() {
      Some(result) => Ok(result?),
      //Leeres Datagramm
      None => Err(TransportError::TimedOut),
    }
  }

  fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
    self
      .socket_tx
      .send_to(&frame.encode(), self.peer)
      .map_err(io_error)?;
    Ok(())
  }

  fn name(&self) -> String {
    format!("UDP {}", self.peer)
  }
}
