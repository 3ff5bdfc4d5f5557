//! Gemeinsame Definitionen aller Frame Transporte (UDP, TCP, Seriell, CAN)

use std::{
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{Receiver, TryRecvError},
  },
  time::Duration,
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
  mcp_dispatcher::Dispatcher,
  mcp_frame::{Frame, FramingError},
};

/// Maximale Wartezeit eines Empfangs, danach wird das Run Flag geprüft
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("Verbindung geschlossen")]
  Closed,
  #[error("Timeout")]
  TimedOut,
  #[error("Ungültiger Frame: {0}")]
  Framing(#[from] FramingError),
  #[error("IO Fehler: {0}")]
  Io(#[from] io::Error),
}

/// Timeouts und Verbindungsende aus io Fehlern erkennen
pub fn io_error(err: io::Error) -> TransportError {
  match err.kind() {
    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
      TransportError::TimedOut
    }
    io::ErrorKind::UnexpectedEof
    | io::ErrorKind::ConnectionReset
    | io::ErrorKind::ConnectionAborted
    | io::ErrorKind::BrokenPipe => TransportError::Closed,
    _ => TransportError::Io(err),
  }
}

/// Schnittstelle die alle Transporte implementieren
pub trait FrameTransport: Send {
  /// Nächster Frame, blockiert maximal RECEIVE_TIMEOUT, danach TransportError::TimedOut
  fn receive_frame(&mut self) -> Result<Frame, TransportError>;
  fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError>;
  /// Bezeichnung für Logausgaben
  fn name(&self) -> String;
}

/// Empfangsschleife einer Verbindung.
/// Läuft bis das Run Flag gelöscht wird oder die Verbindung einen Fehler meldet.
/// # Arguments
/// * transport - Die Verbindung
/// * dispatcher - Auswertung der empfangenen Frames
/// * outgoing - Frames anderer Threads die auf dieser Verbindung gesendet werden sollen
/// * run - false -> Ende
/// * forward - Wird mit jedem gültigen empfangenen Frame aufgerufen
pub fn run_receiver(
  transport: &mut dyn FrameTransport, dispatcher: &mut Dispatcher, outgoing: &Receiver<Frame>,
  run: &AtomicBool, mut forward: impl FnMut(&Frame),
) -> Result<(), TransportError> {
  let name = transport.name();
  info!("{}: Empfang gestartet", name);
  while run.load(Ordering::SeqCst) {
    loop {
      match outgoing.try_recv() {
        Ok(frame) => {
          trace!("{} -> {}", name, frame.to_hex());
          transport.send_frame(&frame)?;
        }
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
      }
    }
    match transport.receive_frame() {
      Ok(frame) => {
        forward(&frame);
        for reply in dispatcher.dispatch(&frame) {
          trace!("{} -> {}", name, reply.to_hex());
          transport.send_frame(&reply)?;
        }
      }
      Err(TransportError::TimedOut) => {}
      Err(TransportError::Framing(err)) => debug!("{}: {}", name, err),
      Err(err) => {
        warn!("{}: Verbindung beendet: {}", name, err);
        return Err(err);
      }
    }
  }
  info!("{}: Empfang beendet", name);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    layout_world::Layout,
    mcp_dispatcher::NodeIdentity,
    mcp_frame::McpCommand,
  };
  use std::{
    collections::VecDeque,
    sync::{mpsc, Arc},
  };

  /// Liefert vorgegebene Frames, danach Closed
  struct MockTransport {
    incoming: VecDeque<Result<Frame, TransportError>>,
    sent: Vec<Frame>,
  }

  impl FrameTransport for MockTransport {
    fn receive_frame(&mut self) -> Result<Frame, TransportError> {
      self.incoming.pop_front().unwrap_or(Err(TransportError::Closed))
    }
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
      self.sent.push(*frame);
      Ok(())
    }
    fn name(&self) -> String {
      "mock".to_string()
    }
  }

  fn dispatcher() -> Dispatcher {
    Dispatcher::new(
      "mock",
      Arc::new(NodeIdentity::new(0x1234_5678)),
      Arc::new(Layout::new()),
    )
  }

  #[test]
  fn run_receiver_test() {
    let ping = Frame::new(McpCommand::Ping, false, 0x4711, &[]).unwrap();
    let mut transport = MockTransport {
      incoming: VecDeque::from(vec![
        Err(TransportError::TimedOut),
        Err(TransportError::Framing(FramingError::InvalidLength { length: 9 })),
        Ok(ping),
      ]),
      sent: Vec::new(),
    };
    let (tx, rx) = mpsc::channel();
    let outgoing = Frame::new(McpCommand::LocoSpeed, false, 0x4711, &[0, 0, 0, 1, 0, 0]).unwrap();
    tx.send(outgoing).unwrap();
    let mut forwarded = Vec::new();
    let result = run_receiver(
      &mut transport,
      &mut dispatcher(),
      &rx,
      &AtomicBool::new(true),
      |frame| forwarded.push(*frame),
    );
    assert!(matches!(result, Err(TransportError::Closed)));
    assert_eq!(forwarded, vec![ping]);
    assert_eq!(transport.sent.len(), 2);
    assert_eq!(transport.sent[0], outgoing);
    assert_eq!(transport.sent[1].payload_u32(0), 0x1234_5678);
  }

  #[test]
  fn run_flag_test() {
    let mut transport = MockTransport {
      incoming: VecDeque::new(),
      sent: Vec::new(),
    };
    let (_tx, rx) = mpsc::channel();
    let result = run_receiver(
      &mut transport,
      &mut dispatcher(),
      &rx,
      &AtomicBool::new(false),
      |_| {},
    );
    assert!(result.is_ok());
  }

  #[test]
  fn io_error_test() {
    assert!(matches!(
      io_error(io::Error::from(io::ErrorKind::WouldBlock)),
      TransportError::TimedOut
    ));
    assert!(matches!(
      io_error(io::Error::from(io::ErrorKind::UnexpectedEof)),
      TransportError::Closed
    ));
    assert!(matches!(
      io_error(io::Error::from(io::ErrorKind::PermissionDenied)),
      TransportError::Io(_)
    ));
  }
}
