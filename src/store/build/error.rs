//! Error taxonomy for the builder, plus the wire format used to ship errors
//! from the sandbox child back to the controller over the pseudoterminal.

use crate::prelude::*;
use std::io::{self, Read};
use std::os::unix::prelude::RawFd;
use thiserror::Error;

/// Anything that marks the build itself as failed: missing outputs, ownership
/// violations, reference cycles, policy violations.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BuildError(pub String);

impl BuildError {
  pub fn new(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Self(msg.into()))
  }
}

/// A `--check` rebuild produced different output. Classified separately from
/// ordinary build failures.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NotDeterministic(pub String);

impl NotDeterministic {
  pub fn new(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Self(msg.into()))
  }
}

/// A spawned hook or helper program exited abnormally. Logged, not fatal.
#[derive(Debug, Error)]
#[error("program '{program}' exited with status {status}")]
pub struct ExecError {
  pub program: String,
  pub status: i32,
}

/// Cooperative cancellation. Propagates out of the build; daemon workers
/// swallow it.
#[derive(Debug, Error)]
#[error("interrupted by the user")]
pub struct Interrupted;

/// Leading byte of an error frame on the setup channel.
pub const CHILD_ERROR: u8 = 1;
/// Leading byte of the "environment ready" frame.
pub const CHILD_READY: u8 = 2;

/// Send an error to the parent: a `\1` line, then a length-delimited message.
/// Only ever called from the sandbox child, where stderr is the pty slave.
pub fn send_child_error(fd: RawFd, err: &anyhow::Error) {
  let msg = format!("{:#}", err);
  let mut frame = vec![CHILD_ERROR, b'\n'];
  frame.extend_from_slice(&(msg.len() as u64).to_le_bytes());
  frame.extend_from_slice(msg.as_bytes());
  let mut rest = &frame[..];
  while !rest.is_empty() {
    match nix::unistd::write(fd, rest) {
      Ok(n) => rest = &rest[n..],
      Err(_) => break,
    }
  }
}

/// A non-owning reader over a raw file descriptor.
pub(crate) struct FdSource(pub RawFd);

impl Read for FdSource {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    nix::unistd::read(self.0, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
  }
}

/// Decode the error frame following a `\1` line.
pub fn read_child_error<R: Read>(reader: &mut R) -> Result<anyhow::Error> {
  let mut len_buf = [0u8; 8];
  reader.read_exact(&mut len_buf)?;
  let len = u64::from_le_bytes(len_buf);
  ensure!(len < 1 << 20, "unreasonably large error message from child");
  let mut msg = vec![0u8; len as usize];
  reader.read_exact(&mut msg)?;
  Ok(anyhow!("{}", String::from_utf8_lossy(&msg)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{BufRead, BufReader, Write};

  #[test]
  fn child_error_roundtrip() {
    let (mut read, mut write) = crate::util::pipe::new().unwrap();
    let err = BuildError::new("mount failed");
    send_child_error(write.as_raw_fd(), &err);
    drop(write);

    let mut reader = BufReader::new(&mut read);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.as_bytes()[0], CHILD_ERROR);
    let received = read_child_error(&mut reader).unwrap();
    assert_eq!(received.to_string(), "mount failed");
  }

  #[test]
  fn downcasts_survive_anyhow() {
    let e = NotDeterministic::new("output differs");
    assert!(e.downcast_ref::<NotDeterministic>().is_some());
    assert!(e.downcast_ref::<BuildError>().is_none());

    let e = BuildError::new("cycle detected");
    assert!(e.downcast_ref::<BuildError>().is_some());
  }

  #[test]
  fn ready_frame_is_distinct() {
    let mut buf = vec![];
    buf.write_all(&[CHILD_READY, b'\n']).unwrap();
    assert_ne!(buf[0], CHILD_ERROR);
  }
}
