use super::{Context, Hash, HashType};
use std::io::{self, Write};

/// A writer that hashes everything passing through it.
pub struct Sink<W> {
  c: Context,
  writer: W,
}

impl<W> Sink<W> {
  pub fn new(ty: HashType, writer: W) -> Self {
    Self {
      c: Context::new(ty),
      writer,
    }
  }

  pub fn finish(self) -> (W, Hash, usize) {
    let (hash, len) = self.c.finish();
    (self.writer, hash, len)
  }
}

impl<W: Write> Write for Sink<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.c.input(buf);
    self.writer.write_all(buf)?;
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.writer.flush()
  }
}
