pub use crate::hash::{Encoding, Hash, HashType, Sink as HashSink};
pub use crate::store::path::Path as StorePath;
pub use anyhow::{Context as _, Result};

use std::path::{Path, PathBuf};

pub fn break_str(s: &str, pattern: char) -> Option<(&str, &str)> {
  let ix = s.find(pattern)?;
  Some((&s[..ix], &s[ix + pattern.len_utf8()..]))
}

pub trait PathExt {
  /// Like `join`, but an absolute `other` does not replace `self`.
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf;
}

impl PathExt for Path {
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf {
    let other = other.as_ref();
    self.join(other.strip_prefix("/").unwrap_or(other))
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FileIngestionMethod {
  Flat,
  Recursive,
}

impl FileIngestionMethod {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Flat => "",
      Self::Recursive => "r:",
    }
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Repair {
  Off,
  On,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_break_str() {
    assert_eq!(break_str("target=source", '='), Some(("target", "source")));
    assert_eq!(break_str("target", '='), None);
    assert_eq!(break_str("=x", '='), Some(("", "x")));
  }

  #[test]
  fn test_append() {
    assert_eq!(
      Path::new("/chroot").append("/kiln/store"),
      PathBuf::from("/chroot/kiln/store")
    );
    assert_eq!(
      Path::new("/chroot").append("relative"),
      PathBuf::from("/chroot/relative")
    );
  }
}
