//! Reference scanning and hash rewriting over NAR streams.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::Path;

use slog_scope::debug;

use crate::base32::IS_BASE32;
use crate::hash::{Hash, HashType, Sink as HashSink};
use crate::nar;
use crate::prelude::*;
use crate::store::StorePathSet;
use crate::util::SliceExt;

const REF_LEN: usize = 32;

#[derive(Default)]
struct RefScanner {
  hashes: HashSet<Vec<u8>>,
  seen: HashSet<Vec<u8>>,
  tail: Vec<u8>,
}

impl Write for RefScanner {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.tail.extend(buf.take(REF_LEN));
    search(&self.tail, &mut self.hashes, &mut self.seen);
    search(buf, &mut self.hashes, &mut self.seen);

    let tail_len = if buf.len() <= REF_LEN {
      buf.len()
    } else {
      REF_LEN
    };
    let sub_start = if self.tail.len() < REF_LEN - tail_len {
      0
    } else {
      self.tail.len() - (REF_LEN - tail_len)
    };
    self.tail = self.tail.split_off(sub_start);
    self.tail.extend(&buf[buf.len() - tail_len..]);

    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn search(data: &[u8], hashes: &mut HashSet<Vec<u8>>, seen: &mut HashSet<Vec<u8>>) {
  let len = data.len();

  let mut i = 0;
  while i + REF_LEN <= len {
    let mut matched = true;
    let mut j = REF_LEN - 1;
    while j > 0 {
      if !IS_BASE32[data[i + j] as usize] {
        i += j + 1;
        matched = false;
        break;
      }
      j -= 1;
    }
    if !matched {
      continue;
    }
    let maybe_ref = &data[i..i + REF_LEN];
    if hashes.remove(maybe_ref) {
      debug!(
        "found reference to {} at {}",
        String::from_utf8_lossy(maybe_ref),
        i
      );
      seen.insert(maybe_ref.to_vec());
    }
    i += 1;
  }
}

/// Serialise `path` and search the stream for the hash part of any of `refs`.
/// Returns the subset that actually occurred.
pub fn scan_for_references<P: AsRef<Path>>(path: P, refs: &StorePathSet) -> Result<StorePathSet> {
  let mut s = RefScanner::default();
  let mut back_map = HashMap::new();

  for r in refs {
    s.hashes.insert(r.hash_part().into_bytes());
    back_map.insert(r.hash_part().into_bytes(), r.clone());
  }

  nar::dump_path(path, &mut s, &nar::PathFilter::none())?;

  let mut found = StorePathSet::new();
  for h in s.seen {
    found.insert(back_map.remove(&h).expect("item missing from back map"));
  }

  Ok(found)
}

/// A writer that replaces occurrences of byte strings on the fly, buffering
/// just enough to catch matches straddling write boundaries. Match positions
/// are recorded for hash-modulo computation.
pub struct RewritingSink<W> {
  rewrites: Vec<(Vec<u8>, Vec<u8>)>,
  max_from: usize,
  tail: Vec<u8>,
  pos: u64,
  pub matches: Vec<u64>,
  inner: W,
}

impl<W: Write> RewritingSink<W> {
  pub fn new(rewrites: &HashMap<String, String>, inner: W) -> Self {
    let rewrites: Vec<(Vec<u8>, Vec<u8>)> = rewrites
      .iter()
      .filter(|(f, t)| f != t)
      .map(|(f, t)| (f.clone().into_bytes(), t.clone().into_bytes()))
      .collect();
    let max_from = rewrites.iter().map(|(f, _)| f.len()).max().unwrap_or(0);
    Self {
      rewrites,
      max_from,
      tail: vec![],
      pos: 0,
      matches: vec![],
      inner,
    }
  }

  pub fn single(from: &str, to: &str, inner: W) -> Self {
    let mut map = HashMap::new();
    map.insert(from.to_string(), to.to_string());
    Self::new(&map, inner)
  }

  fn feed(&mut self, data: &[u8]) -> io::Result<()> {
    if self.rewrites.is_empty() {
      self.pos += data.len() as u64;
      return self.inner.write_all(data);
    }

    let mut s = std::mem::take(&mut self.tail);
    s.extend_from_slice(data);

    let mut j = 0;
    'scan: while j < s.len() {
      for (from, to) in &self.rewrites {
        if s[j..].starts_with(from) {
          self.matches.push(self.pos + j as u64);
          s.splice(j..j + from.len(), to.iter().copied());
          j += to.len();
          continue 'scan;
        }
      }
      j += 1;
    }

    // hold back enough bytes for a match crossing the next boundary
    let keep = if s.len() + 1 >= self.max_from {
      self.max_from - 1
    } else {
      s.len()
    };
    self.tail = s.split_off(s.len() - keep);
    self.pos += s.len() as u64;
    self.inner.write_all(&s)
  }

  pub fn into_inner(mut self) -> io::Result<W> {
    let tail = std::mem::take(&mut self.tail);
    self.pos += tail.len() as u64;
    self.inner.write_all(&tail)?;
    Ok(self.inner)
  }
}

impl<W: Write> Write for RewritingSink<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.feed(buf)?;
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

/// Hashes a stream modulo occurrences of `modulus`. The match positions are
/// folded into the digest so that a stream with self-references and one with
/// them already blanked cannot collide.
pub struct HashModuloSink {
  rewriter: RewritingSink<HashSink<io::Sink>>,
  total: usize,
}

impl HashModuloSink {
  pub fn new(ty: HashType, modulus: &str) -> Self {
    Self {
      rewriter: RewritingSink::single(modulus, "", HashSink::new(ty, io::sink())),
      total: 0,
    }
  }

  pub fn finish(self) -> Result<(Hash, usize)> {
    let matches = self.rewriter.matches.clone();
    let mut hasher = self.rewriter.into_inner()?;
    for pos in matches {
      hasher.write_all(format!("|{}", pos).as_bytes())?;
    }
    let (_, hash, _) = hasher.finish();
    Ok((hash, self.total))
  }
}

impl Write for HashModuloSink {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.total += buf.len();
    self.rewriter.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.rewriter.flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  fn fake_path(seed: &str, name: &str) -> StorePath {
    let h = Hash::hash(seed, HashType::SHA256);
    StorePath::from_parts(&h.as_bytes()[..20], name).unwrap()
  }

  #[test]
  fn scanner_finds_embedded_hashes() {
    let dep = fake_path("dep", "libdep");
    let unused = fake_path("unused", "libunused");

    let dir = tempfile::tempdir().unwrap();
    fs::write(
      dir.path().join("f"),
      format!("link against /kiln/store/{}/lib\n", dep),
    )
    .unwrap();

    let mut refs = StorePathSet::new();
    refs.insert(dep.clone());
    refs.insert(unused.clone());

    let found = scan_for_references(dir.path(), &refs).unwrap();
    assert!(found.contains(&dep));
    assert!(!found.contains(&unused));
  }

  #[test]
  fn scanner_catches_split_hashes() {
    // a reference split across the scanner's internal 32-byte boundary
    let dep = fake_path("dep", "libdep");
    let hash = dep.hash_part();

    let mut s = RefScanner::default();
    s.hashes.insert(hash.clone().into_bytes());
    s.write_all(&hash.as_bytes()[..10]).unwrap();
    s.write_all(&hash.as_bytes()[10..]).unwrap();
    assert_eq!(s.seen.len(), 1);
  }

  #[test]
  fn rewriting_is_length_preserving() {
    let from = fake_path("a", "x").hash_part();
    let to = fake_path("b", "x").hash_part();
    assert_eq!(from.len(), to.len());

    let mut rewrites = HashMap::new();
    rewrites.insert(from.clone(), to.clone());

    let input = format!("prefix {} middle {} suffix", from, from);
    let mut sink = RewritingSink::new(&rewrites, vec![]);
    // drip-feed to exercise boundary buffering
    for chunk in input.as_bytes().chunks(7) {
      sink.write_all(chunk).unwrap();
    }
    let out = sink.into_inner().unwrap();
    assert_eq!(out.len(), input.len());
    assert_eq!(
      String::from_utf8(out).unwrap(),
      format!("prefix {} middle {} suffix", to, to)
    );
  }

  #[test]
  fn hash_modulo_ignores_self_hash() {
    let this = fake_path("self", "x").hash_part();

    let mut a = HashModuloSink::new(HashType::SHA256, &this);
    a.write_all(format!("see {} here", this).as_bytes()).unwrap();
    let (ha, _) = a.finish().unwrap();

    let other = fake_path("other", "x").hash_part();
    let mut b = HashModuloSink::new(HashType::SHA256, &other);
    b.write_all(format!("see {} here", other).as_bytes())
      .unwrap();
    let (hb, _) = b.finish().unwrap();

    assert_eq!(ha, hb);
  }

  #[test]
  fn hash_modulo_distinguishes_positions() {
    let this = fake_path("self", "x").hash_part();

    let mut a = HashModuloSink::new(HashType::SHA256, &this);
    a.write_all(format!("{}xx", this).as_bytes()).unwrap();
    let (ha, _) = a.finish().unwrap();

    let mut b = HashModuloSink::new(HashType::SHA256, &this);
    b.write_all(format!("x{}x", this).as_bytes()).unwrap();
    let (hb, _) = b.finish().unwrap();

    assert_ne!(ha, hb);
  }
}
