use crate::prelude::*;
use crate::store::StorePathSet;
use std::time::SystemTime;

/// A content address: how an output's store path was derived from its
/// contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentAddress {
  pub method: FileIngestionMethod,
  pub hash: Hash,
}

impl ContentAddress {
  pub fn print(&self) -> String {
    format!(
      "fixed:{}{}",
      self.method.prefix(),
      self.hash.encode_with_type(Encoding::Base32)
    )
  }
}

#[derive(Debug, Clone)]
pub struct ValidPathInfo {
  pub path: StorePath,
  pub deriver: Option<StorePath>,
  pub nar_hash: Hash,
  pub nar_size: Option<u64>,
  pub refs: StorePathSet,
  pub registration_time: Option<SystemTime>,
  pub ultimate: bool,
  pub sigs: Vec<String>,
  pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
  pub fn new(path: StorePath, nar_hash: Hash) -> Self {
    Self {
      path,
      nar_hash,
      deriver: None,
      nar_size: None,
      refs: Default::default(),
      registration_time: None,
      ultimate: false,
      sigs: vec![],
      ca: None,
    }
  }
}

impl PartialEq for ValidPathInfo {
  fn eq(&self, other: &Self) -> bool {
    self.path == other.path && self.nar_hash == other.nar_hash && self.refs == other.refs
  }
}

impl Eq for ValidPathInfo {}

/// Identity of one output slot of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
  pub drv_hash: String,
  pub output_name: String,
}

impl DrvOutput {
  pub fn print(&self) -> String {
    format!("{}!{}", self.drv_hash, self.output_name)
  }
}

/// The realisation of one derivation output: which store path it resolved to,
/// plus any trust signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realisation {
  pub id: DrvOutput,
  pub out_path: StorePath,
  pub signatures: Vec<String>,
}
