use super::{Hash, HashType};
use crypto::digest::Digest;
use crypto::md5::Md5;
use crypto::sha1::Sha1;
use crypto::sha2::{Sha256, Sha512};

/// Incremental digest state. Tracks how many bytes have been fed in, which
/// callers use for NAR sizes.
pub struct Context {
  digest: Box<dyn Digest + Send>,
  ty: HashType,
  len: usize,
}

impl Context {
  pub fn new(ty: HashType) -> Self {
    let digest: Box<dyn Digest + Send> = match ty {
      HashType::MD5 => Box::new(Md5::new()),
      HashType::SHA1 => Box::new(Sha1::new()),
      HashType::SHA256 => Box::new(Sha256::new()),
      HashType::SHA512 => Box::new(Sha512::new()),
    };
    Self { digest, ty, len: 0 }
  }

  pub fn input(&mut self, bytes: &[u8]) {
    self.len += bytes.len();
    self.digest.input(bytes);
  }

  pub fn finish(mut self) -> (Hash, usize) {
    let mut data = [0u8; 64];
    let out_len = self.digest.output_bytes();
    self.digest.result(&mut data[..out_len]);
    (
      Hash {
        data,
        len: out_len,
        ty: self.ty,
      },
      self.len,
    )
  }
}
