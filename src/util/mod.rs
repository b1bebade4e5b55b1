pub mod pipe;

pub trait SliceExt<T> {
  fn take(&self, n: usize) -> &Self;
}

impl<T> SliceExt<T> for [T] {
  fn take(&self, n: usize) -> &Self {
    &self[0..std::cmp::min(n, self.len())]
  }
}
