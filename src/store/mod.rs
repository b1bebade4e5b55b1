use crate::nar::PathFilter;
use crate::prelude::*;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

pub mod build;
pub mod derivation;
pub mod lock;
pub mod path;
pub mod path_info;
pub mod refs;
pub mod settings;
#[cfg(test)]
pub mod test;

pub use derivation::{Derivation, DerivationOptions, DerivationType, Output};
pub use path_info::{DrvOutput, Realisation, ValidPathInfo};
pub use self::path::Path as StorePath;

pub type PathSet = BTreeSet<String>;
pub type StorePathSet = BTreeSet<StorePath>;

/// The narrow contract the builder needs from the surrounding store
/// implementation. Path parsing and naming have default implementations; the
/// persistence operations are left to the implementor.
pub trait Store: Send + Sync {
  /// The logical store prefix, e.g. `/kiln/store`.
  fn store_path(&self) -> &Path;

  /// Where the store is physically mounted. Differs from `store_path` for
  /// diverted stores, which forces sandboxing so the builder sees the
  /// logical location.
  fn real_store_dir(&self) -> PathBuf {
    self.store_path().to_path_buf()
  }

  fn parse_store_path(&self, path: &Path) -> Result<StorePath> {
    if path.parent() != Some(self.store_path()) {
      bail!(
        "path `{}' is not a direct descendant of the store",
        path.display()
      );
    }

    StorePath::from_base_name(
      path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or_else(|| anyhow!("invalid filepath"))?,
    )
  }

  /// Parse a path that may point below a store path; returns the store path
  /// and the remainder.
  fn to_store_path(&self, path: &Path) -> Result<(StorePath, PathBuf)> {
    let rel = path
      .strip_prefix(self.store_path())
      .with_context(|| format!("path `{}' is not in the store", path.display()))?;
    let mut comps = rel.components();
    let base = comps
      .next()
      .ok_or_else(|| anyhow!("path `{}' is the store root", path.display()))?;
    Ok((
      StorePath::from_base_name(
        base
          .as_os_str()
          .to_str()
          .ok_or_else(|| anyhow!("invalid filepath"))?,
      )?,
      comps.as_path().to_path_buf(),
    ))
  }

  fn print_store_path(&self, path: &StorePath) -> String {
    self.store_path().join(path.to_string()).display().to_string()
  }

  fn to_real_path(&self, path: &StorePath) -> PathBuf {
    self.real_store_dir().join(path.to_string())
  }

  fn is_in_store(&self, path: &Path) -> bool {
    path.starts_with(self.store_path())
  }

  fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
    self.query_path_info(path).map(|x| x.is_some())
  }

  /// Add `path` and everything it transitively references to `closure`.
  fn compute_fs_closure(&self, path: &StorePath, closure: &mut StorePathSet) -> Result<()>;

  fn make_store_path(&self, path_type: &str, hash: Hash, name: &str) -> Result<StorePath> {
    let ident = format!(
      "{}:{}:{}:{}",
      path_type,
      hash.encode_with_type(Encoding::Base16),
      self.store_path().display(),
      name
    );
    let hash = Hash::hash(&ident, HashType::SHA256).truncate(20).into_owned();
    StorePath::from_parts(hash.as_bytes(), name)
  }

  fn make_output_path(&self, id: &str, hash: Hash, name: &str) -> Result<StorePath> {
    if id == "out" {
      self.make_store_path(&format!("output:{}", id), hash, name)
    } else {
      self.make_store_path(&format!("output:{}", id), hash, &format!("{}-{}", name, id))
    }
  }

  fn make_fixed_output_path(
    &self,
    method: FileIngestionMethod,
    hash: Hash,
    name: &str,
    refs: &StorePathSet,
    self_referential: bool,
  ) -> Result<StorePath> {
    if hash.ty() == HashType::SHA256 && method == FileIngestionMethod::Recursive {
      self.make_store_path(
        &make_type(self, "source".into(), refs, self_referential),
        hash,
        name,
      )
    } else {
      ensure!(
        refs.is_empty(),
        "fixed-output paths with references may only be recursive SHA256"
      );
      self.make_store_path(
        "output:out",
        Hash::hash(
          format!(
            "fixed:out:{prefix}:{hash}:",
            prefix = method.prefix(),
            hash = hash.encode_with_type(Encoding::Base16)
          ),
          HashType::SHA256,
        ),
        name,
      )
    }
  }

  fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>>;

  fn get_path_info(&self, path: &StorePath) -> Result<ValidPathInfo> {
    self
      .query_path_info(path)?
      .ok_or_else(|| anyhow!("path {} is not valid", self.print_store_path(path)))
  }

  /// Register path metadata transactionally. All references of every entry
  /// must themselves be valid or part of the same batch.
  fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<()>;

  fn register_valid_path(&self, info: ValidPathInfo) -> Result<()> {
    self.register_valid_paths(vec![info])
  }

  /// Attach local trust signatures to freshly built path metadata.
  fn sign_path_info(&self, _info: &mut ValidPathInfo) -> Result<()> {
    Ok(())
  }

  fn sign_realisation(&self, _realisation: &mut Realisation) -> Result<()> {
    Ok(())
  }

  /// Persist the mapping from a derivation output id to its realisation.
  fn register_drv_output(&self, realisation: &Realisation) -> Result<()>;

  /// Import a NAR dump produced elsewhere under the given metadata.
  fn add_to_store(&self, path_info: ValidPathInfo, source: Box<dyn Read>, repair: Repair)
    -> Result<()>;

  /// Ingest a tree (or flat file) dump, content-addressing it.
  fn add_dump_to_store(
    &self,
    source: Box<dyn Read>,
    name: &str,
    method: FileIngestionMethod,
    algo: HashType,
    repair: Repair,
  ) -> Result<StorePath>;

  fn add_path_to_store(
    &self,
    name: &str,
    path: &Path,
    method: FileIngestionMethod,
    algo: HashType,
    filter: &PathFilter,
    repair: Repair,
  ) -> Result<StorePath> {
    crossbeam::scope(|s| {
      let (read_side, mut write_side) = crate::util::pipe::new()?;

      let hdl = s.spawn::<_, Result<()>>(move |_| {
        if method == FileIngestionMethod::Recursive {
          crate::nar::dump_path(path, &mut write_side, filter)?;
        } else {
          let mut file = std::fs::File::open(path)?;
          std::io::copy(&mut file, &mut write_side)?;
        }
        Ok(())
      });

      let store_path = self.add_dump_to_store(Box::new(read_side), name, method, algo, repair)?;
      hdl.join().unwrap()?;
      Ok(store_path)
    })
    .unwrap()
  }

  /// The validity registration format consumed by `exportReferencesGraph`
  /// users: path, deriver, reference count, references, repeated.
  fn make_validity_registration(&self, paths: &StorePathSet) -> Result<String> {
    let mut s = String::new();
    for path in paths {
      let info = self.get_path_info(path)?;
      s.push_str(&self.print_store_path(path));
      s.push('\n');
      s.push_str(
        &info
          .deriver
          .as_ref()
          .map_or_else(String::new, |d| self.print_store_path(d)),
      );
      s.push('\n');
      s.push_str(&info.refs.len().to_string());
      s.push('\n');
      for r in &info.refs {
        s.push_str(&self.print_store_path(r));
        s.push('\n');
      }
    }
    Ok(s)
  }

  fn log_file_of(&self, path: &StorePath) -> PathBuf;
}

fn make_type<S: Store + ?Sized>(
  store: &S,
  mut ty: String,
  refs: &StorePathSet,
  self_referential: bool,
) -> String {
  for r in refs {
    ty.push(':');
    ty.push_str(&store.print_store_path(r));
  }
  if self_referential {
    ty.push_str(":self");
  }
  ty
}
