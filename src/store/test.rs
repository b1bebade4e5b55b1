//! An in-memory store used by the unit tests. Paths live in a throwaway
//! directory; metadata lives in a mutex-guarded map.

use super::*;
use crate::hash::Sink as HashSink;
use crate::nar;
use crate::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

pub struct TestStore {
  dir: tempfile::TempDir,
  store: PathBuf,
  infos: Mutex<HashMap<StorePath, ValidPathInfo>>,
  realisations: Mutex<HashMap<DrvOutput, StorePath>>,
}

impl TestStore {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().expect("unable to create test store");
    let store = dir.path().join("store");
    std::fs::create_dir_all(&store).unwrap();
    Self {
      dir,
      store,
      infos: Default::default(),
      realisations: Default::default(),
    }
  }

  pub fn registered_realisation(&self, id: &DrvOutput) -> Option<StorePath> {
    self.realisations.lock().get(id).cloned()
  }

  /// Write raw bytes directly into the store directory, registering nothing.
  /// Lets tests fabricate inputs.
  pub fn install_file(&self, path: &StorePath, contents: &str) -> PathBuf {
    let real = self.to_real_path(path);
    std::fs::write(&real, contents).unwrap();
    real
  }

  pub fn register_input(&self, path: &StorePath, refs: StorePathSet) {
    let mut info = ValidPathInfo::new(
      path.clone(),
      Hash::hash(self.print_store_path(path), HashType::SHA256),
    );
    info.refs = refs;
    self.infos.lock().insert(path.clone(), info);
  }
}

impl Store for TestStore {
  fn store_path(&self) -> &Path {
    &self.store
  }

  fn compute_fs_closure(&self, path: &StorePath, closure: &mut StorePathSet) -> Result<()> {
    if !closure.insert(path.clone()) {
      return Ok(());
    }
    let refs = self
      .infos
      .lock()
      .get(path)
      .map(|i| i.refs.clone())
      .unwrap_or_default();
    for r in refs {
      if r != *path {
        self.compute_fs_closure(&r, closure)?;
      }
    }
    Ok(())
  }

  fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
    Ok(self.infos.lock().get(path).cloned())
  }

  fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<()> {
    let mut lock = self.infos.lock();
    for info in infos {
      lock.insert(info.path.clone(), info);
    }
    Ok(())
  }

  fn register_drv_output(&self, realisation: &Realisation) -> Result<()> {
    self
      .realisations
      .lock()
      .insert(realisation.id.clone(), realisation.out_path.clone());
    Ok(())
  }

  fn add_to_store(
    &self,
    path_info: ValidPathInfo,
    source: Box<dyn Read>,
    _repair: Repair,
  ) -> Result<()> {
    if !self.is_valid_path(&path_info.path)? {
      let real_path = self.to_real_path(&path_info.path);
      rm_rf::ensure_removed(&real_path)?;

      let mut nar_hasher = HashSink::new(HashType::SHA256, std::io::sink());
      let combined = tee_readwrite::TeeReader::new(source, &mut nar_hasher, false);

      nar::restore_path(&real_path, combined)?;

      let (_, hash_result, hash_len) = nar_hasher.finish();

      if hash_result != path_info.nar_hash {
        bail!(
          "hash mismatch while importing path `{}'",
          real_path.display()
        );
      }
      if hash_len as u64 != path_info.nar_size.unwrap_or(0) {
        bail!(
          "size mismatch while importing path `{}'",
          real_path.display()
        );
      }

      self.register_valid_path(path_info)?;
    }
    Ok(())
  }

  fn add_dump_to_store(
    &self,
    source: Box<dyn Read>,
    name: &str,
    method: FileIngestionMethod,
    algo: HashType,
    _repair: Repair,
  ) -> Result<StorePath> {
    let mut hash_sink = HashSink::new(algo, std::io::sink());
    let mut hashing_source = tee_readwrite::TeeReader::new(source, &mut hash_sink, false);

    let dump_root = tempfile::tempdir_in(self.dir.path())?;
    let dump_to = dump_root.path().join("x");

    if method == FileIngestionMethod::Recursive {
      nar::restore_path(&dump_to, hashing_source)?
    } else {
      let mut new_file = File::create(&dump_to)?;
      std::io::copy(&mut hashing_source, &mut new_file)?;
    }

    let (_, hash, _) = hash_sink.finish();

    let dst_path = self.make_fixed_output_path(method, hash, name, &Default::default(), false)?;

    if !self.is_valid_path(&dst_path)? {
      let real_path = self.to_real_path(&dst_path);
      rm_rf::ensure_removed(&real_path)?;
      std::fs::rename(&dump_to, &real_path)?;

      let mut nar_sink = HashSink::new(HashType::SHA256, std::io::sink());
      nar::dump_path(&real_path, &mut nar_sink, &nar::PathFilter::none())?;
      let (_, nar_hash, nar_size) = nar_sink.finish();

      let mut info = ValidPathInfo::new(dst_path.clone(), nar_hash);
      info.nar_size = Some(nar_size as u64);
      info.ca = Some(path_info::ContentAddress { method, hash });
      self.register_valid_path(info)?;
    }

    Ok(dst_path)
  }

  fn log_file_of(&self, path: &StorePath) -> PathBuf {
    self
      .dir
      .path()
      .join("log")
      .join(format!("{}.log", path.hash_part()))
  }
}
