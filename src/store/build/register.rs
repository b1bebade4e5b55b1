//! Output registration: stat and canonicalise whatever the builder produced,
//! scan for references, order the outputs topologically, compute their final
//! hashes and paths, move them into place, and record them as valid.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::stat::{lstat, FileStat};
use nix::sys::time::{TimeSpec, TimeValLike};
use slog_scope::debug;

use super::chroot::chmod;
use super::error::{BuildError, NotDeterministic};
use super::hook;
use super::DerivationBuilder;
use crate::nar;
use crate::prelude::*;
use crate::store::derivation::{output_path_name, Output};
use crate::store::lock::PathLocks;
use crate::store::path_info::{ContentAddress, DrvOutput, Realisation, ValidPathInfo};
use crate::store::refs::{scan_for_references, HashModuloSink, RewritingSink};
use crate::store::settings::{settings, BuildMode};
use crate::store::StorePathSet;

/// Inodes already canonicalised during this registration pass. Shared across
/// outputs so hard links between them keep consistent metadata.
pub(crate) type InodesSeen = HashSet<(u64, u64)>;

const EPOCH_MTIME: i64 = 1;

fn is_executable(mode: u32) -> bool {
  mode & 0o100 != 0
}

fn canonicalise_one(
  path: &Path,
  uid_range: Option<(u32, u32)>,
  inodes_seen: &mut InodesSeen,
) -> Result<FileStat> {
  let st =
    lstat(path).with_context(|| format!("getting attributes of path '{}'", path.display()))?;

  let mode = st.st_mode as u32;
  let fmt = mode & libc::S_IFMT as u32;
  if fmt != libc::S_IFREG as u32 && fmt != libc::S_IFDIR as u32 && fmt != libc::S_IFLNK as u32 {
    return Err(BuildError::new(format!(
      "file '{}' has an unsupported type",
      path.display()
    )));
  }

  // hard-linked files only need fixing up once
  if st.st_nlink > 1 && !inodes_seen.insert((st.st_dev as u64, st.st_ino as u64)) {
    return Ok(st);
  }
  if st.st_nlink <= 1 {
    inodes_seen.insert((st.st_dev as u64, st.st_ino as u64));
  }

  if fmt != libc::S_IFLNK as u32 {
    let wanted = if is_executable(mode) { 0o555 } else { 0o444 };
    if mode & 0o7777 != wanted {
      chmod(path, wanted)?;
    }
  }

  if st.st_mtime != EPOCH_MTIME {
    let omit_atime = TimeSpec::from(libc::timespec {
      tv_sec: 0,
      tv_nsec: libc::UTIME_OMIT,
    });
    nix::sys::stat::utimensat(
      None,
      path,
      &omit_atime,
      &TimeSpec::seconds(EPOCH_MTIME),
      nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    )
    .with_context(|| format!("changing modification time of '{}'", path.display()))?;
  }

  if let Some((first, last)) = uid_range {
    let euid = nix::unistd::geteuid();
    if st.st_uid >= first && st.st_uid <= last {
      nix::unistd::fchownat(
        None,
        path,
        Some(euid),
        Some(nix::unistd::getegid()),
        nix::unistd::FchownatFlags::NoFollowSymlink,
      )
      .with_context(|| format!("changing ownership of '{}'", path.display()))?;
    } else if st.st_uid != euid.as_raw() {
      return Err(BuildError::new(format!(
        "invalid ownership on file '{}'",
        path.display()
      )));
    }
  }

  Ok(st)
}

/// Strip setuid/setgid bits, reset permissions to 0444/0555, and clamp the
/// modification time, over a whole tree.
pub(crate) fn canonicalise_path_metadata(
  path: &Path,
  uid_range: Option<(u32, u32)>,
  inodes_seen: &mut InodesSeen,
) -> Result<()> {
  let st = canonicalise_one(path, uid_range, inodes_seen)?;
  if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
    for entry in fs::read_dir(path)? {
      canonicalise_path_metadata(&entry?.path(), uid_range, inodes_seen)?;
    }
  }
  Ok(())
}

/// Move `src` to `dst`, temporarily making an unwritable directory writable
/// so its `..` entry can be updated.
pub(crate) fn move_path(src: &Path, dst: &Path) -> Result<()> {
  let mode = lstat(src)?.st_mode as u32;
  let change_perm = !nix::unistd::geteuid().is_root()
    && mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    && mode & 0o200 == 0;

  if change_perm {
    chmod(src, (mode & 0o7777) | 0o200)?;
  }
  fs::rename(src, dst)
    .with_context(|| format!("renaming '{}' to '{}'", src.display(), dst.display()))?;
  if change_perm {
    chmod(dst, mode & 0o7777)?;
  }
  Ok(())
}

/// Replace an existing valid path with a freshly built tree. The old tree is
/// moved aside first; if the second rename fails we try to put it back. The
/// window between the renames must never be interrupted.
pub(crate) fn replace_valid_path(store_path: &Path, tmp_path: &Path) -> Result<()> {
  let old_path = PathBuf::from(format!(
    "{}.old-{}",
    store_path.display(),
    nix::unistd::getpid()
  ));

  let had_old = store_path.exists();
  if had_old {
    move_path(store_path, &old_path)?;
  }

  if let Err(e) = move_path(tmp_path, store_path) {
    if had_old {
      let _ = move_path(&old_path, store_path);
    }
    return Err(e);
  }

  if had_old {
    let _ = rm_rf::ensure_removed(&old_path);
  }
  Ok(())
}

fn copy_path_recursive(src: &Path, dst: &Path) -> Result<()> {
  let meta = fs::symlink_metadata(src)?;
  if meta.file_type().is_dir() {
    fs::create_dir(dst)?;
    for entry in fs::read_dir(src)? {
      let entry = entry?;
      copy_path_recursive(&entry.path(), &dst.join(entry.file_name()))?;
    }
  } else if meta.file_type().is_symlink() {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
  } else {
    fs::copy(src, dst)?;
  }
  Ok(())
}

/// Order `items` so that everything an item references comes before it.
/// Deterministic for a given reference graph.
pub(crate) fn topo_sort<F, G>(
  items: &BTreeSet<String>,
  references: F,
  cycle_error: G,
) -> Result<Vec<String>>
where
  F: Fn(&str) -> BTreeSet<String>,
  G: Fn(&str, &str) -> anyhow::Error,
{
  #[derive(PartialEq)]
  enum Mark {
    Visiting,
    Done,
  }

  fn visit<F, G>(
    item: &str,
    parent: Option<&str>,
    items: &BTreeSet<String>,
    references: &F,
    cycle_error: &G,
    marks: &mut HashMap<String, Mark>,
    order: &mut Vec<String>,
  ) -> Result<()>
  where
    F: Fn(&str) -> BTreeSet<String>,
    G: Fn(&str, &str) -> anyhow::Error,
  {
    match marks.get(item) {
      Some(Mark::Done) => return Ok(()),
      Some(Mark::Visiting) => {
        return Err(cycle_error(item, parent.unwrap_or(item)));
      }
      None => {}
    }
    marks.insert(item.to_string(), Mark::Visiting);
    for child in references(item) {
      if items.contains(&child) && child != item {
        visit(&child, Some(item), items, references, cycle_error, marks, order)?;
      }
    }
    marks.insert(item.to_string(), Mark::Done);
    order.push(item.to_string());
    Ok(())
  }

  let mut marks = HashMap::new();
  let mut order = vec![];
  for item in items {
    visit(item, None, items, &references, &cycle_error, &mut marks, &mut order)?;
  }
  Ok(order)
}

/// References of one output before path finalisation.
#[derive(Debug, Clone)]
enum OutputRefs {
  /// Already valid in the store and not being checked; treated as a leaf.
  AlreadyRegistered(StorePath),
  PerhapsNeedToRegister(StorePathSet),
}

impl DerivationBuilder {
  fn uid_range(&self) -> Option<(u32, u32)> {
    self
      .build_user
      .as_ref()
      .map(|u| (u.uid().as_raw(), u.uid().as_raw() + u.uid_count() - 1))
  }

  /// Where a scratch output physically lives right now.
  fn to_real_path_chroot(&self, path: &StorePath) -> PathBuf {
    match &self.chroot_root {
      Some(root) if self.use_chroot && !self.needs_hash_rewrite() => {
        root.append(self.store.print_store_path(path))
      }
      _ => self.store.to_real_path(path),
    }
  }

  /// Stream `actual_path` through the rewriter and restore it in place.
  fn rewrite_output(
    &self,
    actual_path: &Path,
    rewrites: &HashMap<String, String>,
    inodes_seen: &mut InodesSeen,
  ) -> Result<()> {
    if rewrites.is_empty() {
      return Ok(());
    }
    debug!("rewriting hashes in '{}'", actual_path.display());

    let tmp_path = PathBuf::from(format!("{}.tmp", actual_path.display()));
    rm_rf::ensure_removed(&tmp_path)?;

    crossbeam::scope(|s| -> Result<()> {
      let (read_side, write_side) = crate::util::pipe::new()?;

      let dumper = s.spawn::<_, Result<()>>(|_| {
        let mut sink = RewritingSink::new(rewrites, write_side);
        nar::dump_path(actual_path, &mut sink, &nar::PathFilter::none())?;
        let mut inner = sink.into_inner()?;
        use std::io::Write;
        inner.flush()?;
        Ok(())
      });

      nar::restore_path(&tmp_path, read_side)?;
      dumper.join().unwrap()
    })
    .unwrap()?;

    rm_rf::ensure_removed(actual_path)?;
    move_path(&tmp_path, actual_path)?;

    // restore_path writes default permissions; fix them back up
    canonicalise_path_metadata(actual_path, None, inodes_seen)
  }

  /// Resolve scanned references through the output rewrite table, detecting
  /// an unrewritten self-reference on the way.
  fn rewrite_refs(
    &self,
    references: &StorePathSet,
    scratch_path: &StorePath,
  ) -> Result<(bool, StorePathSet)> {
    let mut self_ref = false;
    let mut others = StorePathSet::new();
    for r in references {
      if r == scratch_path {
        self_ref = true;
      } else if let Some(rewritten) = self.output_rewrites.get(&r.hash_part()) {
        others.insert(StorePath::from_base_name(format!(
          "{}-{}",
          rewritten,
          r.name()
        ))?);
      } else {
        others.insert(r.clone());
      }
    }
    Ok((self_ref, others))
  }

  /// Finalise a content-addressed output: hash it modulo its own scratch
  /// hash, derive the true store path, and rewrite self-references to it.
  #[allow(clippy::too_many_arguments)]
  fn new_info_from_ca(
    &mut self,
    output_name: &str,
    method: FileIngestionMethod,
    algo: HashType,
    actual_path: &Path,
    scratch_path: &StorePath,
    references: &StorePathSet,
    output_mode: u32,
    inodes_seen: &mut InodesSeen,
  ) -> Result<ValidPathInfo> {
    if method == FileIngestionMethod::Flat {
      let fmt = output_mode & libc::S_IFMT as u32;
      if fmt != libc::S_IFREG as u32 || is_executable(output_mode) {
        return Err(BuildError::new(format!(
          "output path '{}' should be a non-executable regular file since recursive hashing is \
           not enabled",
          actual_path.display()
        )));
      }
    }

    let rewrites = self.output_rewrites.clone();
    self.rewrite_output(actual_path, &rewrites, inodes_seen)?;

    let old_hash_part = scratch_path.hash_part();

    let mut ca_sink = HashModuloSink::new(algo, &old_hash_part);
    match method {
      FileIngestionMethod::Recursive => {
        nar::dump_path(actual_path, &mut ca_sink, &nar::PathFilter::none())?
      }
      FileIngestionMethod::Flat => {
        use std::io::Write;
        let mut f = fs::File::open(actual_path)?;
        std::io::copy(&mut f, &mut ca_sink)?;
        ca_sink.flush()?;
      }
    }
    let (got, _) = ca_sink.finish()?;

    let (self_ref, others) = self.rewrite_refs(references, scratch_path)?;

    let final_path = self.store.make_fixed_output_path(
      method,
      got,
      &output_path_name(&self.drv.name, output_name),
      &others,
      self_ref,
    )?;

    if *scratch_path != final_path {
      // Self-references need to point at the final hash. The content hash
      // stays valid since it was computed modulo the scratch hash.
      let mut self_rewrite = HashMap::new();
      self_rewrite.insert(old_hash_part, final_path.hash_part());
      self.rewrite_output(actual_path, &self_rewrite, inodes_seen)?;
    }

    let mut nar_sink = HashSink::new(HashType::SHA256, std::io::sink());
    nar::dump_path(actual_path, &mut nar_sink, &nar::PathFilter::none())?;
    let (_, nar_hash, nar_size) = nar_sink.finish();

    let mut info = ValidPathInfo::new(final_path, nar_hash);
    info.nar_size = Some(nar_size as u64);
    info.refs = others;
    if self_ref {
      info.refs.insert(info.path.clone());
    }
    info.ca = Some(ContentAddress { method, hash: got });
    Ok(info)
  }

  /// Check that every output exists, certify it, and register it as valid.
  /// Returns the realisations in output-name order.
  pub(crate) fn register_outputs(&mut self) -> Result<BTreeMap<String, Realisation>> {
    let mut infos: BTreeMap<String, ValidPathInfo> = BTreeMap::new();
    let mut inodes_seen = InodesSeen::new();
    let mut delayed_error: Option<anyhow::Error> = None;

    let mut referenceable_paths = StorePathSet::new();
    referenceable_paths.extend(self.input_paths.iter().cloned());
    referenceable_paths.extend(self.scratch_outputs.values().cloned());
    referenceable_paths.extend(self.added_paths.lock().iter().cloned());

    // pass 1: stat, canonicalise and scan every output we must register
    let mut output_refs: BTreeMap<String, OutputRefs> = BTreeMap::new();
    let mut output_modes: BTreeMap<String, u32> = BTreeMap::new();
    let mut outputs_to_sort = BTreeSet::new();

    let output_names: Vec<String> = self.drv.outputs.keys().cloned().collect();
    for output_name in &output_names {
      let scratch_path = self.scratch_output(output_name)?.clone();
      let actual_path = self.to_real_path_chroot(&scratch_path);

      outputs_to_sort.insert(output_name.clone());

      let initial = self
        .initial_outputs
        .get_mut(output_name)
        .ok_or_else(|| {
          BuildError::new(format!(
            "no initial output for '{}'",
            output_name
          ))
        })?;

      // already valid and not being checked: nothing to register
      initial.wanted = self.build_mode == BuildMode::Check
        || !initial.known.as_ref().map_or(false, |k| k.is_valid());
      if !initial.wanted {
        let known = initial.known.clone().expect("unwanted output must be known");
        output_refs.insert(output_name.clone(), OutputRefs::AlreadyRegistered(known.path));
        continue;
      }

      let st = match lstat(&actual_path) {
        Ok(st) => st,
        Err(_) => {
          return Err(BuildError::new(format!(
            "builder for '{}' failed to produce output path for output '{}' at '{}'",
            self.store.print_store_path(&self.drv_path),
            output_name,
            actual_path.display()
          )))
        }
      };

      // Writable-by-others or foreign-owned outputs mean another process
      // interfered with the build.
      let st_mode = st.st_mode as u32;
      let is_link = st_mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32;
      let foreign_owner = self
        .build_user
        .as_ref()
        .map_or(false, |u| st.st_uid != u.uid().as_raw());
      if (!is_link && st_mode & 0o022 != 0) || foreign_owner {
        return Err(BuildError::new(format!(
          "suspicious ownership or permission on '{}' for output '{}'; rejecting this build \
           output",
          actual_path.display(),
          output_name
        )));
      }

      // Canonicalise before scanning, so the tree we rewrite cannot contain
      // a hard link to something outside the build.
      canonicalise_path_metadata(&actual_path, self.uid_range(), &mut inodes_seen)?;

      let discard = self
        .drv
        .options
        .unsafe_discard_references
        .get(output_name)
        .copied()
        .unwrap_or(false);

      let references = if discard {
        debug!("discarding references of output '{}'", output_name);
        StorePathSet::new()
      } else {
        debug!(
          "scanning for references for output '{}' in temp location '{}'",
          output_name,
          actual_path.display()
        );
        scan_for_references(&actual_path, &referenceable_paths)?
      };

      output_refs.insert(
        output_name.clone(),
        OutputRefs::PerhapsNeedToRegister(references),
      );
      output_modes.insert(output_name.clone(), st_mode);
    }

    // pass 2: topological order, so rewrites of referenced outputs exist
    // before their referrers are hashed
    let scratch_by_path: HashMap<StorePath, String> = self
      .scratch_outputs
      .iter()
      .map(|(name, path)| (path.clone(), name.clone()))
      .collect();

    let drv_printed = self.store.print_store_path(&self.drv_path);
    let sorted_names = topo_sort(
      &outputs_to_sort,
      |name| match output_refs.get(name) {
        Some(OutputRefs::PerhapsNeedToRegister(refs)) => refs
          .iter()
          .filter_map(|r| scratch_by_path.get(r).cloned())
          .collect(),
        _ => Default::default(),
      },
      |path, parent| {
        BuildError::new(format!(
          "cycle detected in build of '{}' in the references of output '{}' from output '{}'",
          drv_printed, path, parent
        ))
      },
    )?;

    for output_name in sorted_names {
      let output = self.drv.outputs[&output_name].clone();
      let scratch_path = self.scratch_output(&output_name)?.clone();
      let mut actual_path = self.to_real_path_chroot(&scratch_path);

      let references = match output_refs
        .get(&output_name)
        .expect("every sorted output has references")
      {
        OutputRefs::AlreadyRegistered(final_path) => {
          let final_path = final_path.clone();
          if scratch_path != final_path {
            self
              .output_rewrites
              .insert(scratch_path.hash_part(), final_path.hash_part());
          }
          continue;
        }
        OutputRefs::PerhapsNeedToRegister(refs) => refs.clone(),
      };

      let output_mode = output_modes.get(&output_name).copied().unwrap_or(0);

      let mut new_info = match &output {
        Output::InputAddressed(required_final_path) => {
          // Add the rewrite rule up front: the NAR hash must see final
          // hashes, not normalised self-references.
          if scratch_path != *required_final_path {
            self
              .output_rewrites
              .insert(scratch_path.hash_part(), required_final_path.hash_part());
          }
          let rewrites = self.output_rewrites.clone();
          self.rewrite_output(&actual_path, &rewrites, &mut inodes_seen)?;

          let mut nar_sink = HashSink::new(HashType::SHA256, std::io::sink());
          nar::dump_path(&actual_path, &mut nar_sink, &nar::PathFilter::none())?;
          let (_, nar_hash, nar_size) = nar_sink.finish();

          let (self_ref, others) = self.rewrite_refs(&references, &scratch_path)?;
          let mut info = ValidPathInfo::new(required_final_path.clone(), nar_hash);
          info.nar_size = Some(nar_size as u64);
          info.refs = others;
          if self_ref {
            info.refs.insert(info.path.clone());
          }
          info
        }

        Output::Fixed(fixed) => {
          // Replace the output by a fresh copy of itself, dropping any open
          // file descriptors a lingering process might hold.
          let tmp_output = PathBuf::from(format!("{}.tmp", actual_path.display()));
          rm_rf::ensure_removed(&tmp_output)?;
          copy_path_recursive(&actual_path, &tmp_output)?;
          rm_rf::ensure_removed(&actual_path)?;
          move_path(&tmp_output, &actual_path)?;

          let info = self.new_info_from_ca(
            &output_name,
            fixed.method,
            fixed.hash.ty(),
            &actual_path,
            &scratch_path,
            &references,
            output_mode,
            &mut inodes_seen,
          )?;

          let got = info.ca.expect("CA output carries a content address").hash;
          if fixed.hash != got {
            // throw after registering, so the offending path can be examined
            self.callbacks.note_hash_mismatch();
            delayed_error = Some(BuildError::new(format!(
              "hash mismatch in fixed-output derivation '{}':\n  specified: {}\n     got:    {}",
              self.store.print_store_path(&self.drv_path),
              fixed.hash.encode_with_type(Encoding::SRI),
              got.encode_with_type(Encoding::SRI)
            )));
          }
          if !info.refs.is_empty() {
            delayed_error = Some(BuildError::new(format!(
              "fixed-output derivations must not reference store paths: '{}' references {} \
               distinct paths, e.g. '{}'",
              self.store.print_store_path(&self.drv_path),
              info.refs.len(),
              self
                .store
                .print_store_path(info.refs.iter().next().expect("nonempty"))
            )));
          }
          info
        }

        Output::Floating(method, algo) | Output::Impure(method, algo) => self.new_info_from_ca(
          &output_name,
          *method,
          *algo,
          &actual_path,
          &scratch_path,
          &references,
          output_mode,
          &mut inodes_seen,
        )?,

        Output::Deferred => {
          // resolution must have replaced these long before a build starts
          bail!(
            "internal error: deferred output '{}' reached registration",
            output_name
          );
        }
      };

      canonicalise_path_metadata(&actual_path, None, &mut inodes_seen)?;

      let final_dest_path = self.store.to_real_path(&new_info.path);

      // Lock dynamically computed final paths before moving; statically
      // known ones are covered by the scheduler's output locks.
      let mut dynamic_output_lock = PathLocks::new();
      dynamic_output_lock.set_deletion(true);
      let opt_fixed_path = output.path(&*self.store, &self.drv.name, &output_name)?;
      if opt_fixed_path.as_ref() != Some(&new_info.path) {
        assert!(new_info.ca.is_some());
        dynamic_output_lock.lock_paths(vec![final_dest_path.clone()])?;
      }

      if final_dest_path != actual_path {
        match self.build_mode {
          BuildMode::Repair => {
            replace_valid_path(&final_dest_path, &actual_path)?;
            actual_path = final_dest_path.clone();
          }
          BuildMode::Check => {
            // leave the new tree where it is; we only compare below
          }
          BuildMode::Normal => {
            if self.store.is_valid_path(&new_info.path)? {
              // some other CA build already produced this path
              assert!(new_info.ca.is_some());
            } else {
              rm_rf::ensure_removed(&final_dest_path)?;
              move_path(&actual_path, &final_dest_path)?;
              actual_path = final_dest_path.clone();
            }
          }
        }
      }

      if self.build_mode == BuildMode::Check {
        if !self.store.is_valid_path(&new_info.path)? {
          continue;
        }
        let mut old_info = self.store.get_path_info(&new_info.path)?;
        if new_info.nar_hash != old_info.nar_hash {
          self.callbacks.note_check_mismatch();
          if settings().run_diff_hook || settings().keep_failed {
            let dst = PathBuf::from(format!("{}.check", final_dest_path.display()));
            rm_rf::ensure_removed(&dst)?;
            move_path(&actual_path, &dst)?;

            if let Some(diff_hook) = &settings().diff_hook {
              if settings().run_diff_hook {
                hook::run_diff_hook(
                  diff_hook,
                  &final_dest_path,
                  &dst,
                  &self.store.print_store_path(&self.drv_path),
                  self.tmp_dir.as_deref().unwrap_or_else(|| Path::new("/")),
                );
              }
            }

            return Err(NotDeterministic::new(format!(
              "derivation '{}' may not be deterministic: output '{}' differs from '{}'",
              self.store.print_store_path(&self.drv_path),
              final_dest_path.display(),
              dst.display()
            )));
          }
          return Err(NotDeterministic::new(format!(
            "derivation '{}' may not be deterministic: output '{}' differs",
            self.store.print_store_path(&self.drv_path),
            final_dest_path.display()
          )));
        }

        // verified against the previous build, so now ultimately trusted
        if !old_info.ultimate {
          old_info.ultimate = true;
          self.store.sign_path_info(&mut old_info)?;
          self.store.register_valid_path(old_info)?;
        }
        continue;
      }

      for input in &self.input_paths {
        if new_info.refs.contains(input) {
          debug!("referenced input: '{}'", self.store.print_store_path(input));
        } else {
          debug!(
            "unreferenced input: '{}'",
            self.store.print_store_path(input)
          );
        }
      }

      self.callbacks.mark_contents_good(&new_info.path);

      new_info.deriver = Some(self.drv_path.clone());
      new_info.ultimate = true;
      self.store.sign_path_info(&mut new_info)?;

      if scratch_path != new_info.path {
        self
          .output_rewrites
          .insert(scratch_path.hash_part(), new_info.path.hash_part());
      }

      // CA paths were not known up front; register them right away so the
      // dynamic lock can be dropped safely.
      if new_info.ca.is_some() {
        self.store.register_valid_path(new_info.clone())?;
      }

      infos.insert(output_name, new_info);
    }

    if self.build_mode == BuildMode::Check {
      // fixed-output mismatches are a source of nondeterminism too
      if let Some(delayed) = delayed_error {
        return Err(delayed);
      }
      return self.callbacks.assert_path_validity();
    }

    self.check_outputs(&infos)?;

    self
      .store
      .register_valid_paths(infos.values().cloned().collect())?;

    if let Some(delayed) = delayed_error {
      return Err(delayed);
    }

    let mut built_outputs = BTreeMap::new();
    for (output_name, info) in infos {
      let mut realisation = Realisation {
        id: DrvOutput {
          drv_hash: self.drv_path.hash_part(),
          output_name: output_name.clone(),
        },
        out_path: info.path.clone(),
        signatures: vec![],
      };
      if !self.drv.is_impure() {
        self.store.sign_realisation(&mut realisation)?;
        self.store.register_drv_output(&realisation)?;
      }
      built_outputs.insert(output_name, realisation);
    }

    Ok(built_outputs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::build::{
    make_derivation_builder, DerivationBuilderParams, InitialOutput, InitialOutputStatus,
    NoopCallbacks, PathStatus,
  };
  use crate::store::derivation::{Derivation, DerivationType, FixedOutputHash};
  use crate::store::test::TestStore;
  use crate::store::Store;
  use std::sync::Arc;

  fn drv_path_for(name: &str) -> StorePath {
    let h = Hash::hash(name, HashType::SHA256);
    StorePath::from_parts(&h.as_bytes()[..20], &format!("{}.drv", name)).unwrap()
  }

  fn builder_for(
    store: Arc<TestStore>,
    drv: Derivation,
    mode: BuildMode,
  ) -> super::super::DerivationBuilder {
    let drv_path = drv_path_for(&drv.name);
    make_derivation_builder(
      store,
      Box::new(NoopCallbacks),
      DerivationBuilderParams {
        drv_path,
        drv,
        build_mode: mode,
        input_paths: Default::default(),
      },
    )
  }

  /// Fill in initial outputs the way prepare_build would, then pick scratch
  /// locations.
  fn prepare_outputs(b: &mut super::super::DerivationBuilder) {
    let mut initial = BTreeMap::new();
    for (name, output) in &b.drv.outputs {
      let known = output
        .path(&*b.store, &b.drv.name, name)
        .unwrap()
        .map(|path| {
          let status = if b.store.is_valid_path(&path).unwrap() {
            PathStatus::Valid
          } else {
            PathStatus::Absent
          };
          InitialOutputStatus { path, status }
        });
      initial.insert(name.clone(), InitialOutput { wanted: true, known });
    }
    b.initial_outputs = initial;
    b.make_scratch_outputs().unwrap();
  }

  fn write_output_tree(store: &TestStore, path: &StorePath, files: &[(&str, &str)]) {
    let root = store.to_real_path(path);
    fs::create_dir_all(&root).unwrap();
    for (name, contents) in files {
      fs::write(root.join(name), contents).unwrap();
    }
  }

  fn nar_hash_of(path: &Path) -> Hash {
    let mut sink = HashSink::new(HashType::SHA256, std::io::sink());
    nar::dump_path(path, &mut sink, &nar::PathFilter::none()).unwrap();
    sink.finish().1
  }

  #[test]
  fn input_addressed_trivial_build() {
    let store = Arc::new(TestStore::new());

    let input: StorePath = format!("{}-a", "b".repeat(32)).parse().unwrap();
    store.register_input(&input, Default::default());
    store.install_file(&input, "input data");

    let out_path = store
      .make_store_path("output:out", Hash::zeroes(HashType::SHA256), "hello")
      .unwrap();

    let mut drv = Derivation::default();
    drv.name = "hello".into();
    drv
      .outputs
      .insert("out".into(), Output::InputAddressed(out_path.clone()));

    let mut b = builder_for(store.clone(), drv, BuildMode::Normal);
    b.input_paths.insert(input);
    prepare_outputs(&mut b);

    assert_eq!(b.scratch_outputs["out"], out_path);
    write_output_tree(&store, &out_path, &[("hello", "hello")]);

    let realisations = b.register_outputs().unwrap();
    assert_eq!(realisations["out"].out_path, out_path);

    let info = store.get_path_info(&out_path).unwrap();
    assert!(info.refs.is_empty());
    assert!(info.ultimate);
    assert_eq!(info.nar_hash, nar_hash_of(&store.to_real_path(&out_path)));
    assert_eq!(info.deriver.as_ref().unwrap().name(), "hello.drv");
  }

  #[test]
  fn missing_output_is_a_build_error() {
    let store = Arc::new(TestStore::new());
    let out_path = store
      .make_store_path("output:out", Hash::zeroes(HashType::SHA256), "ghost")
      .unwrap();

    let mut drv = Derivation::default();
    drv.name = "ghost".into();
    drv
      .outputs
      .insert("out".into(), Output::InputAddressed(out_path));

    let mut b = builder_for(store, drv, BuildMode::Normal);
    prepare_outputs(&mut b);

    let err = b.register_outputs().unwrap_err();
    assert!(err.downcast_ref::<BuildError>().is_some());
    assert!(err.to_string().contains("failed to produce output path"));
  }

  #[test]
  fn fixed_output_success_has_no_references() {
    let store = Arc::new(TestStore::new());

    let contents = "fetched bytes";
    let declared = Hash::hash(contents, HashType::SHA256);

    let mut drv = Derivation::default();
    drv.name = "fetched".into();
    drv.ty = DerivationType::Fixed;
    drv.outputs.insert(
      "out".into(),
      Output::Fixed(FixedOutputHash {
        method: FileIngestionMethod::Flat,
        hash: declared,
      }),
    );

    let mut b = builder_for(store.clone(), drv, BuildMode::Normal);
    prepare_outputs(&mut b);

    let scratch = b.scratch_outputs["out"].clone();
    fs::write(store.to_real_path(&scratch), contents).unwrap();

    let realisations = b.register_outputs().unwrap();
    let info = store.get_path_info(&realisations["out"].out_path).unwrap();
    assert!(info.refs.is_empty());
    assert_eq!(info.ca.unwrap().hash, declared);
  }

  #[test]
  fn fixed_output_mismatch_is_delayed_but_registered() {
    let store = Arc::new(TestStore::new());

    let declared = Hash::hash("what we wanted", HashType::SHA256);
    let actual_contents = "what we got";

    let mut drv = Derivation::default();
    drv.name = "fetched".into();
    drv.ty = DerivationType::Fixed;
    drv.outputs.insert(
      "out".into(),
      Output::Fixed(FixedOutputHash {
        method: FileIngestionMethod::Flat,
        hash: declared,
      }),
    );

    let mut b = builder_for(store.clone(), drv, BuildMode::Normal);
    prepare_outputs(&mut b);

    let scratch = b.scratch_outputs["out"].clone();
    fs::write(store.to_real_path(&scratch), actual_contents).unwrap();

    let err = b.register_outputs().unwrap_err();
    assert!(err
      .to_string()
      .contains("hash mismatch in fixed-output derivation"));

    // the wrong output is still registered under its true content address
    let got = Hash::hash(actual_contents, HashType::SHA256);
    let got_path = store
      .make_fixed_output_path(
        FileIngestionMethod::Flat,
        got,
        "fetched",
        &Default::default(),
        false,
      )
      .unwrap();
    assert!(store.is_valid_path(&got_path).unwrap());
  }

  #[test]
  fn floating_ca_rewrites_sibling_references() {
    let store = Arc::new(TestStore::new());

    let mut drv = Derivation::default();
    drv.name = "multi".into();
    drv.ty = DerivationType::Floating;
    drv.outputs.insert(
      "out".into(),
      Output::Floating(FileIngestionMethod::Recursive, HashType::SHA256),
    );
    drv.outputs.insert(
      "dev".into(),
      Output::Floating(FileIngestionMethod::Recursive, HashType::SHA256),
    );

    let mut b = builder_for(store.clone(), drv, BuildMode::Normal);
    prepare_outputs(&mut b);

    let scratch_out = b.scratch_outputs["out"].clone();
    let scratch_dev = b.scratch_outputs["dev"].clone();
    assert_ne!(scratch_out, scratch_dev);

    write_output_tree(&store, &scratch_out, &[("lib", "pure contents")]);
    // dev embeds the scratch path of out, as binaries would after linking
    write_output_tree(
      &store,
      &scratch_dev,
      &[("ref", &format!("see {}", store.print_store_path(&scratch_out)))],
    );

    let realisations = b.register_outputs().unwrap();
    let final_out = realisations["out"].out_path.clone();
    let final_dev = realisations["dev"].out_path.clone();

    // dev must now mention out's final hash, not the scratch one
    let dev_contents =
      fs::read_to_string(store.to_real_path(&final_dev).join("ref")).unwrap();
    assert!(dev_contents.contains(&final_out.hash_part()));
    assert!(!dev_contents.contains(&scratch_out.hash_part()));

    let dev_info = store.get_path_info(&final_dev).unwrap();
    assert!(dev_info.refs.contains(&final_out));

    // scratch locations are gone
    assert!(!store.to_real_path(&scratch_out).exists());
    assert!(!store.to_real_path(&scratch_dev).exists());
  }

  #[test]
  fn reference_cycle_is_rejected() {
    let store = Arc::new(TestStore::new());

    let mut drv = Derivation::default();
    drv.name = "cyclic".into();
    drv.ty = DerivationType::Floating;
    for name in ["a", "b"] {
      drv.outputs.insert(
        name.into(),
        Output::Floating(FileIngestionMethod::Recursive, HashType::SHA256),
      );
    }

    let mut b = builder_for(store.clone(), drv, BuildMode::Normal);
    prepare_outputs(&mut b);

    let scratch_a = b.scratch_outputs["a"].clone();
    let scratch_b = b.scratch_outputs["b"].clone();
    write_output_tree(
      &store,
      &scratch_a,
      &[("x", &store.print_store_path(&scratch_b))],
    );
    write_output_tree(
      &store,
      &scratch_b,
      &[("x", &store.print_store_path(&scratch_a))],
    );

    let err = b.register_outputs().unwrap_err();
    assert!(err.to_string().contains("cycle detected"));
  }

  #[test]
  fn check_mode_detects_divergence() {
    let store = Arc::new(TestStore::new());

    let out_path = store
      .make_store_path("output:out", Hash::zeroes(HashType::SHA256), "stable")
      .unwrap();

    let mut drv = Derivation::default();
    drv.name = "stable".into();
    drv
      .outputs
      .insert("out".into(), Output::InputAddressed(out_path.clone()));

    // first build
    let mut b = builder_for(store.clone(), drv.clone(), BuildMode::Normal);
    prepare_outputs(&mut b);
    write_output_tree(&store, &out_path, &[("data", "deterministic")]);
    b.register_outputs().unwrap();

    // rebuild with --check produces different bytes
    let mut b2 = builder_for(store.clone(), drv, BuildMode::Check);
    prepare_outputs(&mut b2);
    let scratch = b2.scratch_outputs["out"].clone();
    assert_ne!(scratch, out_path);
    write_output_tree(&store, &scratch, &[("data", "nondeterministic")]);

    let err = b2.register_outputs().unwrap_err();
    assert!(err.downcast_ref::<NotDeterministic>().is_some());
  }

  #[test]
  fn check_mode_accepts_identical_rebuild() {
    let store = Arc::new(TestStore::new());

    let out_path = store
      .make_store_path("output:out", Hash::zeroes(HashType::SHA256), "stable")
      .unwrap();

    let mut drv = Derivation::default();
    drv.name = "stable".into();
    drv
      .outputs
      .insert("out".into(), Output::InputAddressed(out_path.clone()));

    let mut b = builder_for(store.clone(), drv.clone(), BuildMode::Normal);
    prepare_outputs(&mut b);
    write_output_tree(&store, &out_path, &[("data", "deterministic")]);
    b.register_outputs().unwrap();

    let mut b2 = builder_for(store.clone(), drv, BuildMode::Check);
    prepare_outputs(&mut b2);
    let scratch = b2.scratch_outputs["out"].clone();
    write_output_tree(&store, &scratch, &[("data", "deterministic")]);

    b2.register_outputs().unwrap();
  }

  #[test]
  fn topo_sort_is_stable_and_detects_cycles() {
    let items: BTreeSet<String> = ["a", "b", "c"].iter().map(|x| x.to_string()).collect();

    let order = topo_sort(
      &items,
      |name| match name {
        "a" => ["b"].iter().map(|x| x.to_string()).collect(),
        "b" => ["c"].iter().map(|x| x.to_string()).collect(),
        _ => Default::default(),
      },
      |a, b| anyhow!("cycle {} {}", a, b),
    )
    .unwrap();
    assert_eq!(order, vec!["c", "b", "a"]);

    let err = topo_sort(
      &items,
      |name| match name {
        "a" => ["b"].iter().map(|x| x.to_string()).collect(),
        "b" => ["a"].iter().map(|x| x.to_string()).collect(),
        _ => Default::default(),
      },
      |a, b| anyhow!("cycle {} {}", a, b),
    )
    .unwrap_err();
    assert!(err.to_string().contains("cycle"));
  }
}
