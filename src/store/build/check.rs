//! Post-registration policy checks: size ceilings and reference allow/deny
//! lists, as declared by the derivation's `outputChecks`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::error::BuildError;
use super::DerivationBuilder;
use crate::prelude::*;
use crate::store::derivation::OutputChecks;
use crate::store::path_info::ValidPathInfo;
use crate::store::StorePathSet;

impl DerivationBuilder {
  pub(crate) fn check_outputs(&self, outputs: &BTreeMap<String, ValidPathInfo>) -> Result<()> {
    let outputs_by_path: HashMap<StorePath, &ValidPathInfo> =
      outputs.values().map(|info| (info.path.clone(), info)).collect();

    // The closure of a fresh output may pass through sibling outputs that
    // are not queryable yet, so consult the in-flight map first.
    let get_closure = |start: &StorePath| -> Result<(StorePathSet, u64)> {
      let mut closure_size = 0u64;
      let mut done = StorePathSet::new();
      let mut left = VecDeque::new();
      left.push_back(start.clone());

      while let Some(path) = left.pop_front() {
        if !done.insert(path.clone()) {
          continue;
        }
        match outputs_by_path.get(&path) {
          Some(info) => {
            closure_size += info.nar_size.unwrap_or(0);
            left.extend(info.refs.iter().cloned());
          }
          None => {
            let info = self.store.get_path_info(&path)?;
            closure_size += info.nar_size.unwrap_or(0);
            left.extend(info.refs.iter().cloned());
          }
        }
      }

      Ok((done, closure_size))
    };

    for (output_name, info) in outputs {
      let checks = match self.drv.options.checks_for(output_name) {
        Some(c) => c.clone(),
        None => continue,
      };

      self.apply_checks(output_name, info, &checks, outputs, &get_closure)?;
    }

    Ok(())
  }

  fn apply_checks<F>(
    &self,
    output_name: &str,
    info: &ValidPathInfo,
    checks: &OutputChecks,
    outputs: &BTreeMap<String, ValidPathInfo>,
    get_closure: &F,
  ) -> Result<()>
  where
    F: Fn(&StorePath) -> Result<(StorePathSet, u64)>,
  {
    if let Some(max_size) = checks.max_size {
      let nar_size = info.nar_size.unwrap_or(0);
      if nar_size > max_size {
        return Err(BuildError::new(format!(
          "path '{}' is too large at {} bytes; limit is {} bytes",
          self.store.print_store_path(&info.path),
          nar_size,
          max_size
        )));
      }
    }

    if let Some(max_closure_size) = checks.max_closure_size {
      let (_, closure_size) = get_closure(&info.path)?;
      if closure_size > max_closure_size {
        return Err(BuildError::new(format!(
          "closure of path '{}' is too large at {} bytes; limit is {} bytes",
          self.store.print_store_path(&info.path),
          closure_size,
          max_closure_size
        )));
      }
    }

    // Each spec element is either a store path or the symbolic name of a
    // sibling output.
    let parse_spec = |value: &BTreeSet<String>| -> Result<StorePathSet> {
      let mut spec = StorePathSet::new();
      for item in value {
        if let Ok(path) = item.parse::<StorePath>() {
          spec.insert(path);
        } else if let Ok(path) = self.store.parse_store_path(std::path::Path::new(item)) {
          spec.insert(path);
        } else if let Some(output) = outputs.get(item) {
          spec.insert(output.path.clone());
        } else {
          return Err(BuildError::new(format!(
            "derivation '{}' output check for '{}' contains an illegal reference specifier \
             '{}', expected store path or output name (one of [{}])",
            self.store.print_store_path(&self.drv_path),
            output_name,
            item,
            outputs.keys().cloned().collect::<Vec<_>>().join(", ")
          )));
        }
      }
      Ok(spec)
    };

    let check_refs = |value: &BTreeSet<String>, allowed: bool, recursive: bool| -> Result<()> {
      let spec = parse_spec(value)?;

      let mut used = if recursive {
        get_closure(&info.path)?.0
      } else {
        info.refs.clone()
      };

      if recursive && checks.ignore_self_refs {
        used.remove(&info.path);
      }

      let bad_paths: Vec<_> = used
        .iter()
        .filter(|path| {
          if allowed {
            !spec.contains(*path)
          } else {
            spec.contains(*path)
          }
        })
        .collect();

      if !bad_paths.is_empty() {
        let mut listing = String::new();
        for path in bad_paths {
          listing.push_str("\n  ");
          listing.push_str(&self.store.print_store_path(path));
        }
        return Err(BuildError::new(format!(
          "output '{}' is not allowed to refer to the following paths:{}",
          self.store.print_store_path(&info.path),
          listing
        )));
      }
      Ok(())
    };

    // An absent allow list and a present-but-empty one mean different
    // things, so only run the check when the list exists.
    if let Some(refs) = &checks.allowed_references {
      check_refs(refs, true, false)?;
    }
    if let Some(refs) = &checks.allowed_requisites {
      check_refs(refs, true, true)?;
    }
    if !checks.disallowed_references.is_empty() {
      check_refs(&checks.disallowed_references, false, false)?;
    }
    if !checks.disallowed_requisites.is_empty() {
      check_refs(&checks.disallowed_requisites, false, true)?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::build::{make_derivation_builder, DerivationBuilderParams, NoopCallbacks};
  use crate::store::derivation::{Derivation, OutputChecksVariant};
  use crate::store::settings::BuildMode;
  use crate::store::test::TestStore;
  use crate::store::Store;
  use std::sync::Arc;

  fn fake_info(store: &TestStore, name: &str, nar_size: u64) -> ValidPathInfo {
    let path = store
      .make_store_path("output:out", Hash::zeroes(HashType::SHA256), name)
      .unwrap();
    let mut info = ValidPathInfo::new(path, Hash::hash(name, HashType::SHA256));
    info.nar_size = Some(nar_size);
    info
  }

  fn builder_with_checks(
    store: Arc<TestStore>,
    checks: OutputChecks,
  ) -> super::super::DerivationBuilder {
    let mut drv = Derivation::default();
    drv.name = "checked".into();
    drv.options.output_checks = OutputChecksVariant::ForAllOutputs(checks);

    let h = Hash::hash("checked", HashType::SHA256);
    let drv_path = StorePath::from_parts(&h.as_bytes()[..20], "checked.drv").unwrap();

    make_derivation_builder(
      store,
      Box::new(NoopCallbacks),
      DerivationBuilderParams {
        drv_path,
        drv,
        build_mode: BuildMode::Normal,
        input_paths: Default::default(),
      },
    )
  }

  #[test]
  fn max_size_is_enforced() {
    let store = Arc::new(TestStore::new());
    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        max_size: Some(100),
        ..Default::default()
      },
    );

    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), fake_info(&store, "small", 50));
    b.check_outputs(&outputs).unwrap();

    outputs.insert("out".to_string(), fake_info(&store, "big", 5000));
    let err = b.check_outputs(&outputs).unwrap_err();
    assert!(err.to_string().contains("too large"));
  }

  #[test]
  fn disallowed_references_are_enumerated() {
    let store = Arc::new(TestStore::new());
    let forbidden = fake_info(&store, "forbidden", 1);

    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        disallowed_references: [forbidden.path.to_string()].iter().cloned().collect(),
        ..Default::default()
      },
    );

    let mut out = fake_info(&store, "result", 1);
    out.refs.insert(forbidden.path.clone());

    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), out);

    let err = b.check_outputs(&outputs).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("is not allowed to refer"));
    assert!(msg.contains(&forbidden.path.hash_part()));
  }

  #[test]
  fn allowed_references_accept_sibling_output_names() {
    let store = Arc::new(TestStore::new());
    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        allowed_references: Some(["dev".to_string()].iter().cloned().collect()),
        ..Default::default()
      },
    );

    let dev = fake_info(&store, "checked-dev", 1);
    let mut out = fake_info(&store, "checked", 1);
    out.refs.insert(dev.path.clone());

    let mut outputs = BTreeMap::new();
    outputs.insert("dev".to_string(), dev);
    outputs.insert("out".to_string(), out);

    b.check_outputs(&outputs).unwrap();
  }

  #[test]
  fn empty_allow_list_forbids_everything() {
    let store = Arc::new(TestStore::new());
    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        allowed_references: Some(Default::default()),
        ..Default::default()
      },
    );

    let dep = fake_info(&store, "dep", 1);
    let mut out = fake_info(&store, "result", 1);
    out.refs.insert(dep.path.clone());

    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), out);

    assert!(b.check_outputs(&outputs).is_err());
  }

  #[test]
  fn requisites_walk_the_closure() {
    let store = Arc::new(TestStore::new());

    // deep is only reachable through mid
    let deep = fake_info(&store, "deep", 10);
    let mut mid = fake_info(&store, "mid", 10);
    mid.refs.insert(deep.path.clone());
    store.register_valid_paths(vec![deep.clone(), mid.clone()]).unwrap();

    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        disallowed_requisites: [deep.path.to_string()].iter().cloned().collect(),
        ignore_self_refs: true,
        ..Default::default()
      },
    );

    let mut out = fake_info(&store, "result", 10);
    out.refs.insert(mid.path.clone());

    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), out.clone());

    let err = b.check_outputs(&outputs).unwrap_err();
    assert!(err.to_string().contains(&deep.path.hash_part()));

    // as a plain reference check, the transitive path is invisible
    let b2 = builder_with_checks(
      store.clone(),
      OutputChecks {
        disallowed_references: [deep.path.to_string()].iter().cloned().collect(),
        ..Default::default()
      },
    );
    b2.check_outputs(&outputs).unwrap();
  }

  #[test]
  fn max_closure_size_counts_transitive_nar_sizes() {
    let store = Arc::new(TestStore::new());

    let dep = fake_info(&store, "dep", 600);
    store.register_valid_paths(vec![dep.clone()]).unwrap();

    let b = builder_with_checks(
      store.clone(),
      OutputChecks {
        max_closure_size: Some(1000),
        ..Default::default()
      },
    );

    let mut out = fake_info(&store, "result", 500);
    out.refs.insert(dep.path.clone());

    let mut outputs = BTreeMap::new();
    outputs.insert("out".to_string(), out);

    let err = b.check_outputs(&outputs).unwrap_err();
    assert!(err.to_string().contains("closure of path"));
  }
}
