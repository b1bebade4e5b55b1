//! The syscall filter installed in the sandbox child: no setuid/setgid file
//! modes, no extended attributes or ACLs (neither survives the archive
//! serialisation), and no privilege re-escalation.

use crate::prelude::*;
use crate::store::settings::settings;
use nix::errno::Errno;

// fchmodat2(2) landed in 6.6 with the same number on every architecture
const SYS_FCHMODAT2: i64 = 452;

// AUDIT_ARCH values for the secondary architectures multi-arch hosts can run
#[cfg(target_arch = "x86_64")]
const SCMP_ARCH_X86: u32 = 0x4000_0003;
#[cfg(target_arch = "x86_64")]
const SCMP_ARCH_X32: u32 = 0x4000_003e;
#[cfg(target_arch = "aarch64")]
const SCMP_ARCH_ARM: u32 = 0x4000_0028;

pub fn init_seccomp() -> Result<()> {
  use seccomp_sys::*;
  use std::ops::Deref;

  if !settings().filter_syscalls {
    return Ok(());
  }

  struct Dealloc(*mut libc::c_void);

  impl Drop for Dealloc {
    fn drop(&mut self) {
      unsafe { seccomp_release(self.0) }
    }
  }

  impl Deref for Dealloc {
    type Target = *mut libc::c_void;

    fn deref(&self) -> &Self::Target {
      &self.0
    }
  }

  unsafe {
    let ctx = seccomp_init(SCMP_ACT_ALLOW);
    if ctx.is_null() {
      bail!(Errno::last());
    }

    let ctx = Dealloc(ctx);

    // 32-bit binaries must hit the same rules
    #[cfg(target_arch = "x86_64")]
    {
      Errno::result(seccomp_arch_add(*ctx, SCMP_ARCH_X86))?;
      Errno::result(seccomp_arch_add(*ctx, SCMP_ARCH_X32))?;
    }
    #[cfg(target_arch = "aarch64")]
    if seccomp_arch_add(*ctx, SCMP_ARCH_ARM) != 0 {
      slog_scope::error!(
        "unable to add ARM seccomp architecture; this may result in spurious build failures if \
         running 32-bit ARM processes"
      );
    }

    for perm in &[libc::S_ISUID, libc::S_ISGID] {
      for (syscall, mode_arg) in &[
        (libc::SYS_chmod, 1u32),
        (libc::SYS_fchmod, 1),
        (libc::SYS_fchmodat, 2),
        (SYS_FCHMODAT2, 2),
      ] {
        Errno::result(seccomp_rule_add(
          *ctx,
          SCMP_ACT_ERRNO(libc::EPERM as _),
          *syscall as _,
          1,
          scmp_arg_cmp {
            arg: *mode_arg,
            op: scmp_compare::SCMP_CMP_MASKED_EQ,
            datum_a: *perm as _,
            datum_b: *perm as _,
          },
        ))?;
      }
    }

    for syscall in &[
      libc::SYS_setxattr,
      libc::SYS_lsetxattr,
      libc::SYS_fsetxattr,
      libc::SYS_getxattr,
      libc::SYS_lgetxattr,
      libc::SYS_fgetxattr,
      libc::SYS_listxattr,
      libc::SYS_llistxattr,
      libc::SYS_flistxattr,
      libc::SYS_removexattr,
      libc::SYS_lremovexattr,
      libc::SYS_fremovexattr,
    ] {
      Errno::result(seccomp_rule_add(
        *ctx,
        SCMP_ACT_ERRNO(libc::ENOTSUP as _),
        *syscall as _,
        0,
      ))?;
    }

    Errno::result(seccomp_attr_set(
      *ctx,
      scmp_filter_attr::SCMP_FLTATR_CTL_NNP,
      if settings().allow_new_privileges { 0 } else { 1 },
    ))?;

    Errno::result(seccomp_load(*ctx))?;
  }

  Ok(())
}
