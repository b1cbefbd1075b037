//! Privilege helpers: credential resolution and dropping.
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::unistd::{Gid, Group, Uid, User, setgid, setgroups, setuid};

use crate::config::GroupSpec;
use crate::error::PrivilegeError;

/// Resolved numeric credentials applied to a process before exec.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Target user id.
    pub uid: Option<u32>,
    /// Target primary group id.
    pub gid: Option<u32>,
    /// Supplementary group ids.
    pub supplementary: Vec<u32>,
}

impl Credentials {
    /// Whether any switch was requested at all.
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.supplementary.is_empty()
    }

    /// Resolves user and group names into ids. A user's login group becomes
    /// the primary group unless an explicit group overrides it.
    pub fn resolve(
        user: Option<&str>,
        group: Option<&GroupSpec>,
    ) -> Result<Self, PrivilegeError> {
        let mut creds = Credentials::default();

        if let Some(name) = user {
            let account = User::from_name(name)?
                .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?;
            creds.uid = Some(account.uid.as_raw());
            creds.gid = Some(account.gid.as_raw());
        }

        if let Some(group) = group {
            if let Some(primary) = group.primary() {
                let resolved = Group::from_name(primary)?
                    .ok_or_else(|| PrivilegeError::UnknownGroup(primary.to_string()))?;
                creds.gid = Some(resolved.gid.as_raw());
            }
            for name in group.supplementary() {
                let resolved = Group::from_name(name)?
                    .ok_or_else(|| PrivilegeError::UnknownGroup(name.to_string()))?;
                creds.supplementary.push(resolved.gid.as_raw());
            }
        }

        Ok(creds)
    }

    /// Wires the credential switch into a command about to be spawned.
    pub fn apply_to_command(&self, cmd: &mut Command) {
        if let Some(gid) = self.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = self.uid {
            cmd.uid(uid);
        }
        if !self.supplementary.is_empty() {
            let groups: Vec<libc::gid_t> =
                self.supplementary.iter().map(|&gid| gid as libc::gid_t).collect();
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }
}

/// Whether this process may switch credentials at all.
pub fn running_privileged() -> bool {
    Uid::effective().is_root()
}

/// Drops the supervisor's own privileges for `--user`/`--group`. Groups are
/// switched before the user so the switch cannot be undone.
pub fn drop_privileges(
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(), PrivilegeError> {
    if user.is_none() && group.is_none() {
        return Ok(());
    }
    if !running_privileged() {
        return Err(PrivilegeError::NotRoot);
    }

    let group_spec = group.map(|name| GroupSpec::One(name.to_string()));
    let creds = Credentials::resolve(user, group_spec.as_ref())?;

    if let Some(gid) = creds.gid {
        setgroups(&[Gid::from_raw(gid)])?;
        setgid(Gid::from_raw(gid))?;
    }
    if let Some(uid) = creds.uid {
        setuid(Uid::from_raw(uid))?;
    }

    Ok(())
}
