//! Operating system specific metadata: owners, extended attributes and ACLs

use crate::Result;
use nix::unistd::{Gid, Group, Uid, User};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{acl_get, acl_set, xattrs_get, xattrs_set};

static USERS: Lazy<Mutex<HashMap<u32, Option<String>>>> = Lazy::new(Default::default);
static UIDS: Lazy<Mutex<HashMap<String, Option<u32>>>> = Lazy::new(Default::default);
static GROUPS: Lazy<Mutex<HashMap<u32, Option<String>>>> = Lazy::new(Default::default);
static GIDS: Lazy<Mutex<HashMap<String, Option<u32>>>> = Lazy::new(Default::default);

fn memoize<K, V, F>(table: &Mutex<HashMap<K, V>>, key: K, lookup: F) -> V
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
    F: FnOnce(&K) -> V,
{
    let mut table = match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    table.entry(key.clone()).or_insert_with(|| lookup(&key)).clone()
}

pub fn uid2user(uid: u32) -> Option<String> {
    memoize(&USERS, uid, |uid| {
        User::from_uid(Uid::from_raw(*uid)).ok().flatten().map(|u| u.name)
    })
}

pub fn user2uid(user: &str) -> Option<u32> {
    memoize(&UIDS, user.to_string(), |name| {
        User::from_name(name).ok().flatten().map(|u| u.uid.as_raw())
    })
}

pub fn gid2group(gid: u32) -> Option<String> {
    memoize(&GROUPS, gid, |gid| {
        Group::from_gid(Gid::from_raw(*gid)).ok().flatten().map(|g| g.name)
    })
}

pub fn group2gid(group: &str) -> Option<u32> {
    memoize(&GIDS, group.to_string(), |name| {
        Group::from_name(name).ok().flatten().map(|g| g.gid.as_raw())
    })
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use crate::archive::{Item, XattrValue};
    use crate::Result;
    use std::collections::BTreeMap;
    use std::path::Path;

    pub fn acl_get(_path: &Path, _item: &mut Item, _numeric_owner: bool) -> Result<()> {
        Ok(())
    }

    pub fn acl_set(_path: &Path, _item: &Item, _numeric_owner: bool) -> Result<()> {
        Ok(())
    }

    pub fn xattrs_get(_path: &Path) -> Result<BTreeMap<String, XattrValue>> {
        Ok(BTreeMap::new())
    }

    pub fn xattrs_set(_path: &Path, _xattrs: &BTreeMap<String, XattrValue>) -> Result<()> {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::{acl_get, acl_set, xattrs_get, xattrs_set};

/// Current user name, falling back to the numeric id
pub fn current_username() -> String {
    let uid = nix::unistd::getuid().as_raw();
    uid2user(uid).unwrap_or_else(|| uid.to_string())
}

pub fn hostname() -> Result<String> {
    Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_lookups_agree() {
        if let Some(name) = uid2user(0) {
            assert_eq!(user2uid(&name), Some(0));
        }
        if let Some(name) = gid2group(0) {
            assert_eq!(group2gid(&name), Some(0));
        }
        assert_eq!(user2uid("no-such-user-burrow"), None);
        assert!(!current_username().is_empty());
    }
}
