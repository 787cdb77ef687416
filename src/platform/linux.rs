//! Linux extended attributes and POSIX ACLs
//!
//! ACLs live in the `system.posix_acl_access` and `system.posix_acl_default`
//! attributes in the kernel's binary layout: a little endian version word
//! followed by `(tag: u16, perm: u16, id: u32)` entries sorted by tag and id.
//! Archives store them as text, one `tag:name:perms[:id]` entry per line.

use super::{gid2group, group2gid, uid2user, user2uid};
use crate::archive::{Item, XattrValue};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::warn;

const ACL_ACCESS: &str = "system.posix_acl_access";
const ACL_DEFAULT: &str = "system.posix_acl_default";
const ACL_EA_VERSION: u32 = 2;
const ACL_UNDEFINED_ID: u32 = u32::MAX;

const ACL_USER_OBJ: u16 = 0x01;
const ACL_USER: u16 = 0x02;
const ACL_GROUP_OBJ: u16 = 0x04;
const ACL_GROUP: u16 = 0x08;
const ACL_MASK: u16 = 0x10;
const ACL_OTHER: u16 = 0x20;

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL")))
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "attribute name contains NUL")))
}

fn unsupported(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::ENODATA) | Some(libc::ENOTSUP) | Some(libc::ENOENT)
    )
}

fn lgetxattr(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let path = c_path(path)?;
    let name = c_name(name)?;
    loop {
        // SAFETY: both strings are NUL terminated and a null buffer queries the size
        let size = unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let error = io::Error::last_os_error();
            return if unsupported(&error) { Ok(None) } else { Err(error.into()) };
        }
        let mut buf = vec![0u8; size as usize];
        // SAFETY: buf is valid for buf.len() bytes
        let read = unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        if read < 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return if unsupported(&error) { Ok(None) } else { Err(error.into()) };
        }
        buf.truncate(read as usize);
        return Ok(Some(buf));
    }
}

fn lsetxattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    let path = c_path(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let name = c_name(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: value is valid for value.len() bytes
    let result = unsafe {
        libc::lsetxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0)
    };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn llistxattr(path: &Path) -> Result<Vec<String>> {
    let path = c_path(path)?;
    loop {
        // SAFETY: a null buffer queries the size
        let size = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let error = io::Error::last_os_error();
            return if unsupported(&error) { Ok(Vec::new()) } else { Err(error.into()) };
        }
        let mut buf = vec![0u8; size as usize];
        // SAFETY: buf is valid for buf.len() bytes
        let read = unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if read < 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(error.into());
        }
        buf.truncate(read as usize);
        return Ok(buf
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect());
    }
}

/// Extended attributes of `path` without following symlinks; ACLs are
/// handled separately
pub fn xattrs_get(path: &Path) -> Result<BTreeMap<String, XattrValue>> {
    let mut xattrs = BTreeMap::new();
    for name in llistxattr(path)? {
        if name == ACL_ACCESS || name == ACL_DEFAULT {
            continue;
        }
        if let Some(value) = lgetxattr(path, &name)? {
            xattrs.insert(name, XattrValue(value));
        }
    }
    Ok(xattrs)
}

/// Restore extended attributes; ones the filesystem or our privileges
/// do not allow are skipped with a warning
pub fn xattrs_set(path: &Path, xattrs: &BTreeMap<String, XattrValue>) -> Result<()> {
    for (name, value) in xattrs {
        if let Err(error) = lsetxattr(path, name, &value.0) {
            match error.raw_os_error() {
                Some(libc::ENOTSUP) | Some(libc::EACCES) | Some(libc::EPERM) => {
                    warn!(path = %path.display(), attribute = %name, "cannot restore xattr: {}", error);
                }
                _ => return Err(error.into()),
            }
        }
    }
    Ok(())
}

fn perms_to_text(perm: u16) -> String {
    let mut text = String::with_capacity(3);
    text.push(if perm & 4 != 0 { 'r' } else { '-' });
    text.push(if perm & 2 != 0 { 'w' } else { '-' });
    text.push(if perm & 1 != 0 { 'x' } else { '-' });
    text
}

fn perms_from_text(text: &str) -> Result<u16> {
    let mut perm = 0;
    for c in text.chars() {
        perm |= match c {
            'r' => 4,
            'w' => 2,
            'x' => 1,
            '-' => 0,
            _ => return Err(acl_error(format!("invalid permissions '{}'", text))),
        };
    }
    Ok(perm)
}

fn acl_error(reason: String) -> Error {
    Error::UnsupportedPayload { reason: format!("ACL: {}", reason) }
}

/// Binary ACL attribute to text, naming users and groups unless `numeric_owner`
fn acl_to_text(data: &[u8], numeric_owner: bool) -> Result<String> {
    if data.len() < 4 || (data.len() - 4) % 8 != 0 {
        return Err(acl_error(format!("bad attribute length {}", data.len())));
    }
    let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if version != ACL_EA_VERSION {
        return Err(acl_error(format!("unknown version {}", version)));
    }
    let mut lines = Vec::new();
    for entry in data[4..].chunks_exact(8) {
        let tag = u16::from_le_bytes([entry[0], entry[1]]);
        let perm = perms_to_text(u16::from_le_bytes([entry[2], entry[3]]));
        let id = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        let line = match tag {
            ACL_USER_OBJ => format!("user::{}", perm),
            ACL_GROUP_OBJ => format!("group::{}", perm),
            ACL_MASK => format!("mask::{}", perm),
            ACL_OTHER => format!("other::{}", perm),
            ACL_USER => {
                let name = if numeric_owner { None } else { uid2user(id) };
                format!("user:{}:{}:{}", name.unwrap_or_else(|| id.to_string()), perm, id)
            }
            ACL_GROUP => {
                let name = if numeric_owner { None } else { gid2group(id) };
                format!("group:{}:{}:{}", name.unwrap_or_else(|| id.to_string()), perm, id)
            }
            _ => return Err(acl_error(format!("unknown tag {:#x}", tag))),
        };
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

/// Text ACL back to the binary attribute; names win over the stored id
/// unless `numeric_owner` or the name is unknown here
fn acl_from_text(text: &str, numeric_owner: bool) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            return Err(acl_error(format!("bad entry '{}'", line)));
        }
        let qualified = !fields[1].is_empty();
        let stored_id = || -> Result<u32> {
            fields
                .get(3)
                .or(Some(&fields[1]))
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| acl_error(format!("missing id in '{}'", line)))
        };
        let (tag, id) = match (fields[0], qualified) {
            ("user", false) => (ACL_USER_OBJ, ACL_UNDEFINED_ID),
            ("group", false) => (ACL_GROUP_OBJ, ACL_UNDEFINED_ID),
            ("mask", _) => (ACL_MASK, ACL_UNDEFINED_ID),
            ("other", _) => (ACL_OTHER, ACL_UNDEFINED_ID),
            ("user", true) => {
                let local = if numeric_owner { None } else { user2uid(fields[1]) };
                (ACL_USER, match local {
                    Some(uid) => uid,
                    None => stored_id()?,
                })
            }
            ("group", true) => {
                let local = if numeric_owner { None } else { group2gid(fields[1]) };
                (ACL_GROUP, match local {
                    Some(gid) => gid,
                    None => stored_id()?,
                })
            }
            _ => return Err(acl_error(format!("bad entry '{}'", line))),
        };
        entries.push((tag, perms_from_text(fields[2])?, id));
    }
    entries.sort_by_key(|&(tag, _, id)| (tag, id));

    let mut data = Vec::with_capacity(4 + entries.len() * 8);
    data.extend_from_slice(&ACL_EA_VERSION.to_le_bytes());
    for (tag, perm, id) in entries {
        data.extend_from_slice(&tag.to_le_bytes());
        data.extend_from_slice(&perm.to_le_bytes());
        data.extend_from_slice(&id.to_le_bytes());
    }
    Ok(data)
}

/// Read the access and (for directories) default ACL of `path` into `item`
pub fn acl_get(path: &Path, item: &mut Item, numeric_owner: bool) -> Result<()> {
    if item.is_symlink() {
        return Ok(());
    }
    if let Some(data) = lgetxattr(path, ACL_ACCESS)? {
        item.acl_access = Some(acl_to_text(&data, numeric_owner)?);
    }
    if item.is_dir() {
        if let Some(data) = lgetxattr(path, ACL_DEFAULT)? {
            item.acl_default = Some(acl_to_text(&data, numeric_owner)?);
        }
    }
    Ok(())
}

pub fn acl_set(path: &Path, item: &Item, numeric_owner: bool) -> Result<()> {
    let acls = [(ACL_ACCESS, &item.acl_access), (ACL_DEFAULT, &item.acl_default)];
    for (name, text) in acls {
        let Some(text) = text else { continue };
        let data = acl_from_text(text, numeric_owner)?;
        if let Err(error) = lsetxattr(path, name, &data) {
            match error.raw_os_error() {
                Some(libc::ENOTSUP) | Some(libc::EPERM) => {
                    warn!(path = %path.display(), "cannot restore ACL: {}", error);
                }
                _ => return Err(error.into()),
            }
        }
    }
    Ok(())
}
