// src/core/identity.rs

//! Resolves user and group names to numeric ids, and reads the kernel peer
//! credentials of a connected Unix-domain client.
//!
//! The source protocol is specified in terms of FreeBSD's `xucred` structure,
//! which also carries a group list directly. The portable equivalent used
//! here is tokio's `UnixStream::peer_cred`, which yields a uid and a single
//! effective gid; the full group list is then expanded with `nix`'s
//! `getgrouplist`, matching what the kernel would have reported on the
//! originating platform.

use nix::unistd::{Group, User};
use std::collections::BTreeSet;
use tokio::net::UnixStream;

use crate::core::errors::QManagerError;

/// A resolved principal: a numeric uid plus the full set of numeric gids it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: u32,
    pub gids: BTreeSet<u32>,
}

/// Resolves a uid/gid argument that may be given as a decimal string or as a
/// system account/group name.
pub fn resolve_uid(spec: &str) -> Result<u32, QManagerError> {
    if let Ok(uid) = spec.parse::<u32>() {
        return Ok(uid);
    }
    User::from_name(spec)
        .map_err(|e| QManagerError::Identity(format!("looking up user '{spec}': {e}")))?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| QManagerError::Identity(format!("no such user '{spec}'")))
}

pub fn resolve_gid(spec: &str) -> Result<u32, QManagerError> {
    if let Ok(gid) = spec.parse::<u32>() {
        return Ok(gid);
    }
    Group::from_name(spec)
        .map_err(|e| QManagerError::Identity(format!("looking up group '{spec}': {e}")))?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| QManagerError::Identity(format!("no such group '{spec}'")))
}

/// Reads the kernel-reported credentials of the peer connected to `stream`
/// and expands its primary gid into the full supplementary group list.
pub fn peer_credentials(stream: &UnixStream) -> Result<Principal, QManagerError> {
    let cred = stream
        .peer_cred()
        .map_err(|e| QManagerError::Identity(format!("reading peer credentials: {e}")))?;
    let uid = cred.uid();
    let mut gids = BTreeSet::new();
    gids.insert(cred.gid());

    if let Ok(Some(user)) = User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        if let Ok(groups) = nix::unistd::getgrouplist(
            &std::ffi::CString::new(user.name.as_bytes()).unwrap_or_default(),
            nix::unistd::Gid::from_raw(cred.gid()),
        ) {
            gids.extend(groups.into_iter().map(|g| g.as_raw()));
        }
    }

    Ok(Principal { uid, gids })
}

/// The root-proxy rule: a peer connecting as uid 0 may ask to act on behalf
/// of another principal by supplying explicit `uid`/`gids` fields.
pub fn apply_root_proxy(
    peer: Principal,
    proxied_uid: Option<&str>,
    proxied_gids: Option<&[String]>,
) -> Result<Principal, QManagerError> {
    if peer.uid != 0 {
        return Ok(peer);
    }
    let Some(uid_spec) = proxied_uid else {
        return Ok(peer);
    };
    let uid = resolve_uid(uid_spec)?;
    let gids = match proxied_gids {
        Some(specs) => specs.iter().map(|s| resolve_gid(s)).collect::<Result<_, _>>()?,
        None => BTreeSet::new(),
    };
    Ok(Principal { uid, gids })
}
