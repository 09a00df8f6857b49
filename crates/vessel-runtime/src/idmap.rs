//! Subordinate ID ranges and reverse user-namespace mappings.
//!
//! A rootless runtime runs inside a user namespace where the invoking user is
//! root and the subordinate range occupies IDs `1..`. The reverse mapping
//! handed to the container puts the user back at their own ID:
//! host 1001 -> helper namespace 0 -> container 1001.

use crate::RuntimeError;
use std::path::{Path, PathBuf};
use vessel_schema::IdMapping;

/// Every container must be able to map IDs `0..65536` so that `nobody` resolves.
pub const MIN_SUBID_RANGE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u32,
    pub size: u32,
}

/// One of `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone)]
pub struct SubIdRegistry {
    path: PathBuf,
    kind: &'static str,
}

impl SubIdRegistry {
    pub fn subuid(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: "subuid",
        }
    }

    pub fn subgid(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: "subgid",
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Parse `owner:start:count` lines. Blank lines, comments and malformed
    /// entries are skipped.
    pub fn parse(content: &str) -> Vec<(String, IdRange)> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.split(':');
                let owner = fields.next()?;
                let start = fields.next()?.trim().parse().ok()?;
                let size = fields.next()?.trim().parse().ok()?;
                if owner.is_empty() || fields.next().is_some() {
                    return None;
                }
                Some((owner.to_owned(), IdRange { start, size }))
            })
            .collect()
    }

    /// First range owned by `uid` or `username`.
    pub fn lookup(&self, uid: u32, username: Option<&str>) -> Result<IdRange, RuntimeError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| RuntimeError::SubIdRead {
            path: self.path.clone(),
            source: e,
        })?;
        let uid_str = uid.to_string();
        Self::parse(&content)
            .into_iter()
            .find(|(owner, _)| *owner == uid_str || Some(owner.as_str()) == username)
            .map(|(_, range)| range)
            .ok_or_else(|| RuntimeError::SubIdNotFound {
                kind: self.kind,
                user: username.map_or(uid_str.clone(), str::to_owned),
                path: self.path.clone(),
            })
    }
}

fn mapping(container_id: u32, host_id: u32, size: u32) -> IdMapping {
    IdMapping {
        container_id,
        host_id,
        size,
    }
}

/// Mapping that gives container ID `id` the helper namespace's root (host
/// side 0) and fills `0..range_size` from the subordinate IDs at 1 and up.
/// Zero-sized ranges are omitted.
pub fn reverse_id_map(id: u32, range_size: u32) -> Vec<IdMapping> {
    let maps = if id < range_size {
        vec![
            mapping(0, 1, id),
            mapping(id, 0, 1),
            mapping(id + 1, id + 1, range_size - id - 1),
        ]
    } else {
        vec![mapping(0, 1, range_size), mapping(id, 0, 1)]
    };
    maps.into_iter().filter(|m| m.size > 0).collect()
}

/// uid and gid reverse mappings for `uid`/`gid` given their subordinate ranges.
pub fn reverse_user_maps(
    uid: u32,
    gid: u32,
    uid_range: IdRange,
    gid_range: IdRange,
) -> Result<(Vec<IdMapping>, Vec<IdMapping>), RuntimeError> {
    for (kind, range) in [("subuid", uid_range), ("subgid", gid_range)] {
        if range.size < MIN_SUBID_RANGE {
            return Err(RuntimeError::RangeTooSmall {
                kind,
                size: range.size,
                min: MIN_SUBID_RANGE,
            });
        }
    }
    Ok((
        reverse_id_map(uid, uid_range.size),
        reverse_id_map(gid, gid_range.size),
    ))
}

/// Host-side ID (as seen from the helper namespace) for `container_id`.
pub fn helper_id_for(mappings: &[IdMapping], container_id: u32) -> Option<u32> {
    mappings.iter().find_map(|m| {
        let offset = container_id.checked_sub(m.container_id)?;
        (offset < m.size).then(|| m.host_id + offset)
    })
}
