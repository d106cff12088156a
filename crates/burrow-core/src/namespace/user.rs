//! User namespace identity mapping.
//!
//! Maps the caller to root inside the container and, when the host grants
//! the caller a subordinate id block, maps the rest of the container's id
//! space onto that block. Maps are written from outside the namespace, by a
//! helper holding the target's process id.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

use burrow_common::constants::{SUBGID_PATH, SUBUID_PATH};
use burrow_common::error::{BurrowError, Result};
use nix::unistd::Pid;

/// Which of the two identity maps an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// `/proc/<pid>/uid_map`, programmed by `newuidmap`.
    User,
    /// `/proc/<pid>/gid_map`, programmed by `newgidmap`.
    Group,
}

impl IdKind {
    const fn registry(self) -> &'static str {
        match self {
            Self::User => SUBUID_PATH,
            Self::Group => SUBGID_PATH,
        }
    }

    const fn map_file(self) -> &'static str {
        match self {
            Self::User => "uid_map",
            Self::Group => "gid_map",
        }
    }

    const fn setuid_helper(self) -> &'static str {
        match self {
            Self::User => "newuidmap",
            Self::Group => "newgidmap",
        }
    }
}

/// A contiguous block of host ids delegated to a user in `/etc/subuid` or
/// `/etc/subgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubordinateRange {
    /// First host id of the block.
    pub start: u32,
    /// Number of ids in the block.
    pub count: u32,
}

/// One line of an identity map: `count` ids starting at `inside` in the
/// namespace correspond to ids starting at `outside` on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    /// First id inside the namespace.
    pub inside: u32,
    /// First id on the host.
    pub outside: u32,
    /// Length of the range.
    pub count: u32,
}

/// The identity of the unprivileged (or root) user starting a container,
/// captured before any namespace is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Effective uid on the host.
    pub uid: u32,
    /// Effective gid on the host.
    pub gid: u32,
    /// Login name, when the uid resolves to one.
    pub user: Option<String>,
}

impl CallerIdentity {
    /// Captures the calling process's effective identity.
    #[must_use]
    pub fn current() -> Self {
        let uid = nix::unistd::geteuid();
        let user = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name);
        Self {
            uid: uid.as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            user,
        }
    }

    const fn id(&self, kind: IdKind) -> u32 {
        match kind {
            IdKind::User => self.uid,
            IdKind::Group => self.gid,
        }
    }
}

/// Parses a subordinate id registry, returning every block delegated to
/// `user` (by login name) or to `uid` (by number).
///
/// Malformed lines are skipped.
#[must_use]
pub fn parse_subordinate_ranges(
    registry: &str,
    user: Option<&str>,
    uid: u32,
) -> Vec<SubordinateRange> {
    registry
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let owner = fields.next()?;
            let start = fields.next()?.trim().parse().ok()?;
            let count = fields.next()?.trim().parse().ok()?;
            let matches = user.is_some_and(|u| u == owner) || owner.parse::<u32>() == Ok(uid);
            matches.then_some(SubordinateRange { start, count })
        })
        .filter(|r| r.count > 0)
        .collect()
}

/// Computes the identity map for `caller_id`.
///
/// Inside id 0 is always the caller. Subordinate blocks follow from inside
/// id 1 on, with the caller's own host id cut out of them because the
/// kernel rejects maps whose host ranges overlap. Without any block the map
/// is the single entry `0 <caller> 1`, or the whole id space when the caller
/// is root.
#[must_use]
pub fn plan_identity_map(caller_id: u32, ranges: &[SubordinateRange]) -> Vec<IdMapEntry> {
    if ranges.is_empty() {
        let count = if caller_id == 0 { u32::MAX } else { 1 };
        return vec![IdMapEntry {
            inside: 0,
            outside: caller_id,
            count,
        }];
    }

    let mut entries = vec![IdMapEntry {
        inside: 0,
        outside: caller_id,
        count: 1,
    }];
    let mut next_inside: u32 = 1;
    let mut push = |outside: u32, count: u32| {
        if count == 0 {
            return;
        }
        // Clamp so the inside range never wraps past u32::MAX.
        let count = count.min(u32::MAX - next_inside);
        if count == 0 {
            return;
        }
        entries.push(IdMapEntry {
            inside: next_inside,
            outside,
            count,
        });
        next_inside += count;
    };

    for range in ranges {
        let end = u64::from(range.start) + u64::from(range.count);
        if (u64::from(range.start)..end).contains(&u64::from(caller_id)) {
            push(range.start, caller_id - range.start);
            let after = caller_id.saturating_add(1);
            let remaining = u32::try_from(end - u64::from(after)).unwrap_or(u32::MAX);
            push(after, remaining);
        } else {
            push(range.start, range.count);
        }
    }
    entries
}

/// Renders entries in the `/proc/<pid>/uid_map` line format.
#[must_use]
pub fn render_identity_map(entries: &[IdMapEntry]) -> String {
    entries.iter().fold(String::new(), |mut out, e| {
        let _ = writeln!(out, "{} {} {}", e.inside, e.outside, e.count);
        out
    })
}

/// Programs the uid and gid maps of `pid`, which must have unshared a user
/// namespace without having written its maps yet.
///
/// # Errors
///
/// Returns an error if either map cannot be written; the container cannot
/// start without valid ownership inside.
pub fn map_identities(pid: Pid, caller: &CallerIdentity) -> Result<()> {
    map_one(pid, caller, IdKind::User)?;
    map_one(pid, caller, IdKind::Group)?;
    Ok(())
}

fn map_one(pid: Pid, caller: &CallerIdentity, kind: IdKind) -> Result<()> {
    let registry = match std::fs::read_to_string(kind.registry()) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(BurrowError::io(kind.registry(), e)),
    };
    let ranges = parse_subordinate_ranges(&registry, caller.user.as_deref(), caller.uid);
    let id = caller.id(kind);
    let entries = plan_identity_map(id, &ranges);

    if caller.uid != 0 && entries.len() > 1 {
        match run_setuid_helper(kind, pid, &entries) {
            Ok(()) => return Ok(()),
            Err(e) => tracing::warn!(
                error = %e,
                helper = kind.setuid_helper(),
                "subordinate mapping failed, mapping the caller only"
            ),
        }
        let single = plan_identity_map(id, &[]);
        return write_map(pid, kind, &single, caller.uid != 0);
    }
    write_map(pid, kind, &entries, caller.uid != 0)
}

fn run_setuid_helper(kind: IdKind, pid: Pid, entries: &[IdMapEntry]) -> Result<()> {
    let helper = kind.setuid_helper();
    let mut cmd = Command::new(helper);
    let _ = cmd.arg(pid.to_string());
    for e in entries {
        let _ = cmd.args([e.inside.to_string(), e.outside.to_string(), e.count.to_string()]);
    }
    let status = cmd.status().map_err(|e| BurrowError::io(helper, e))?;
    if !status.success() {
        return Err(BurrowError::Config {
            message: format!("{helper} exited with {status}"),
        });
    }
    tracing::debug!(%pid, helper, entries = entries.len(), "identity map written by helper");
    Ok(())
}

fn write_map(pid: Pid, kind: IdKind, entries: &[IdMapEntry], unprivileged: bool) -> Result<()> {
    let proc_dir = Path::new("/proc").join(pid.to_string());

    // The kernel refuses an unprivileged gid_map until setgroups is denied.
    if kind == IdKind::Group && unprivileged {
        let setgroups = proc_dir.join("setgroups");
        std::fs::write(&setgroups, "deny").map_err(|e| BurrowError::io(setgroups, e))?;
    }

    let map_path = proc_dir.join(kind.map_file());
    std::fs::write(&map_path, render_identity_map(entries))
        .map_err(|e| BurrowError::io(map_path, e))?;
    tracing::debug!(%pid, map = kind.map_file(), entries = entries.len(), "identity map written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "\
# delegated ranges
root:10000:65536
ada:100000:65536
1001:200000:65536
broken-line
";

    #[test]
    fn finds_range_by_user_name() {
        let ranges = parse_subordinate_ranges(REGISTRY, Some("ada"), 1000);
        assert_eq!(ranges, vec![SubordinateRange { start: 100_000, count: 65536 }]);
    }

    #[test]
    fn finds_range_by_numeric_uid() {
        let ranges = parse_subordinate_ranges(REGISTRY, Some("bob"), 1001);
        assert_eq!(ranges, vec![SubordinateRange { start: 200_000, count: 65536 }]);
    }

    #[test]
    fn no_match_yields_no_ranges() {
        assert!(parse_subordinate_ranges(REGISTRY, Some("eve"), 4242).is_empty());
        assert!(parse_subordinate_ranges("", None, 1000).is_empty());
    }

    #[test]
    fn caller_maps_to_root_and_block_follows() {
        let ranges = [SubordinateRange { start: 100_000, count: 65536 }];
        let map = plan_identity_map(1000, &ranges);
        assert_eq!(
            render_identity_map(&map),
            "0 1000 1\n1 100000 65536\n"
        );
    }

    #[test]
    fn caller_inside_its_own_block_is_cut_out() {
        let ranges = [SubordinateRange { start: 100_000, count: 65536 }];
        let map = plan_identity_map(100_000, &ranges);
        assert_eq!(
            map,
            vec![
                IdMapEntry { inside: 0, outside: 100_000, count: 1 },
                IdMapEntry { inside: 1, outside: 100_001, count: 65535 },
            ]
        );
        assert_eq!(render_identity_map(&map), "0 100000 1\n1 100001 65535\n");
    }

    #[test]
    fn caller_in_the_middle_of_a_block_splits_it() {
        let ranges = [SubordinateRange { start: 100, count: 10 }];
        let map = plan_identity_map(104, &ranges);
        assert_eq!(
            map,
            vec![
                IdMapEntry { inside: 0, outside: 104, count: 1 },
                IdMapEntry { inside: 1, outside: 100, count: 4 },
                IdMapEntry { inside: 5, outside: 105, count: 5 },
            ]
        );
    }

    #[test]
    fn fallback_maps_only_the_caller() {
        assert_eq!(
            plan_identity_map(1000, &[]),
            vec![IdMapEntry { inside: 0, outside: 1000, count: 1 }]
        );
    }

    #[test]
    fn fallback_for_root_covers_the_whole_id_space() {
        assert_eq!(render_identity_map(&plan_identity_map(0, &[])), "0 0 4294967295\n");
    }
}
