use std::path::{Path, PathBuf};

/// Kind of a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    /// A directory on the local disk.
    Local,
    /// Served by a peer process over the remote command bus.
    Remote,
    /// Read-only platform asset bundle.
    Bundle,
}

#[derive(Debug, Clone)]
pub(crate) struct MountPoint {
    pub kind: MountType,
    /// Disk root for `Local` and `Bundle` mounts; unused for `Remote`.
    pub root: PathBuf,
    pub alias: String,
    pub watch: bool,
}

/// Path prefix that maps to the platform bundle when no alias matches
/// (mobile convention).
pub(crate) const BUNDLE_PREFIX: &str = "assets/";

pub(crate) fn strip_leading_slash(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Finds the mount whose alias is the longest prefix of `path` (leading
/// slash already stripped), respecting segment boundaries.
pub(crate) fn find_mount<'a>(mounts: &'a [MountPoint], path: &str) -> Option<(&'a MountPoint, String)> {
    let mut best: Option<(&MountPoint, usize)> = None;
    for mount in mounts {
        let alias = mount.alias.as_str();
        let matches = path == alias
            || (path.starts_with(alias) && path.as_bytes().get(alias.len()) == Some(&b'/'));
        if matches && best.map_or(true, |(_, len)| alias.len() > len) {
            best = Some((mount, alias.len()));
        }
    }

    if let Some((mount, len)) = best {
        let tail = path[len..].trim_start_matches('/');
        return Some((mount, tail.to_owned()));
    }

    // Mobile convention: an `assets/` prefix falls through to the bundle.
    if let Some(tail) = path.strip_prefix(BUNDLE_PREFIX) {
        if let Some(mount) = mounts.iter().find(|m| m.kind == MountType::Bundle) {
            return Some((mount, tail.to_owned()));
        }
    }

    None
}

/// Rewrites `path` to `mount.root + tail`. Paths that match no mount pass
/// through unchanged.
pub(crate) fn resolve(mounts: &[MountPoint], path: &str) -> PathBuf {
    let stripped = strip_leading_slash(path);
    match find_mount(mounts, stripped) {
        Some((mount, tail)) => mount.root.join(tail),
        None => PathBuf::from(path),
    }
}

/// Strips the mount portion off a path, returning it alias-relative.
/// Accepts both resolved disk paths (`root/tail`) and alias paths
/// (`/alias/tail`).
pub(crate) fn strip_mount(mounts: &[MountPoint], path: &str) -> String {
    let as_path = Path::new(path);
    let mut best: Option<(usize, String)> = None;
    for mount in mounts {
        if let Ok(tail) = as_path.strip_prefix(&mount.root) {
            let root_len = mount.root.as_os_str().len();
            if best.as_ref().map_or(true, |(len, _)| root_len > *len) {
                best = Some((root_len, tail.to_string_lossy().replace('\\', "/")));
            }
        }
    }
    if let Some((_, tail)) = best {
        return tail;
    }

    let stripped = strip_leading_slash(path);
    match find_mount(mounts, stripped) {
        Some((_, tail)) => tail,
        None => stripped.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts() -> Vec<MountPoint> {
        vec![
            MountPoint {
                kind: MountType::Local,
                root: PathBuf::from("/srv/data"),
                alias: "data".to_owned(),
                watch: false,
            },
            MountPoint {
                kind: MountType::Local,
                root: PathBuf::from("/srv/data-hd"),
                alias: "data/hd".to_owned(),
                watch: false,
            },
            MountPoint {
                kind: MountType::Bundle,
                root: PathBuf::from("/bundle"),
                alias: "bundle".to_owned(),
                watch: false,
            },
        ]
    }

    #[test]
    fn longest_alias_wins() {
        let mounts = mounts();
        assert_eq!(
            resolve(&mounts, "/data/hd/img.png"),
            PathBuf::from("/srv/data-hd/img.png")
        );
        assert_eq!(
            resolve(&mounts, "/data/img.png"),
            PathBuf::from("/srv/data/img.png")
        );
    }

    #[test]
    fn unmatched_paths_pass_through() {
        let mounts = mounts();
        assert_eq!(resolve(&mounts, "misc/file.txt"), PathBuf::from("misc/file.txt"));
    }

    #[test]
    fn alias_must_end_on_a_segment() {
        let mounts = mounts();
        // "database" must not match the "data" alias.
        assert_eq!(
            resolve(&mounts, "/database/x"),
            PathBuf::from("/database/x")
        );
    }

    #[test]
    fn assets_prefix_maps_to_bundle() {
        let mounts = mounts();
        assert_eq!(
            resolve(&mounts, "assets/tex.ktx"),
            PathBuf::from("/bundle/tex.ktx")
        );
    }

    #[test]
    fn strip_resolve_round_trip() {
        let mounts = mounts();
        for path in ["/data/img/a.png", "/data/hd/b.png", "/bundle/c.bin"] {
            let resolved = resolve(&mounts, path);
            let stripped = strip_mount(&mounts, &resolved.to_string_lossy());
            let (_, tail) = find_mount(&mounts, strip_leading_slash(path)).unwrap();
            assert_eq!(stripped, tail);
        }
    }
}
