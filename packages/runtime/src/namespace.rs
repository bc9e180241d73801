//! Guest filesystem namespace.
//!
//! A [`MountTable`] maps guest-visible absolute paths to host URIs. Workspace
//! folders come first, the runtime root is always the last mount at `/`:
//!
//! ```text
//! one folder          several (or no) folders
//! /workspace  -> F    /workspaces/<name> -> F1
//! /           -> R    /workspaces/<name> -> F2
//!                     /                  -> R
//! ```
//!
//! Host URIs are matched by string prefix on their serialized form, so two
//! URIs that differ only in percent-encoding do not match.

use url::Url;

use crate::resolver::RuntimeLocation;

/// Guest path of the workspace when exactly one folder is open.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Parent of the per-folder mounts when zero or several folders are open.
pub const WORKSPACES_ROOT: &str = "/workspaces";

/// Library directory appended to the guest search path.
pub const SITE_PACKAGES: &str = "/site-packages";

/// A folder open in the host workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFolder {
    pub name: String,
    pub uri: Url,
}

impl WorkspaceFolder {
    pub fn new(name: impl Into<String>, uri: Url) -> Self {
        Self {
            name: name.into(),
            uri,
        }
    }
}

/// One guest path backed by a host directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceMount {
    pub guest_path: String,
    pub host_uri: Url,
}

impl NamespaceMount {
    pub fn new(guest_path: impl Into<String>, host_uri: Url) -> Self {
        Self {
            guest_path: guest_path.into(),
            host_uri,
        }
    }
}

/// Ordered mount table for one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<NamespaceMount>,
    workspace_mounts: usize,
}

impl MountTable {
    /// Build the table for the given folders and runtime location.
    pub fn compute(folders: &[WorkspaceFolder], location: &RuntimeLocation) -> Self {
        let mut mounts = Vec::with_capacity(folders.len() + 1);
        if let [folder] = folders {
            mounts.push(NamespaceMount::new(WORKSPACE_MOUNT, folder.uri.clone()));
        } else {
            for folder in folders {
                mounts.push(NamespaceMount::new(
                    format!("{}/{}", WORKSPACES_ROOT, folder.name),
                    folder.uri.clone(),
                ));
            }
        }
        let workspace_mounts = mounts.len();
        mounts.push(NamespaceMount::new("/", location.root()));

        Self {
            mounts,
            workspace_mounts,
        }
    }

    /// All mounts, runtime root last.
    pub fn mounts(&self) -> &[NamespaceMount] {
        &self.mounts
    }

    /// The workspace folder mounts only.
    pub fn workspace_mounts(&self) -> &[NamespaceMount] {
        &self.mounts[..self.workspace_mounts]
    }

    /// The guest path of a host file inside one of the workspace mounts.
    ///
    /// The host URI must start with a folder's URI and continue at a path
    /// segment boundary.
    pub fn translate(&self, uri: &Url) -> Option<String> {
        let target = uri.as_str();
        self.workspace_mounts().iter().find_map(|mount| {
            let prefix = mount.host_uri.as_str();
            let suffix = target.strip_prefix(prefix)?;
            let on_boundary = suffix.is_empty() || suffix.starts_with('/') || prefix.ends_with('/');
            on_boundary.then(|| join_guest_path(&mount.guest_path, suffix))
        })
    }

    /// The host URI behind a guest path, using the most specific mount.
    pub fn resolve(&self, guest_path: &str) -> Option<Url> {
        let path = normalize_guest_path(guest_path);
        let mount = self
            .mounts
            .iter()
            .filter(|mount| is_within(&path, &mount.guest_path))
            .max_by_key(|mount| mount.guest_path.len())?;
        let relative = path[mount.guest_path.len()..].trim_start_matches('/');
        Some(join_uri(&mount.host_uri, relative))
    }

    /// Value for the guest's module search path variable.
    pub fn search_path(&self) -> String {
        self.workspace_mounts()
            .iter()
            .map(|mount| mount.guest_path.as_str())
            .chain(std::iter::once(SITE_PACKAGES))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn is_within(path: &str, mount: &str) -> bool {
    mount == "/"
        || path == mount
        || path
            .strip_prefix(mount)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Join a (possibly relative) path onto a guest directory and normalize it.
pub fn join_guest_path(base: &str, path: &str) -> String {
    if path.starts_with('/') && base == "/" {
        return normalize_guest_path(path);
    }
    normalize_guest_path(&format!("{}/{}", base, path))
}

/// Collapse `.`, `..` and repeated separators in an absolute guest path.
pub fn normalize_guest_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Append a relative path to a URI's path.
pub fn join_uri(base: &Url, relative: &str) -> Url {
    let relative = relative.trim_matches('/');
    let mut url = base.clone();
    if relative.is_empty() {
        return url;
    }
    let path = format!("{}/{}", base.path().trim_end_matches('/'), relative);
    url.set_path(&path);
    url
}
