//! Directory tree flattening
//!
//! Turns a remote folder listing (parent-linked, unordered) or a local
//! directory walk into flat lists of relative paths, ordered by depth so a
//! parent directory always comes before anything written inside it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::error::TransferError;
use super::paths::safe_component;
use super::types::{CloudFileDescriptor, DirectoryTree, RemoteFolder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatDirectory {
    pub uuid: String,
    pub relative_path: PathBuf,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatFile {
    pub file: CloudFileDescriptor,
    pub relative_path: PathBuf,
    /// Number of folders between the root and this file
    pub depth: usize,
}

/// A remote tree ready for transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatTree {
    pub directories: Vec<FlatDirectory>,
    pub files: Vec<FlatFile>,
}

impl FlatTree {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.file.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn depth_of(path: &Path) -> usize {
    path.components().count().saturating_sub(1)
}

/// `parent/name`, or `parent/name (n).ext` when an earlier entry already took it.
///
/// Distinct remote names can map to one local path (`a/b` and `a_b` after
/// sanitizing), and two files must never share a destination.
fn unique_child(parent: &Path, name: &str, taken: &mut HashSet<PathBuf>) -> PathBuf {
    let candidate = parent.join(name);
    if taken.insert(candidate.clone()) {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], Some(&name[i + 1..])),
        _ => (name, None),
    };
    let mut n = 1usize;
    loop {
        let renamed = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(renamed);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Resolve every folder's path relative to `root_uuid`.
///
/// Fails on a folder whose parent chain never reaches the root or loops.
fn resolve_folder_paths(
    root_uuid: &str,
    folders: &[RemoteFolder],
    taken: &mut HashSet<PathBuf>,
) -> Result<HashMap<String, PathBuf>, TransferError> {
    let by_uuid: HashMap<&str, &RemoteFolder> =
        folders.iter().map(|f| (f.uuid.as_str(), f)).collect();
    let mut resolved: HashMap<String, PathBuf> = HashMap::new();
    resolved.insert(root_uuid.to_string(), PathBuf::new());

    for folder in folders {
        if resolved.contains_key(&folder.uuid) {
            continue;
        }
        // Walk up until a resolved ancestor, then fill the chain back down
        let mut chain: Vec<&RemoteFolder> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = folder;
        let base = loop {
            if !seen.insert(current.uuid.as_str()) {
                return Err(TransferError::InvalidTree(format!(
                    "cycle through folder {}",
                    current.uuid
                )));
            }
            chain.push(current);
            if let Some(path) = resolved.get(&current.parent) {
                break path.clone();
            }
            current = by_uuid.get(current.parent.as_str()).copied().ok_or_else(|| {
                TransferError::InvalidTree(format!(
                    "folder {} has unknown parent {}",
                    current.uuid, current.parent
                ))
            })?;
        };

        let mut path = base;
        for f in chain.into_iter().rev() {
            path = unique_child(&path, &safe_component(&f.name), taken);
            resolved.insert(f.uuid.clone(), path.clone());
        }
    }

    Ok(resolved)
}

/// Flatten a remote listing rooted at `root_uuid`.
pub fn flatten(root_uuid: &str, tree: &DirectoryTree) -> Result<FlatTree, TransferError> {
    let mut taken = HashSet::new();
    let folder_paths = resolve_folder_paths(root_uuid, &tree.folders, &mut taken)?;

    let mut directories: Vec<FlatDirectory> = tree
        .folders
        .iter()
        .filter_map(|f| {
            folder_paths.get(&f.uuid).map(|p| FlatDirectory {
                uuid: f.uuid.clone(),
                relative_path: p.clone(),
                depth: depth_of(p),
            })
        })
        .collect();

    let mut files = Vec::with_capacity(tree.files.len());
    for entry in &tree.files {
        let parent = folder_paths.get(&entry.parent).ok_or_else(|| {
            TransferError::InvalidTree(format!(
                "file {} has unknown parent {}",
                entry.file.uuid, entry.parent
            ))
        })?;
        let relative_path = unique_child(parent, &safe_component(&entry.file.name), &mut taken);
        let mut file = entry.file.clone();
        file.parent_path = Some(parent.to_string_lossy().to_string());
        files.push(FlatFile {
            depth: depth_of(&relative_path),
            file,
            relative_path,
        });
    }

    // Stable: equal depths keep listing order
    directories.sort_by_key(|d| d.depth);
    files.sort_by_key(|f| f.depth);

    Ok(FlatTree { directories, files })
}

// ═══════════════════════════════════════════════════════════════════════════
// Local trees (directory upload)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub depth: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTree {
    pub directories: Vec<LocalEntry>,
    pub files: Vec<LocalEntry>,
}

impl LocalTree {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk `root` (blocking) without following symlinks. The root itself is not listed.
pub fn walk_local(root: &Path) -> Result<LocalTree, TransferError> {
    let mut tree = LocalTree::default();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| TransferError::InvalidSource(e.to_string()))?
            .to_path_buf();
        let depth = depth_of(&relative_path);
        if entry.file_type().is_dir() {
            tree.directories.push(LocalEntry {
                path: entry.path().to_path_buf(),
                relative_path,
                depth,
                size: 0,
            });
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            tree.files.push(LocalEntry {
                path: entry.path().to_path_buf(),
                relative_path,
                depth,
                size,
            });
        }
    }
    tree.directories.sort_by_key(|d| d.depth);
    tree.files.sort_by_key(|f| f.depth);
    Ok(tree)
}
