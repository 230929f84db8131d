//! Merkle input-tree construction.
//!
//! Builds the content-addressed directory tree REAPI uses to describe an
//! action's inputs, from the exec-root-relative entries HashFS hands
//! back. Directory messages are encoded deterministically (children
//! sorted by name), so the root digest is stable across runs.

use std::collections::BTreeMap;

use bx_digest::Digest;
use bx_hashfs::FileEntry;

use crate::encode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirNode {
    pub name: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("path conflict at {0}: both file and directory")]
    Conflict(String),

    #[error("invalid input path: {0}")]
    InvalidPath(String),
}

/// A built input tree: the root digest plus every blob needed to
/// reproduce it remotely.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub root_digest: Digest,
    /// Encoded directory messages, keyed by their digest.
    pub tree_blobs: Vec<(Digest, Vec<u8>)>,
    /// Content digests of every regular file in the tree.
    pub file_digests: Vec<Digest>,
}

#[derive(Default)]
struct Node {
    dirs: BTreeMap<String, Node>,
    files: BTreeMap<String, (Digest, bool)>,
    symlinks: BTreeMap<String, String>,
}

impl Node {
    fn subdir(&mut self, name: &str, path: &str) -> Result<&mut Node, MerkleError> {
        if self.files.contains_key(name) {
            return Err(MerkleError::Conflict(path.to_string()));
        }
        Ok(self.dirs.entry(name.to_string()).or_default())
    }
}

/// Build a Merkle tree from exec-root-relative entries. Intermediate
/// directories are created implicitly; explicit directory entries are
/// accepted and merged.
pub fn build(entries: &[(String, FileEntry)]) -> Result<MerkleTree, MerkleError> {
    let mut root = Node::default();
    for (path, entry) in entries {
        if path.is_empty() || path == "." {
            continue;
        }
        if path.starts_with('/') || path.split('/').any(|c| c == ".." || c.is_empty()) {
            return Err(MerkleError::InvalidPath(path.clone()));
        }
        let mut cur = &mut root;
        let comps: Vec<&str> = path.split('/').collect();
        for comp in &comps[..comps.len() - 1] {
            cur = cur.subdir(comp, path)?;
        }
        let name = comps[comps.len() - 1];
        match entry {
            FileEntry::Regular(r) => {
                if cur.dirs.contains_key(name) {
                    return Err(MerkleError::Conflict(path.clone()));
                }
                cur.files
                    .insert(name.to_string(), (r.digest, r.executable));
            }
            FileEntry::Symlink(s) => {
                cur.symlinks.insert(name.to_string(), s.target.clone());
            }
            FileEntry::Directory { .. } => {
                cur.subdir(name, path)?;
            }
        }
    }

    let mut out = MerkleTree {
        root_digest: Digest::empty(),
        tree_blobs: Vec::new(),
        file_digests: Vec::new(),
    };
    out.root_digest = encode_node(&root, &mut out);
    Ok(out)
}

fn encode_node(node: &Node, out: &mut MerkleTree) -> Digest {
    let files: Vec<FileNode> = node
        .files
        .iter()
        .map(|(name, (digest, is_executable))| FileNode {
            name: name.clone(),
            digest: *digest,
            is_executable: *is_executable,
        })
        .collect();
    for f in &files {
        out.file_digests.push(f.digest);
    }
    let dirs: Vec<DirNode> = node
        .dirs
        .iter()
        .map(|(name, child)| DirNode {
            name: name.clone(),
            digest: encode_node(child, out),
        })
        .collect();
    let symlinks: Vec<SymlinkNode> = node
        .symlinks
        .iter()
        .map(|(name, target)| SymlinkNode {
            name: name.clone(),
            target: target.clone(),
        })
        .collect();
    let encoded = encode::directory(&files, &dirs, &symlinks);
    let digest = Digest::from_bytes(&encoded);
    out.tree_blobs.push((digest, encoded));
    digest
}
