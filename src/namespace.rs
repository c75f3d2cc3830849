//! In-memory namespace tree.
//!
//! Inodes live in an arena keyed by id; directories hold a name-ordered map of
//! child ids and every non-root inode records its parent id. Paths are
//! absolute, case-sensitive, and must not contain empty segments.

use std::collections::{BTreeMap, HashMap};

use crate::block::BlockInfo;
use crate::{FsMetaError, FsMetaResult};

pub type InodeId = u64;

pub const ROOT_INODE_ID: InodeId = 1;

#[derive(Debug, Clone, Default)]
pub struct DirNode {
    pub children: BTreeMap<String, InodeId>,
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub replication: u16,
    pub under_construction: bool,
    pub blocks: Vec<BlockInfo>,
}

impl FileNode {
    /// Total file length: the sum of all block lengths. While the trailing
    /// block is under construction its `len` is the last synced length, so
    /// un-synced write progress is not counted.
    pub fn len(&self) -> u64 {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum InodeBody {
    Dir(DirNode),
    File(FileNode),
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub id: InodeId,
    pub name: String,
    pub parent: Option<InodeId>,
    pub body: InodeBody,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        matches!(self.body, InodeBody::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match &self.body {
            InodeBody::Dir(d) => Some(d),
            InodeBody::File(_) => None,
        }
    }

    fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
        match &mut self.body {
            InodeBody::Dir(d) => Some(d),
            InodeBody::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.body {
            InodeBody::File(f) => Some(f),
            InodeBody::Dir(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileNode> {
        match &mut self.body {
            InodeBody::File(f) => Some(f),
            InodeBody::Dir(_) => None,
        }
    }
}

pub struct NamespaceTree {
    nodes: HashMap<InodeId, Inode>,
    next_inode_id: InodeId,
}

impl NamespaceTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE_ID,
            Inode {
                id: ROOT_INODE_ID,
                name: "/".to_string(),
                parent: None,
                body: InodeBody::Dir(DirNode::default()),
            },
        );
        Self {
            nodes,
            next_inode_id: ROOT_INODE_ID + 1,
        }
    }

    /// Rebuild a tree from checkpointed inodes. Child maps must already be
    /// populated; this validates the root, parent/child agreement and
    /// acyclicity before accepting the arena.
    pub fn from_parts(nodes: HashMap<InodeId, Inode>, next_inode_id: InodeId) -> FsMetaResult<Self> {
        let root = nodes
            .get(&ROOT_INODE_ID)
            .ok_or_else(|| FsMetaError::CorruptCheckpoint("missing root inode".to_string()))?;
        if !root.is_dir() || root.parent.is_some() {
            return Err(FsMetaError::CorruptCheckpoint(
                "root inode is not a parentless directory".to_string(),
            ));
        }
        for node in nodes.values() {
            match node.parent {
                None => {
                    if node.id != ROOT_INODE_ID {
                        return Err(FsMetaError::CorruptCheckpoint(format!(
                            "inode {} has no parent",
                            node.id
                        )));
                    }
                }
                Some(pid) => {
                    let parent = nodes.get(&pid).ok_or_else(|| {
                        FsMetaError::CorruptCheckpoint(format!(
                            "inode {} references missing parent {}",
                            node.id, pid
                        ))
                    })?;
                    let dir = parent.as_dir().ok_or_else(|| {
                        FsMetaError::CorruptCheckpoint(format!(
                            "inode {} has non-directory parent {}",
                            node.id, pid
                        ))
                    })?;
                    if dir.children.get(&node.name) != Some(&node.id) {
                        return Err(FsMetaError::CorruptCheckpoint(format!(
                            "parent {} does not list child {} as {:?}",
                            pid, node.id, node.name
                        )));
                    }
                }
            }
        }
        let tree = Self {
            nodes,
            next_inode_id,
        };
        // walking to the root from every node also rules out cycles
        for id in tree.nodes.keys() {
            tree.path_of(*id)?;
        }
        Ok(tree)
    }

    fn alloc_id(&mut self) -> InodeId {
        let id = self.next_inode_id;
        self.next_inode_id += 1;
        id
    }

    pub fn next_inode_id(&self) -> InodeId {
        self.next_inode_id
    }

    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.nodes.get(&id)
    }

    pub fn inode_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Inode> {
        self.nodes.values()
    }

    fn split_segments(path: &str) -> FsMetaResult<Vec<&str>> {
        if !path.starts_with('/') {
            return Err(FsMetaError::InvalidPath(format!(
                "path must be absolute: {:?}",
                path
            )));
        }
        if path == "/" {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for seg in path[1..].split('/') {
            if seg.is_empty() {
                return Err(FsMetaError::InvalidPath(format!(
                    "empty segment in {:?}",
                    path
                )));
            }
            segments.push(seg);
        }
        Ok(segments)
    }

    fn child_of(&self, dir_id: InodeId, name: &str, path: &str) -> FsMetaResult<InodeId> {
        let node = self
            .nodes
            .get(&dir_id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", dir_id)))?;
        let dir = node
            .as_dir()
            .ok_or_else(|| FsMetaError::NotDirectory(format!("{} in {}", node.name, path)))?;
        dir.children
            .get(name)
            .copied()
            .ok_or_else(|| FsMetaError::NotFound(path.to_string()))
    }

    pub fn resolve(&self, path: &str) -> FsMetaResult<InodeId> {
        let mut cur = ROOT_INODE_ID;
        for seg in Self::split_segments(path)? {
            cur = self.child_of(cur, seg, path)?;
        }
        Ok(cur)
    }

    /// Absolute path of an inode, rebuilt by walking parent links.
    pub fn path_of(&self, id: InodeId) -> FsMetaResult<String> {
        if id == ROOT_INODE_ID {
            return Ok("/".to_string());
        }
        let mut names = Vec::new();
        let mut cur = id;
        let mut hops = 0usize;
        loop {
            let node = self
                .nodes
                .get(&cur)
                .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", cur)))?;
            match node.parent {
                None => break,
                Some(pid) => {
                    names.push(node.name.clone());
                    cur = pid;
                }
            }
            hops += 1;
            if hops > self.nodes.len() {
                return Err(FsMetaError::CorruptCheckpoint(format!(
                    "cycle reached from inode {}",
                    id
                )));
            }
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Create a directory and any missing ancestors. Existing directories on
    /// the way are fine; an existing file is not.
    /// Returns the final directory id and the ids created, parent-first.
    pub fn mkdir_p(&mut self, path: &str) -> FsMetaResult<(InodeId, Vec<InodeId>)> {
        let segments = Self::split_segments(path)?;
        let mut cur = ROOT_INODE_ID;
        let mut created = Vec::new();
        for seg in segments {
            let existing = {
                let node = self
                    .nodes
                    .get(&cur)
                    .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", cur)))?;
                let dir = node
                    .as_dir()
                    .ok_or_else(|| FsMetaError::NotDirectory(format!("{} in {}", node.name, path)))?;
                dir.children.get(seg).copied()
            };
            match existing {
                Some(child) => {
                    cur = child;
                }
                None => {
                    let id = self.alloc_id();
                    self.nodes.insert(
                        id,
                        Inode {
                            id,
                            name: seg.to_string(),
                            parent: Some(cur),
                            body: InodeBody::Dir(DirNode::default()),
                        },
                    );
                    if let Some(dir) = self.nodes.get_mut(&cur).and_then(Inode::as_dir_mut) {
                        dir.children.insert(seg.to_string(), id);
                    }
                    created.push(id);
                    cur = id;
                }
            }
        }
        Ok((cur, created))
    }

    /// Create a file under an existing parent directory. The file starts
    /// under construction with an empty block list.
    pub fn create_file(&mut self, path: &str, replication: u16) -> FsMetaResult<InodeId> {
        let segments = Self::split_segments(path)?;
        let name = segments
            .last()
            .copied()
            .ok_or_else(|| FsMetaError::InvalidPath("cannot create a file at /".to_string()))?;
        let mut parent = ROOT_INODE_ID;
        for seg in &segments[..segments.len() - 1] {
            parent = self.child_of(parent, seg, path)?;
        }
        {
            let node = self
                .nodes
                .get(&parent)
                .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", parent)))?;
            let dir = node
                .as_dir()
                .ok_or_else(|| FsMetaError::NotDirectory(format!("{} in {}", node.name, path)))?;
            if dir.children.contains_key(name) {
                return Err(FsMetaError::AlreadyExists(path.to_string()));
            }
        }
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            Inode {
                id,
                name: name.to_string(),
                parent: Some(parent),
                body: InodeBody::File(FileNode {
                    replication,
                    under_construction: true,
                    blocks: Vec::new(),
                }),
            },
        );
        if let Some(dir) = self.nodes.get_mut(&parent).and_then(Inode::as_dir_mut) {
            dir.children.insert(name.to_string(), id);
        }
        Ok(id)
    }

    pub fn list_children(&self, path: &str) -> FsMetaResult<Vec<String>> {
        let id = self.resolve(path)?;
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", id)))?;
        let dir = node
            .as_dir()
            .ok_or_else(|| FsMetaError::NotDirectory(path.to_string()))?;
        Ok(dir.children.keys().cloned().collect())
    }

    pub fn file(&self, path: &str) -> FsMetaResult<&FileNode> {
        let id = self.resolve(path)?;
        self.nodes
            .get(&id)
            .and_then(Inode::as_file)
            .ok_or_else(|| FsMetaError::NotAFile(path.to_string()))
    }

    pub fn file_mut(&mut self, path: &str) -> FsMetaResult<&mut FileNode> {
        let id = self.resolve(path)?;
        self.nodes
            .get_mut(&id)
            .and_then(Inode::as_file_mut)
            .ok_or_else(|| FsMetaError::NotAFile(path.to_string()))
    }

    fn unlink(&mut self, id: InodeId) -> FsMetaResult<Inode> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", id)))?;
        if let Some(pid) = node.parent {
            if let Some(dir) = self.nodes.get_mut(&pid).and_then(Inode::as_dir_mut) {
                dir.children.remove(&node.name);
            }
        }
        Ok(node)
    }

    /// Remove a file inode. Returns the removed inode so a caller can undo.
    pub fn delete_file(&mut self, path: &str) -> FsMetaResult<Inode> {
        let id = self.resolve(path)?;
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", id)))?;
        if node.is_dir() {
            return Err(FsMetaError::NotAFile(path.to_string()));
        }
        self.unlink(id)
    }

    /// Remove an empty directory. The root cannot be removed.
    pub fn rmdir(&mut self, path: &str) -> FsMetaResult<Inode> {
        let id = self.resolve(path)?;
        if id == ROOT_INODE_ID {
            return Err(FsMetaError::InvalidPath("cannot remove /".to_string()));
        }
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FsMetaError::Internal(format!("dangling inode {}", id)))?;
        let dir = node
            .as_dir()
            .ok_or_else(|| FsMetaError::NotDirectory(path.to_string()))?;
        if !dir.children.is_empty() {
            return Err(FsMetaError::DirNotEmpty(path.to_string()));
        }
        self.unlink(id)
    }

    /// Move a file to a new path. The target must not exist and its parent
    /// must already be a directory.
    pub fn rename_file(&mut self, old: &str, new: &str) -> FsMetaResult<()> {
        let id = self.resolve(old)?;
        if self
            .nodes
            .get(&id)
            .map(|n| n.is_dir())
            .unwrap_or(false)
        {
            return Err(FsMetaError::NotAFile(old.to_string()));
        }
        if self.resolve(new).is_ok() {
            return Err(FsMetaError::AlreadyExists(new.to_string()));
        }
        let segments = Self::split_segments(new)?;
        let new_name = segments
            .last()
            .copied()
            .ok_or_else(|| FsMetaError::InvalidPath("cannot rename to /".to_string()))?;
        let mut new_parent = ROOT_INODE_ID;
        for seg in &segments[..segments.len() - 1] {
            new_parent = self.child_of(new_parent, seg, new)?;
        }
        if !self
            .nodes
            .get(&new_parent)
            .map(|n| n.is_dir())
            .unwrap_or(false)
        {
            return Err(FsMetaError::NotDirectory(new.to_string()));
        }
        let node = self.unlink(id)?;
        let moved = Inode {
            id: node.id,
            name: new_name.to_string(),
            parent: Some(new_parent),
            body: node.body,
        };
        self.nodes.insert(id, moved);
        if let Some(dir) = self.nodes.get_mut(&new_parent).and_then(Inode::as_dir_mut) {
            dir.children.insert(new_name.to_string(), id);
        }
        Ok(())
    }

    /// Put back an inode previously removed by `delete_file`/`rmdir`.
    pub fn reinsert(&mut self, node: Inode) -> FsMetaResult<()> {
        let (pid, name, id) = (node.parent, node.name.clone(), node.id);
        self.nodes.insert(id, node);
        if let Some(pid) = pid {
            let dir = self
                .nodes
                .get_mut(&pid)
                .and_then(Inode::as_dir_mut)
                .ok_or_else(|| FsMetaError::Internal(format!("dangling parent {}", pid)))?;
            dir.children.insert(name, id);
        }
        Ok(())
    }

    /// Drop inodes created by a failed multi-step mutation, newest first.
    pub fn drop_created(&mut self, created: &[InodeId]) {
        for id in created.iter().rev() {
            let _ = self.unlink(*id);
        }
    }

    /// Paths of every file currently marked under construction.
    pub fn under_construction_paths(&self) -> FsMetaResult<Vec<String>> {
        let mut out = Vec::new();
        for node in self.nodes.values() {
            if let Some(file) = node.as_file() {
                if file.under_construction {
                    out.push(self.path_of(node.id)?);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

impl Default for NamespaceTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkdir_and_resolve() {
        let mut tree = NamespaceTree::new();
        let (id, created) = tree.mkdir_p("/a/b/c").unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(tree.resolve("/a/b/c").unwrap(), id);
        // idempotent
        let (id2, created2) = tree.mkdir_p("/a/b/c").unwrap();
        assert_eq!(id2, id);
        assert!(created2.is_empty());
        assert_eq!(tree.path_of(id).unwrap(), "/a/b/c");
    }

    #[test]
    fn test_invalid_paths() {
        let mut tree = NamespaceTree::new();
        assert!(matches!(
            tree.resolve("a/b"),
            Err(FsMetaError::InvalidPath(_))
        ));
        assert!(matches!(
            tree.resolve("/a//b"),
            Err(FsMetaError::InvalidPath(_))
        ));
        assert!(matches!(
            tree.create_file("/", 3),
            Err(FsMetaError::InvalidPath(_))
        ));
        assert_eq!(tree.resolve("/").unwrap(), ROOT_INODE_ID);
    }

    #[test]
    fn test_create_file_errors() {
        let mut tree = NamespaceTree::new();
        tree.mkdir_p("/d").unwrap();
        tree.create_file("/d/f", 3).unwrap();
        assert!(matches!(
            tree.create_file("/d/f", 3),
            Err(FsMetaError::AlreadyExists(_))
        ));
        // parent missing
        assert!(matches!(
            tree.create_file("/nope/f", 3),
            Err(FsMetaError::NotFound(_))
        ));
        // file in the middle of the path
        assert!(matches!(
            tree.create_file("/d/f/g", 3),
            Err(FsMetaError::NotDirectory(_))
        ));
        assert!(matches!(
            tree.mkdir_p("/d/f/g"),
            Err(FsMetaError::NotDirectory(_))
        ));
    }

    #[test]
    fn test_list_children_ordered() {
        let mut tree = NamespaceTree::new();
        tree.mkdir_p("/d").unwrap();
        tree.create_file("/d/zz", 3).unwrap();
        tree.create_file("/d/aa", 3).unwrap();
        tree.mkdir_p("/d/mm").unwrap();
        assert_eq!(tree.list_children("/d").unwrap(), vec!["aa", "mm", "zz"]);
        assert!(matches!(
            tree.list_children("/d/aa"),
            Err(FsMetaError::NotDirectory(_))
        ));
    }

    #[test]
    fn test_delete_and_rmdir() {
        let mut tree = NamespaceTree::new();
        tree.mkdir_p("/d").unwrap();
        tree.create_file("/d/f", 3).unwrap();
        assert!(matches!(
            tree.rmdir("/d"),
            Err(FsMetaError::DirNotEmpty(_))
        ));
        assert!(matches!(tree.delete_file("/d"), Err(FsMetaError::NotAFile(_))));
        let removed = tree.delete_file("/d/f").unwrap();
        assert!(tree.resolve("/d/f").is_err());
        tree.reinsert(removed).unwrap();
        assert!(tree.resolve("/d/f").is_ok());
        tree.delete_file("/d/f").unwrap();
        tree.rmdir("/d").unwrap();
        assert!(tree.resolve("/d").is_err());
        assert!(matches!(
            tree.rmdir("/"),
            Err(FsMetaError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_rename_file() {
        let mut tree = NamespaceTree::new();
        tree.mkdir_p("/a").unwrap();
        tree.mkdir_p("/b").unwrap();
        tree.create_file("/a/f", 3).unwrap();
        tree.create_file("/b/g", 3).unwrap();
        assert!(matches!(
            tree.rename_file("/a/f", "/b/g"),
            Err(FsMetaError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.rename_file("/a/f", "/missing/f"),
            Err(FsMetaError::NotFound(_))
        ));
        tree.rename_file("/a/f", "/b/f2").unwrap();
        assert!(tree.resolve("/a/f").is_err());
        let id = tree.resolve("/b/f2").unwrap();
        assert_eq!(tree.path_of(id).unwrap(), "/b/f2");
    }

    #[test]
    fn test_under_construction_paths() {
        let mut tree = NamespaceTree::new();
        tree.mkdir_p("/d").unwrap();
        tree.create_file("/d/open", 3).unwrap();
        tree.create_file("/d/closed", 3).unwrap();
        tree.file_mut("/d/closed").unwrap().under_construction = false;
        assert_eq!(tree.under_construction_paths().unwrap(), vec!["/d/open"]);
    }
}
