//! Checkpoint engine: durable, versioned snapshots of the namespace.
//!
//! Each snapshot is a single `fsimage_<seq>.json` file holding a checksummed
//! envelope around the serialized document. Saving writes a temp file, syncs
//! it, then renames it into place so an interrupted save never touches the
//! previous image. Loading walks images newest first and falls back past any
//! that fail validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::block::{BlockIdAllocator, BlockInfo};
use crate::lease::Lease;
use crate::namespace::{DirNode, FileNode, Inode, InodeBody, InodeId, NamespaceTree};
use crate::{FsMetaError, FsMetaResult};

pub const FORMAT_VERSION: u32 = 1;

const IMAGE_PREFIX: &str = "fsimage_";
const IMAGE_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".json.tmp";

#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    format_version: u32,
    /// hex sha256 of `payload`
    checksum: String,
    payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SerializedInodeBody {
    Dir,
    File {
        replication: u16,
        under_construction: bool,
        blocks: Vec<BlockInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedInode {
    pub id: InodeId,
    pub parent: Option<InodeId>,
    pub name: String,
    #[serde(flatten)]
    pub body: SerializedInodeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub seq: u64,
    pub last_txid: u64,
    pub next_inode_id: InodeId,
    pub allocator: BlockIdAllocator,
    pub inodes: Vec<SerializedInode>,
    pub leases: Vec<Lease>,
}

impl CheckpointDocument {
    /// Capture the current tree/lease/allocator state. Inodes are emitted in
    /// id order so identical states serialize identically.
    pub fn capture(
        tree: &NamespaceTree,
        leases: Vec<Lease>,
        allocator: BlockIdAllocator,
        last_txid: u64,
    ) -> Self {
        let mut inodes: Vec<SerializedInode> = tree
            .iter()
            .map(|node| SerializedInode {
                id: node.id,
                parent: node.parent,
                name: node.name.clone(),
                body: match &node.body {
                    InodeBody::Dir(_) => SerializedInodeBody::Dir,
                    InodeBody::File(f) => SerializedInodeBody::File {
                        replication: f.replication,
                        under_construction: f.under_construction,
                        blocks: f.blocks.clone(),
                    },
                },
            })
            .collect();
        inodes.sort_by_key(|n| n.id);
        Self {
            seq: 0,
            last_txid,
            next_inode_id: tree.next_inode_id(),
            allocator,
            inodes,
            leases,
        }
    }
}

/// A checkpoint read back from storage, reconstructed into live structures.
pub struct LoadedImage {
    pub seq: u64,
    pub last_txid: u64,
    pub tree: NamespaceTree,
    pub allocator: BlockIdAllocator,
    pub leases: Vec<Lease>,
}

pub struct CheckpointEngine {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointEngine {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    fn image_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{}{:010}{}", IMAGE_PREFIX, seq, IMAGE_SUFFIX))
    }

    fn parse_seq(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let body = name.strip_prefix(IMAGE_PREFIX)?.strip_suffix(IMAGE_SUFFIX)?;
        body.parse().ok()
    }

    /// Image files present on disk, newest seq first.
    async fn list_images(&self) -> FsMetaResult<Vec<(u64, PathBuf)>> {
        let mut images = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(seq) = Self::parse_seq(&path) {
                images.push((seq, path));
            }
        }
        images.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(images)
    }

    /// Write a new image. The document's `seq` is assigned here (one past the
    /// newest on disk). Older images beyond the retention count are pruned,
    /// never the one just written.
    pub async fn save(&self, mut doc: CheckpointDocument) -> FsMetaResult<u64> {
        fs::create_dir_all(&self.dir).await?;
        self.sweep_stale_tmp().await;
        let newest = self.list_images().await?.first().map(|(s, _)| *s).unwrap_or(0);
        doc.seq = newest + 1;
        let seq = doc.seq;

        let payload = serde_json::to_string(&doc)
            .map_err(|e| FsMetaError::Internal(format!("serialize checkpoint: {}", e)))?;
        let checksum = hex::encode(Sha256::digest(payload.as_bytes()));
        let envelope = CheckpointEnvelope {
            format_version: FORMAT_VERSION,
            checksum,
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| FsMetaError::Internal(format!("serialize envelope: {}", e)))?;

        let final_path = self.image_path(seq);
        let tmp_path = self.dir.join(format!("{}{:010}{}", IMAGE_PREFIX, seq, TMP_SUFFIX));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &final_path).await?;
        info!(
            "checkpoint seq={} written to {} ({} inodes)",
            seq,
            final_path.display(),
            doc.inodes.len()
        );

        self.prune().await;
        Ok(seq)
    }

    /// Remove temp files orphaned by a save interrupted before its rename.
    async fn sweep_stale_tmp(&self) {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(IMAGE_PREFIX) && n.ends_with(TMP_SUFFIX))
                .unwrap_or(false);
            if is_tmp {
                match fs::remove_file(&path).await {
                    Ok(()) => debug!("removed stale checkpoint temp file {}", path.display()),
                    Err(e) => warn!("failed to remove stale temp {}: {}", path.display(), e),
                }
            }
        }
    }

    async fn prune(&self) {
        let images = match self.list_images().await {
            Ok(images) => images,
            Err(e) => {
                warn!("checkpoint prune: listing failed: {}", e);
                return;
            }
        };
        for (seq, path) in images.into_iter().skip(self.keep) {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("pruned old checkpoint seq={}", seq),
                Err(e) => warn!("failed to prune checkpoint {}: {}", path.display(), e),
            }
        }
    }

    /// Load the newest usable image. `Ok(None)` means no image exists at all
    /// (first startup); `CorruptCheckpoint` means images exist but none
    /// validated.
    pub async fn load(&self) -> FsMetaResult<Option<LoadedImage>> {
        let images = self.list_images().await?;
        if images.is_empty() {
            return Ok(None);
        }
        for (seq, path) in &images {
            match self.load_image(path).await {
                Ok(img) => {
                    info!(
                        "loaded checkpoint seq={} from {} ({} inodes, {} leases)",
                        seq,
                        path.display(),
                        img.tree.inode_count(),
                        img.leases.len()
                    );
                    return Ok(Some(img));
                }
                Err(e) => {
                    warn!(
                        "checkpoint {} unusable, falling back to an older image: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
        Err(FsMetaError::CorruptCheckpoint(format!(
            "all {} checkpoint images in {} failed validation",
            images.len(),
            self.dir.display()
        )))
    }

    async fn load_image(&self, path: &Path) -> FsMetaResult<LoadedImage> {
        let bytes = fs::read(path).await?;
        let envelope: CheckpointEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| FsMetaError::CorruptCheckpoint(format!("bad envelope: {}", e)))?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(FsMetaError::CorruptCheckpoint(format!(
                "unsupported format version {}",
                envelope.format_version
            )));
        }
        let checksum = hex::encode(Sha256::digest(envelope.payload.as_bytes()));
        if checksum != envelope.checksum {
            return Err(FsMetaError::CorruptCheckpoint(format!(
                "checksum mismatch: stored {}, computed {}",
                envelope.checksum, checksum
            )));
        }
        let doc: CheckpointDocument = serde_json::from_str(&envelope.payload)
            .map_err(|e| FsMetaError::CorruptCheckpoint(format!("bad document: {}", e)))?;
        Self::rebuild(doc)
    }

    fn rebuild(doc: CheckpointDocument) -> FsMetaResult<LoadedImage> {
        let mut nodes: HashMap<InodeId, Inode> = HashMap::with_capacity(doc.inodes.len());
        for si in &doc.inodes {
            let body = match &si.body {
                SerializedInodeBody::Dir => InodeBody::Dir(DirNode::default()),
                SerializedInodeBody::File {
                    replication,
                    under_construction,
                    blocks,
                } => InodeBody::File(FileNode {
                    replication: *replication,
                    under_construction: *under_construction,
                    blocks: blocks.clone(),
                }),
            };
            let prev = nodes.insert(
                si.id,
                Inode {
                    id: si.id,
                    name: si.name.clone(),
                    parent: si.parent,
                    body,
                },
            );
            if prev.is_some() {
                return Err(FsMetaError::CorruptCheckpoint(format!(
                    "duplicate inode id {}",
                    si.id
                )));
            }
        }
        // second pass: re-derive each directory's child map from parent links
        for si in &doc.inodes {
            if let Some(pid) = si.parent {
                let parent = nodes.get_mut(&pid).ok_or_else(|| {
                    FsMetaError::CorruptCheckpoint(format!(
                        "inode {} references missing parent {}",
                        si.id, pid
                    ))
                })?;
                let dir = match &mut parent.body {
                    InodeBody::Dir(d) => d,
                    InodeBody::File(_) => {
                        return Err(FsMetaError::CorruptCheckpoint(format!(
                            "inode {} has non-directory parent {}",
                            si.id, pid
                        )))
                    }
                };
                if dir.children.insert(si.name.clone(), si.id).is_some() {
                    return Err(FsMetaError::CorruptCheckpoint(format!(
                        "duplicate child name {:?} under inode {}",
                        si.name, pid
                    )));
                }
            }
        }
        let tree = NamespaceTree::from_parts(nodes, doc.next_inode_id)?;
        Ok(LoadedImage {
            seq: doc.seq,
            last_txid: doc.last_txid,
            tree,
            allocator: doc.allocator,
            leases: doc.leases,
        })
    }
}
