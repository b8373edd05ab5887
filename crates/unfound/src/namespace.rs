//! In-memory namespace: the filesystem dispatch layer in front of the block
//! cache and the mutation hook.
//!
//! File contents live in blocks of one cache volume; the directory tree and
//! the block map live in memory only. Bytes of an allocated block past the
//! end of its file are always zero, so growing a file never exposes stale
//! data.
//!
//! Mutations are serialized by one namespace-wide lock; reads run in
//! parallel with each other. The hook is called with the canonical path of
//! the affected node while the mutation lock is still held, so hook calls
//! arrive in commit order. Tree and handle locks are released first.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};
use uf_cache::{BlockStore, CacheManager};
use uf_error::{Result, UfError};
use uf_notify::{MutationHook, PathResolver, ResolvedTarget};
use uf_types::{BlockNumber, BlockSize, HandleId, NodeId, VolumeId};

/// Cache manager over a type-erased block store.
pub type SharedCache = CacheManager<dyn BlockStore>;

const ROOT: NodeId = NodeId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
}

/// Result of [`Namespace::stat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub node: NodeId,
    pub kind: NodeKind,
    /// Length in bytes. Always 0 for directories.
    pub size: u64,
    /// Volume blocks backing the file.
    pub blocks: u64,
}

#[derive(Debug)]
enum Node {
    Dir { children: BTreeMap<String, NodeId> },
    File { size: u64, blocks: Vec<BlockNumber> },
}

impl Node {
    fn metadata(&self, node: NodeId) -> Metadata {
        match self {
            Self::Dir { .. } => Metadata {
                node,
                kind: NodeKind::Directory,
                size: 0,
                blocks: 0,
            },
            Self::File { size, blocks } => Metadata {
                node,
                kind: NodeKind::File,
                size: *size,
                blocks: blocks.len() as u64,
            },
        }
    }
}

// ── Tree ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_node: u64,
    free_blocks: Vec<BlockNumber>,
    next_block: u64,
    total_blocks: u64,
}

impl Tree {
    fn new(total_blocks: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node::Dir {
                children: BTreeMap::new(),
            },
        );
        Self {
            nodes,
            next_node: ROOT.0 + 1,
            free_blocks: Vec::new(),
            next_block: 0,
            total_blocks,
        }
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| UfError::NotFound(format!("node {}", id.0)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| UfError::NotFound(format!("node {}", id.0)))
    }

    /// Walk `components` from the root.
    fn lookup(&self, components: &[String]) -> Result<NodeId> {
        let mut current = ROOT;
        for name in components {
            let Node::Dir { children } = self.node(current)? else {
                return Err(UfError::NotDirectory);
            };
            current = *children
                .get(name)
                .ok_or_else(|| UfError::NotFound(name.clone()))?;
        }
        Ok(current)
    }

    fn dir_children_mut(&mut self, dir: NodeId) -> Result<&mut BTreeMap<String, NodeId>> {
        match self.node_mut(dir)? {
            Node::Dir { children } => Ok(children),
            Node::File { .. } => Err(UfError::NotDirectory),
        }
    }

    fn file(&self, id: NodeId) -> Result<(u64, &[BlockNumber])> {
        match self.node(id)? {
            Node::File { size, blocks } => Ok((*size, blocks.as_slice())),
            Node::Dir { .. } => Err(UfError::IsDirectory),
        }
    }

    fn file_mut(&mut self, id: NodeId) -> Result<(&mut u64, &mut Vec<BlockNumber>)> {
        match self.node_mut(id)? {
            Node::File { size, blocks } => Ok((size, blocks)),
            Node::Dir { .. } => Err(UfError::IsDirectory),
        }
    }

    /// Link a new node under `parent`.
    fn link(&mut self, parent: NodeId, name: &str, node: Node) -> Result<NodeId> {
        let id = NodeId(self.next_node);
        let children = self.dir_children_mut(parent)?;
        if children.contains_key(name) {
            return Err(UfError::Exists);
        }
        children.insert(name.to_owned(), id);
        self.next_node += 1;
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn alloc_block(&mut self) -> Result<BlockNumber> {
        if let Some(block) = self.free_blocks.pop() {
            return Ok(block);
        }
        if self.next_block < self.total_blocks {
            let block = BlockNumber(self.next_block);
            self.next_block += 1;
            return Ok(block);
        }
        Err(UfError::ResourceExhausted(format!(
            "volume full: {} blocks in use",
            self.total_blocks
        )))
    }

    /// Grow `file`'s block map to `needed` entries.
    ///
    /// Returns a copy of the whole map and the index of the first block
    /// allocated by this call. Nothing is allocated on failure.
    fn extend_file(&mut self, file: NodeId, needed: usize) -> Result<(Vec<BlockNumber>, usize)> {
        let have = self.file(file)?.1.len();
        let mut fresh = Vec::new();
        for _ in have..needed {
            match self.alloc_block() {
                Ok(block) => fresh.push(block),
                Err(err) => {
                    self.free_blocks.extend(fresh);
                    return Err(err);
                }
            }
        }
        let (_, blocks) = self.file_mut(file)?;
        blocks.extend(fresh);
        Ok((blocks.clone(), have))
    }

    fn free_count(&self) -> u64 {
        self.total_blocks - self.next_block + self.free_blocks.len() as u64
    }
}

// ── Paths ───────────────────────────────────────────────────────────

/// Split an absolute path into normalized components. `..` at the root
/// stays at the root.
fn components(path: &Path) -> Result<Vec<String>> {
    if !path.is_absolute() {
        return Err(UfError::InvalidPath(format!(
            "{}: path must be absolute",
            path.display()
        )));
    }
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => {
                let name = name.to_str().ok_or_else(|| {
                    UfError::InvalidPath(format!("{}: name is not UTF-8", path.display()))
                })?;
                out.push(name.to_owned());
            }
            Component::Prefix(_) => {
                return Err(UfError::InvalidPath(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

fn canonical(components: &[String]) -> PathBuf {
    let mut path = PathBuf::from("/");
    path.extend(components);
    path
}

/// Parent components and final name. The root has no name.
fn split_last(components: &[String]) -> Result<(&[String], &str)> {
    components
        .split_last()
        .map(|(name, parent)| (parent, name.as_str()))
        .ok_or_else(|| UfError::InvalidArgument("operation not permitted on /".to_owned()))
}

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| UfError::InvalidArgument(format!("offset {value} out of range")))
}

#[derive(Debug, Clone)]
struct OpenFile {
    node: NodeId,
    path: PathBuf,
    offset: u64,
}

// ── Namespace ───────────────────────────────────────────────────────

pub struct Namespace {
    volume: VolumeId,
    block_size: BlockSize,
    cache: Arc<SharedCache>,
    hook: Arc<dyn MutationHook>,
    tree: RwLock<Tree>,
    mutation: Mutex<()>,
    handles: Mutex<HashMap<HandleId, OpenFile>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.read();
        f.debug_struct("Namespace")
            .field("volume", &self.volume)
            .field("block_size", &self.block_size.get())
            .field("nodes", &tree.nodes.len())
            .field("free_blocks", &tree.free_count())
            .field("open_handles", &self.handles.lock().len())
            .finish_non_exhaustive()
    }
}

impl Namespace {
    /// Empty namespace over `volume`, which must already be attached to the
    /// cache's store. Every block of the volume is free.
    pub fn new(
        volume: VolumeId,
        cache: Arc<SharedCache>,
        hook: Arc<dyn MutationHook>,
    ) -> Result<Self> {
        let block_size = cache.store().block_size();
        let total_blocks = cache.store().block_count(volume)?;
        debug!(
            target: "uf::namespace",
            event = "init",
            volume = volume.0,
            blocks = total_blocks,
            block_size = block_size.get()
        );
        Ok(Self {
            volume,
            block_size,
            cache,
            hook,
            tree: RwLock::new(Tree::new(total_blocks)),
            mutation: Mutex::new(()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.tree.read().free_count()
    }

    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    // ── Directory operations ────────────────────────────────────────

    pub fn mkdir(&self, path: &Path) -> Result<()> {
        let parts = components(path)?;
        let (parent, name) = split_last(&parts)?;
        let _guard = self.mutation.lock();
        let mut tree = self.tree.write();
        let dir = tree.lookup(parent)?;
        tree.link(
            dir,
            name,
            Node::Dir {
                children: BTreeMap::new(),
            },
        )?;
        drop(tree);
        let path = canonical(&parts);
        debug!(target: "uf::namespace", event = "mkdir", path = %path.display());
        self.hook.created(&path);
        Ok(())
    }

    /// Names in a directory, sorted.
    pub fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let parts = components(path)?;
        let tree = self.tree.read();
        match tree.node(tree.lookup(&parts)?)? {
            Node::Dir { children } => Ok(children.keys().cloned().collect()),
            Node::File { .. } => Err(UfError::NotDirectory),
        }
    }

    pub fn stat(&self, path: &Path) -> Result<Metadata> {
        let parts = components(path)?;
        let tree = self.tree.read();
        let node = tree.lookup(&parts)?;
        Ok(tree.node(node)?.metadata(node))
    }

    /// Unlink a file or an empty directory and return its blocks to the
    /// free pool.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let parts = components(path)?;
        let (parent, name) = split_last(&parts)?;
        {
            let _guard = self.mutation.lock();
            let blocks = {
                let mut tree = self.tree.write();
                let dir = tree.lookup(parent)?;
                let node = tree.lookup(&parts)?;
                if let Node::Dir { children } = tree.node(node)? {
                    if !children.is_empty() {
                        return Err(UfError::NotEmpty);
                    }
                }
                tree.dir_children_mut(dir)?.remove(name);
                match tree.nodes.remove(&node) {
                    Some(Node::File { blocks, .. }) => blocks,
                    _ => Vec::new(),
                }
            };
            for &block in &blocks {
                if let Err(err) = self.cache.invalidate(self.volume, block) {
                    warn!(
                        target: "uf::namespace",
                        event = "invalidate_failed",
                        volume = self.volume.0,
                        block = block.0,
                        error = %err
                    );
                }
            }
            self.tree.write().free_blocks.extend(blocks);
            let path = canonical(&parts);
            debug!(target: "uf::namespace", event = "remove", path = %path.display());
            self.hook.deleted(&path);
        }
        Ok(())
    }

    /// Move `from` to `to`. The target must not exist.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_parts = components(from)?;
        let to_parts = components(to)?;
        if from_parts == to_parts {
            return Ok(());
        }
        let (from_parent, from_name) = split_last(&from_parts)?;
        let (to_parent, to_name) = split_last(&to_parts)?;
        if to_parts.starts_with(&from_parts) {
            return Err(UfError::InvalidArgument(
                "cannot move a directory into itself".to_owned(),
            ));
        }
        let from_path = canonical(&from_parts);
        let to_path = canonical(&to_parts);
        {
            let _guard = self.mutation.lock();
            let mut tree = self.tree.write();
            let node = tree.lookup(&from_parts)?;
            let src_dir = tree.lookup(from_parent)?;
            let dst_dir = tree.lookup(to_parent)?;
            if tree.dir_children_mut(dst_dir)?.contains_key(to_name) {
                return Err(UfError::Exists);
            }
            tree.dir_children_mut(src_dir)?.remove(from_name);
            tree.dir_children_mut(dst_dir)?.insert(to_name.to_owned(), node);
            drop(tree);

            for open in self.handles.lock().values_mut() {
                if let Ok(rest) = open.path.strip_prefix(&from_path) {
                    open.path = to_path.join(rest);
                }
            }
            debug!(
                target: "uf::namespace",
                event = "rename",
                from = %from_path.display(),
                to = %to_path.display()
            );
            self.hook.renamed(&from_path, &to_path);
        }
        Ok(())
    }

    // ── File operations ─────────────────────────────────────────────

    /// Create an empty file and open it. Fails with `Exists` if the name
    /// is taken.
    pub fn create(&self, path: &Path) -> Result<HandleId> {
        let parts = components(path)?;
        let (parent, name) = split_last(&parts)?;
        let _guard = self.mutation.lock();
        let node = {
            let mut tree = self.tree.write();
            let dir = tree.lookup(parent)?;
            tree.link(
                dir,
                name,
                Node::File {
                    size: 0,
                    blocks: Vec::new(),
                },
            )?
        };
        let path = canonical(&parts);
        let handle = self.register_handle(node, path.clone());
        debug!(
            target: "uf::namespace",
            event = "create",
            path = %path.display(),
            handle = handle.0
        );
        self.hook.created(&path);
        Ok(handle)
    }

    /// Open an existing file at offset 0.
    pub fn open(&self, path: &Path) -> Result<HandleId> {
        let parts = components(path)?;
        let node = {
            let tree = self.tree.read();
            let node = tree.lookup(&parts)?;
            tree.file(node)?;
            node
        };
        Ok(self.register_handle(node, canonical(&parts)))
    }

    fn register_handle(&self, node: NodeId, path: PathBuf) -> HandleId {
        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.lock().insert(
            handle,
            OpenFile {
                node,
                path,
                offset: 0,
            },
        );
        handle
    }

    fn open_file(&self, handle: HandleId) -> Result<OpenFile> {
        self.handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(UfError::BadHandle(handle.0))
    }

    fn set_offset(&self, handle: HandleId, offset: u64) {
        if let Some(open) = self.handles.lock().get_mut(&handle) {
            open.offset = offset;
        }
    }

    /// Close a handle and drop its access stream.
    pub fn close(&self, handle: HandleId) -> Result<()> {
        self.handles
            .lock()
            .remove(&handle)
            .ok_or(UfError::BadHandle(handle.0))?;
        self.cache.close_handle(handle);
        Ok(())
    }

    pub fn seek(&self, handle: HandleId, pos: SeekFrom) -> Result<u64> {
        let open = self.open_file(handle)?;
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => (offset, 0),
            SeekFrom::Current(delta) => (open.offset, delta),
            SeekFrom::End(delta) => (self.tree.read().file(open.node)?.0, delta),
        };
        let offset = base.checked_add_signed(delta).ok_or_else(|| {
            UfError::InvalidArgument(format!("seek to {base}{delta:+} is out of range"))
        })?;
        self.set_offset(handle, offset);
        Ok(offset)
    }

    /// Read at the handle's offset through the cache and advance it.
    /// Returns 0 at end of file.
    pub fn read(&self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        let open = self.open_file(handle)?;
        let (size, blocks) = {
            let tree = self.tree.read();
            let (size, blocks) = tree.file(open.node)?;
            (size, blocks.to_vec())
        };
        if open.offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = to_index(size - open.offset)?;
        let len = buf.len().min(remaining);
        let block_len = self.block_size.as_usize();
        let mut offset = open.offset;
        let mut done = 0;
        while done < len {
            let index = to_index(self.block_size.byte_to_block(offset).0)?;
            let within = self.block_size.offset_in_block(offset);
            let take = (block_len - within).min(len - done);
            let data = self.cache.read(self.volume, blocks[index], handle)?;
            buf[done..done + take].copy_from_slice(&data.as_slice()[within..within + take]);
            done += take;
            offset += take as u64;
        }
        self.set_offset(handle, offset);
        trace!(
            target: "uf::namespace",
            event = "read",
            handle = handle.0,
            offset = open.offset,
            len
        );
        self.hook.accessed(&open.path);
        Ok(len)
    }

    /// Write at the handle's offset through the cache and advance it.
    ///
    /// Blocks between the old end of file and the write are allocated and
    /// zeroed.
    pub fn write(&self, handle: HandleId, data: &[u8]) -> Result<usize> {
        let open = self.open_file(handle)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = open
            .offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| UfError::InvalidArgument("write past maximum file size".to_owned()))?;
        {
            let _guard = self.mutation.lock();
            let needed = to_index(end.div_ceil(u64::from(self.block_size.get())))?;
            let (blocks, fresh_from) = self.tree.write().extend_file(open.node, needed)?;
            if let Err(err) = self.write_blocks(&blocks, fresh_from, open.offset, data) {
                self.release_unused(open.node);
                return Err(err);
            }
            {
                let mut tree = self.tree.write();
                let (size, _) = tree.file_mut(open.node)?;
                *size = (*size).max(end);
            }
            self.set_offset(handle, end);
            trace!(
                target: "uf::namespace",
                event = "write",
                handle = handle.0,
                offset = open.offset,
                len = data.len()
            );
            self.hook.modified(&open.path);
        }
        Ok(data.len())
    }

    /// Push `data` at `offset` into the cache. Blocks at or past
    /// `fresh_from` are new and receive whole zero-filled blocks.
    fn write_blocks(
        &self,
        blocks: &[BlockNumber],
        fresh_from: usize,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let block_len = self.block_size.as_usize();
        let first = to_index(self.block_size.byte_to_block(offset).0)?;
        if fresh_from < first {
            let zeros = vec![0_u8; block_len];
            for &block in &blocks[fresh_from..first] {
                self.cache.write(self.volume, block, &zeros)?;
            }
        }
        let mut offset = offset;
        let mut done = 0;
        while done < data.len() {
            let index = to_index(self.block_size.byte_to_block(offset).0)?;
            let within = self.block_size.offset_in_block(offset);
            let take = (block_len - within).min(data.len() - done);
            let chunk = &data[done..done + take];
            if index >= fresh_from && take != block_len {
                let mut whole = vec![0_u8; block_len];
                whole[within..within + take].copy_from_slice(chunk);
                self.cache.write(self.volume, blocks[index], &whole)?;
            } else {
                self.cache.write_at(self.volume, blocks[index], within, chunk)?;
            }
            done += take;
            offset += take as u64;
        }
        Ok(())
    }

    /// Free blocks past the end of `file`. Caller holds the mutation lock.
    fn release_unused(&self, file: NodeId) {
        let bs = u64::from(self.block_size.get());
        let mut tree = self.tree.write();
        let Ok((size, blocks)) = tree.file_mut(file) else {
            return;
        };
        let keep = usize::try_from(size.div_ceil(bs)).unwrap_or(usize::MAX);
        if keep >= blocks.len() {
            return;
        }
        let unused = blocks.split_off(keep);
        tree.free_blocks.extend(unused);
    }

    /// Set a file's length. Shrinking frees whole blocks past the new end
    /// and zeroes the tail of the last kept block.
    pub fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let parts = components(path)?;
        let bs = u64::from(self.block_size.get());
        {
            let _guard = self.mutation.lock();
            let (node, size) = {
                let tree = self.tree.read();
                let node = tree.lookup(&parts)?;
                (node, tree.file(node)?.0)
            };
            if len > size {
                let needed = to_index(len.div_ceil(bs))?;
                let (blocks, fresh_from) = self.tree.write().extend_file(node, needed)?;
                let zeros = vec![0_u8; self.block_size.as_usize()];
                for &block in &blocks[fresh_from..] {
                    if let Err(err) = self.cache.write(self.volume, block, &zeros) {
                        self.release_unused(node);
                        return Err(err);
                    }
                }
            } else if len < size {
                let keep = to_index(len.div_ceil(bs))?;
                let within = self.block_size.offset_in_block(len);
                let tail = match keep.checked_sub(1) {
                    Some(last) if within != 0 => {
                        self.tree.read().file(node)?.1.get(last).copied()
                    }
                    _ => None,
                };
                // The file keeps every block until the tail is zeroed.
                if let Some(block) = tail {
                    let zeros = vec![0_u8; self.block_size.as_usize() - within];
                    self.cache.write_at(self.volume, block, within, &zeros)?;
                }
                let dropped = {
                    let mut tree = self.tree.write();
                    let (size, blocks) = tree.file_mut(node)?;
                    *size = len;
                    blocks.split_off(keep.min(blocks.len()))
                };
                for &block in &dropped {
                    if let Err(err) = self.cache.invalidate(self.volume, block) {
                        warn!(
                            target: "uf::namespace",
                            event = "invalidate_failed",
                            volume = self.volume.0,
                            block = block.0,
                            error = %err
                        );
                    }
                }
                self.tree.write().free_blocks.extend(dropped);
            }
            {
                let mut tree = self.tree.write();
                let (size, _) = tree.file_mut(node)?;
                *size = len;
            }
            self.hook.modified(&canonical(&parts));
        }
        Ok(())
    }

    /// Write back every dirty block of the namespace's volume.
    pub fn sync(&self) -> Result<()> {
        self.cache.flush(self.volume)
    }

    // ── Whole-file helpers ──────────────────────────────────────────

    /// Replace a file's contents, creating it if needed.
    ///
    /// A new file reports Create then Modify; an existing one reports
    /// Modify for the truncation and for the write.
    pub fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let handle = match self.create(path) {
            Ok(handle) => handle,
            Err(UfError::Exists) => {
                self.truncate(path, 0)?;
                self.open(path)?
            }
            Err(err) => return Err(err),
        };
        let written = self.write(handle, data);
        self.close(handle)?;
        written.map(|_| ())
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let handle = self.open(path)?;
        let mut out = Vec::new();
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        let result = loop {
            match self.read(handle, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) => break Err(err),
            }
        };
        self.close(handle)?;
        result.map(|()| out)
    }
}

impl PathResolver for Namespace {
    fn resolve(&self, path: &Path) -> Result<ResolvedTarget> {
        let parts = components(path)?;
        let tree = self.tree.read();
        let invalid = |err: UfError| UfError::InvalidPath(format!("{}: {err}", path.display()));
        let node = tree.lookup(&parts).map_err(invalid)?;
        let is_dir = matches!(tree.node(node).map_err(invalid)?, Node::Dir { .. });
        Ok(ResolvedTarget {
            path: canonical(&parts),
            node,
            is_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use uf_cache::{CacheConfig, MemByteDevice, VolumeStore};
    use uf_notify::{DrainMode, EventKind, NotificationManager, NotifyConfig};
    use uf_types::{EventMask, OwnerId};

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingHook {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock())
        }

        fn record(&self, kind: &str, path: &Path) {
            self.calls.lock().push(format!("{kind} {}", path.display()));
        }
    }

    impl MutationHook for RecordingHook {
        fn created(&self, path: &Path) {
            self.record("create", path);
        }
        fn modified(&self, path: &Path) {
            self.record("modify", path);
        }
        fn deleted(&self, path: &Path) {
            self.record("delete", path);
        }
        fn accessed(&self, path: &Path) {
            self.record("access", path);
        }
        fn renamed(&self, from: &Path, to: &Path) {
            self.calls
                .lock()
                .push(format!("rename {} {}", from.display(), to.display()));
        }
    }

    /// Forwards to a notification manager, stalling inside `created`.
    struct SlowCreateHook {
        inner: Arc<NotificationManager>,
    }

    impl MutationHook for SlowCreateHook {
        fn created(&self, path: &Path) {
            thread::sleep(Duration::from_millis(50));
            self.inner.created(path);
        }
        fn modified(&self, path: &Path) {
            self.inner.modified(path);
        }
        fn deleted(&self, path: &Path) {
            self.inner.deleted(path);
        }
        fn accessed(&self, path: &Path) {
            self.inner.accessed(path);
        }
        fn renamed(&self, from: &Path, to: &Path) {
            self.inner.renamed(from, to);
        }
    }

    fn namespace(volume_blocks: usize) -> (Namespace, Arc<RecordingHook>) {
        let hook = Arc::new(RecordingHook::default());
        (namespace_with(volume_blocks, hook.clone()), hook)
    }

    fn namespace_with(volume_blocks: usize, hook: Arc<dyn MutationHook>) -> Namespace {
        let block_size = BlockSize::new(512).expect("block size");
        let store = VolumeStore::new(block_size);
        store
            .attach(VolumeId(0), MemByteDevice::new(volume_blocks * 512))
            .expect("attach");
        let store: Arc<dyn BlockStore> = Arc::new(store);
        let cache = CacheManager::new(
            store,
            CacheConfig {
                capacity_blocks: 8,
                prefetch_workers: 0,
                ..CacheConfig::default()
            },
        )
        .expect("cache");
        Namespace::new(VolumeId(0), Arc::new(cache), hook).expect("namespace")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn write_then_read_across_block_boundaries() {
        let (ns, _) = namespace(64);
        let data = pattern(512 * 3 + 17);
        ns.write_file(Path::new("/a.bin"), &data).expect("write");
        assert_eq!(ns.read_file(Path::new("/a.bin")).expect("read"), data);
        let meta = ns.stat(Path::new("/a.bin")).expect("stat");
        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(meta.blocks, 4);
        assert_eq!(meta.kind, NodeKind::File);
    }

    #[test]
    fn gap_after_seek_reads_as_zeros() {
        let (ns, _) = namespace(64);
        let h = ns.create(Path::new("/sparse")).expect("create");
        ns.write(h, b"head").expect("write");
        ns.seek(h, SeekFrom::Start(1500)).expect("seek");
        ns.write(h, b"tail").expect("write");
        ns.close(h).expect("close");

        let bytes = ns.read_file(Path::new("/sparse")).expect("read");
        assert_eq!(bytes.len(), 1504);
        assert_eq!(&bytes[..4], b"head");
        assert!(bytes[4..1500].iter().all(|b| *b == 0));
        assert_eq!(&bytes[1500..], b"tail");
    }

    #[test]
    fn partial_overwrite_keeps_surrounding_bytes() {
        let (ns, _) = namespace(64);
        let path = Path::new("/f");
        ns.write_file(path, &[b'a'; 1024]).expect("write");
        let h = ns.open(path).expect("open");
        assert_eq!(ns.seek(h, SeekFrom::End(-514)).expect("seek"), 510);
        ns.write(h, b"XXXX").expect("overwrite");
        ns.close(h).expect("close");
        let bytes = ns.read_file(path).expect("read");
        assert_eq!(&bytes[508..516], b"aaXXXXaa");
        assert_eq!(bytes.len(), 1024);
    }

    #[test]
    fn hook_sees_canonical_paths_in_commit_order() {
        let (ns, hook) = namespace(16);
        ns.mkdir(Path::new("/tmp")).expect("mkdir");
        let err = ns.create(Path::new("/nope/test.txt")).expect_err("no parent");
        assert!(matches!(err, UfError::NotFound(_)));
        let h = ns.create(Path::new("/tmp/./x/../test.txt")).expect("create");
        ns.write(h, b"Hello").expect("write");
        ns.seek(h, SeekFrom::Start(0)).expect("seek");
        let mut buf = [0_u8; 8];
        assert_eq!(ns.read(h, &mut buf).expect("read"), 5);
        ns.close(h).expect("close");
        ns.rename(Path::new("/tmp/test.txt"), Path::new("/tmp/moved.txt"))
            .expect("rename");
        ns.remove(Path::new("/tmp/moved.txt")).expect("remove");

        assert_eq!(
            hook.take(),
            vec![
                "create /tmp",
                "create /tmp/test.txt",
                "modify /tmp/test.txt",
                "access /tmp/test.txt",
                "rename /tmp/test.txt /tmp/moved.txt",
                "delete /tmp/moved.txt",
            ]
        );
    }

    #[test]
    fn namespace_errors() {
        let (ns, hook) = namespace(16);
        ns.mkdir(Path::new("/d")).expect("mkdir");
        ns.write_file(Path::new("/d/f"), b"x").expect("write");
        hook.take();

        assert!(matches!(ns.create(Path::new("/d/f")), Err(UfError::Exists)));
        assert!(matches!(ns.mkdir(Path::new("/d")), Err(UfError::Exists)));
        assert!(matches!(ns.open(Path::new("/d")), Err(UfError::IsDirectory)));
        assert!(matches!(ns.remove(Path::new("/d")), Err(UfError::NotEmpty)));
        assert!(matches!(
            ns.create(Path::new("/d/f/g")),
            Err(UfError::NotDirectory)
        ));
        assert!(matches!(
            ns.open(Path::new("relative")),
            Err(UfError::InvalidPath(_))
        ));
        assert!(matches!(
            ns.rename(Path::new("/d"), Path::new("/d/inner")),
            Err(UfError::InvalidArgument(_))
        ));
        assert!(matches!(ns.close(HandleId(999)), Err(UfError::BadHandle(999))));
        assert!(hook.take().is_empty(), "failed operations report nothing");
    }

    #[test]
    fn removed_blocks_are_reused_and_full_volume_is_exhaustion() {
        let (ns, _) = namespace(4);
        ns.write_file(Path::new("/big"), &pattern(512 * 4)).expect("fill");
        assert_eq!(ns.free_blocks(), 0);

        let err = ns
            .write_file(Path::new("/more"), b"x")
            .expect_err("volume full");
        assert!(matches!(err, UfError::ResourceExhausted(_)));
        assert!(err.is_retryable());
        assert_eq!(ns.stat(Path::new("/more")).expect("created").size, 0);

        ns.remove(Path::new("/big")).expect("remove");
        assert_eq!(ns.free_blocks(), 4);
        ns.write_file(Path::new("/more"), b"fresh").expect("write after free");
        let bytes = ns.read_file(Path::new("/more")).expect("read");
        assert_eq!(bytes, b"fresh");
    }

    #[test]
    fn truncate_shrinks_and_zeroes_tail() {
        let (ns, _) = namespace(16);
        let path = Path::new("/t");
        ns.write_file(path, &[0xAA; 1200]).expect("write");
        ns.truncate(path, 600).expect("shrink");
        assert_eq!(ns.stat(path).expect("stat").blocks, 2);
        ns.truncate(path, 1100).expect("grow");
        let bytes = ns.read_file(path).expect("read");
        assert_eq!(bytes.len(), 1100);
        assert!(bytes[..600].iter().all(|b| *b == 0xAA));
        assert!(bytes[600..].iter().all(|b| *b == 0));
    }

    #[test]
    fn failed_tail_zeroing_leaves_file_intact() {
        let (ns, hook) = namespace(16);
        let path = Path::new("/t");
        let data = pattern(1200);
        ns.write_file(path, &data).expect("write");
        assert_eq!(ns.free_blocks(), 13);
        for b in 0..3 {
            ns.cache.invalidate(VolumeId(0), BlockNumber(b)).expect("invalidate");
        }
        // Fill every cache slot so the tail block cannot be loaded.
        let pins: Vec<_> = (8..16)
            .map(|b| ns.cache.pin(VolumeId(0), BlockNumber(b)).expect("pin"))
            .collect();
        hook.take();

        let err = ns.truncate(path, 600).expect_err("no free slot");
        assert!(matches!(err, UfError::ResourceExhausted(_)));
        let meta = ns.stat(path).expect("stat");
        assert_eq!((meta.size, meta.blocks), (1200, 3));
        assert_eq!(ns.free_blocks(), 13);
        assert!(hook.take().is_empty());

        drop(pins);
        assert_eq!(ns.read_file(path).expect("read"), data);
        ns.truncate(path, 600).expect("shrink");
        assert_eq!(ns.free_blocks(), 14);
        assert_eq!(ns.read_file(path).expect("read"), &data[..600]);
    }

    #[test]
    fn concurrent_create_and_remove_report_in_commit_order() {
        let notify = Arc::new(NotificationManager::new(NotifyConfig::default()).expect("notify"));
        let ns = namespace_with(
            16,
            Arc::new(SlowCreateHook {
                inner: Arc::clone(&notify),
            }),
        );
        ns.mkdir(Path::new("/d")).expect("mkdir");
        let wd = notify
            .add_watch(
                &ns,
                Path::new("/d"),
                EventMask::CREATE | EventMask::DELETE,
                OwnerId(1),
            )
            .expect("watch");

        thread::scope(|scope| {
            scope.spawn(|| {
                let h = ns.create(Path::new("/d/x")).expect("create");
                ns.close(h).expect("close");
            });
            loop {
                match ns.remove(Path::new("/d/x")) {
                    Ok(()) => break,
                    Err(UfError::NotFound(_)) => thread::sleep(Duration::from_millis(1)),
                    Err(err) => panic!("remove failed: {err}"),
                }
            }
        });

        let events = notify
            .drain_events(wd, 8, DrainMode::NonBlocking)
            .expect("drain");
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::Delete]);
    }

    #[test]
    fn resolver_reports_nodes_and_rejects_missing() {
        let (ns, _) = namespace(16);
        ns.mkdir(Path::new("/w")).expect("mkdir");
        let target = ns.resolve(Path::new("/w/../w")).expect("resolve");
        assert_eq!(target.path, PathBuf::from("/w"));
        assert!(target.is_dir);
        let root = ns.resolve(Path::new("/")).expect("root");
        assert_eq!(root.node, ROOT);
        assert!(matches!(
            ns.resolve(Path::new("/w/missing")),
            Err(UfError::InvalidPath(_))
        ));
    }

    #[test]
    fn open_handles_follow_renames() {
        let (ns, hook) = namespace(16);
        ns.mkdir(Path::new("/a")).expect("mkdir");
        let h = ns.create(Path::new("/a/f")).expect("create");
        ns.rename(Path::new("/a"), Path::new("/b")).expect("rename");
        hook.take();
        ns.write(h, b"z").expect("write");
        assert_eq!(hook.take(), vec!["modify /b/f"]);
        ns.close(h).expect("close");
        assert_eq!(ns.open_handles(), 0);
    }
}
