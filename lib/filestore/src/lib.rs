// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hierarchical file store.
//!
//! Nodes live in a fixed slab of `N` slots. Slot 0 is the root directory,
//! named by the path `/`. Every other node hangs off a directory through the
//! same child/sibling linkage the kernel uses for its process tree: a
//! directory records its most recently inserted child, and each child records
//! the next older sibling.
//!
//! Paths are absolute and `/`-delimited. Each token must be between 1 and
//! `abi::NAME_LEN` bytes long. Anything else is `FsError::Malformed`.
//!
//! File contents don't live here. A file's bytes are kept in whatever
//! `Storage` the caller hands in, which for the kernel is the partition
//! arena. Reads and writes always start at the beginning of the file and are
//! refused outright, rather than truncated, if they would run past the size
//! declared at creation.

#![cfg_attr(not(test), no_std)]

use abi::{Generation, Handle, NAME_LEN};
use heapless::String;

/// Backing memory for file contents.
pub trait Storage {
    /// Reserves `size` bytes, returning the address of the first one.
    fn allocate(&mut self, size: usize) -> Option<u32>;
    /// Gives back a reservation made by `allocate`.
    fn release(&mut self, addr: u32);
    fn load(&self, addr: u32, out: &mut [u8]);
    fn store(&mut self, addr: u32, data: &[u8]);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    /// The path is not absolute, has an empty token, or has a token longer
    /// than `NAME_LEN`.
    Malformed,
    NotFound,
    Exists,
    NotADirectory,
    IsADirectory,
    /// The slab is full, or `Storage` can't hold the file.
    NoSpace,
    /// Transfer longer than the file's declared size.
    TooLarge,
    /// The handle's node has since been deleted.
    Stale,
    /// The root can't be removed.
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    File,
    Directory,
}

#[derive(Clone, Debug)]
pub struct IndexNode {
    name: String<NAME_LEN>,
    mode: Mode,
    size: u32,
    data: Option<u32>,
    parent: Option<usize>,
    sibling: Option<usize>,
    child: Option<usize>,
}

impl IndexNode {
    fn new(name: &str, mode: Mode, size: u32) -> Result<Self, FsError> {
        let mut n = String::new();
        n.push_str(name).map_err(|_| FsError::Malformed)?;
        Ok(Self {
            name: n,
            mode,
            size,
            data: None,
            parent: None,
            sibling: None,
            child: None,
        })
    }

    fn root() -> Self {
        Self {
            name: String::new(),
            mode: Mode::Directory,
            size: 0,
            data: None,
            parent: None,
            sibling: None,
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Address of the file's contents in `Storage`, if it has any.
    pub fn data(&self) -> Option<u32> {
        self.data
    }
}

#[derive(Default)]
struct Slot {
    generation: Generation,
    node: Option<IndexNode>,
}

const ROOT: usize = 0;

pub struct FileStore<const N: usize> {
    slots: [Slot; N],
}

impl<const N: usize> Default for FileStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FileStore<N> {
    pub fn new() -> Self {
        let mut slots: [Slot; N] = core::array::from_fn(|_| Slot::default());
        slots[ROOT].node = Some(IndexNode::root());
        Self { slots }
    }

    /// Number of nodes, counting the root.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        // The root is always present.
        false
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let (parent, name) = self.vacancy(path)?;
        self.insert(parent, IndexNode::new(name, Mode::Directory, 0)?)?;
        Ok(())
    }

    /// Removes the directory at `path` along with everything under it.
    pub fn rmdir(
        &mut self,
        path: &str,
        storage: &mut impl Storage,
    ) -> Result<(), FsError> {
        let index = self.walk(path)?;
        if index == ROOT {
            return Err(FsError::Busy);
        }
        if self.at(index).mode != Mode::Directory {
            return Err(FsError::NotADirectory);
        }
        self.remove_subtree(index, storage);
        Ok(())
    }

    /// Creates a file at `path` with room for exactly `size` bytes.
    pub fn create(
        &mut self,
        path: &str,
        size: u32,
        storage: &mut impl Storage,
    ) -> Result<(), FsError> {
        let (parent, name) = self.vacancy(path)?;
        if self.free_slot().is_none() {
            return Err(FsError::NoSpace);
        }
        let mut node = IndexNode::new(name, Mode::File, size)?;
        if size != 0 {
            node.data = Some(storage.allocate(size as usize).ok_or(FsError::NoSpace)?);
        }
        self.insert(parent, node)?;
        Ok(())
    }

    pub fn delete(
        &mut self,
        path: &str,
        storage: &mut impl Storage,
    ) -> Result<(), FsError> {
        let index = self.walk(path)?;
        if index == ROOT {
            return Err(FsError::Busy);
        }
        if self.at(index).mode != Mode::File {
            return Err(FsError::IsADirectory);
        }
        self.remove_subtree(index, storage);
        Ok(())
    }

    pub fn open(&self, path: &str) -> Result<Handle, FsError> {
        let index = self.walk(path)?;
        Ok(Handle::for_index_and_gen(index, self.slots[index].generation))
    }

    pub fn node(&self, handle: Handle) -> Result<&IndexNode, FsError> {
        let index = self.resolve(handle)?;
        Ok(self.at(index))
    }

    /// Copies the first `out.len()` bytes of the file into `out`.
    pub fn read(
        &self,
        handle: Handle,
        out: &mut [u8],
        storage: &impl Storage,
    ) -> Result<usize, FsError> {
        if let Some(addr) = self.extent(handle, out.len())? {
            storage.load(addr, out);
        }
        Ok(out.len())
    }

    /// Replaces the first `data.len()` bytes of the file with `data`.
    pub fn write(
        &self,
        handle: Handle,
        data: &[u8],
        storage: &mut impl Storage,
    ) -> Result<usize, FsError> {
        if let Some(addr) = self.extent(handle, data.len())? {
            storage.store(addr, data);
        }
        Ok(data.len())
    }

    /// Returns the name of the `n`th entry of a directory, newest first.
    pub fn read_dir(&self, handle: Handle, n: usize) -> Result<&str, FsError> {
        let index = self.resolve(handle)?;
        if self.at(index).mode != Mode::Directory {
            return Err(FsError::NotADirectory);
        }
        self.children(index)
            .nth(n)
            .map(|c| self.at(c).name())
            .ok_or(FsError::NotFound)
    }

    /// Checks that the first `len` bytes of a file exist, and returns where
    /// they are stored. Empty files have no storage and yield `None`.
    ///
    /// This is for callers that move file contents around themselves, without
    /// going through a `Storage`.
    pub fn extent(
        &self,
        handle: Handle,
        len: usize,
    ) -> Result<Option<u32>, FsError> {
        let node = self.node(handle)?;
        if node.mode != Mode::File {
            return Err(FsError::IsADirectory);
        }
        if len > node.size as usize {
            return Err(FsError::TooLarge);
        }
        Ok(node.data.filter(|_| len != 0))
    }

    fn resolve(&self, handle: Handle) -> Result<usize, FsError> {
        let slot = self.slots.get(handle.index()).ok_or(FsError::Stale)?;
        if slot.generation != handle.generation() || slot.node.is_none() {
            return Err(FsError::Stale);
        }
        Ok(handle.index())
    }

    fn at(&self, index: usize) -> &IndexNode {
        match &self.slots[index].node {
            Some(n) => n,
            None => panic!("dangling file-store link {index}"),
        }
    }

    fn at_mut(&mut self, index: usize) -> &mut IndexNode {
        match &mut self.slots[index].node {
            Some(n) => n,
            None => panic!("dangling file-store link {index}"),
        }
    }

    fn children(&self, dir: usize) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.at(dir).child, move |&c| self.at(c).sibling)
    }

    fn find_child(&self, dir: usize, name: &str) -> Option<usize> {
        self.children(dir).find(|&c| self.at(c).name() == name)
    }

    /// Resolves `path` to a slot index.
    fn walk(&self, path: &str) -> Result<usize, FsError> {
        let mut cur = ROOT;
        for token in tokens(path)? {
            if self.at(cur).mode != Mode::Directory {
                return Err(FsError::NotADirectory);
            }
            cur = self.find_child(cur, token).ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// Checks that `path` names a not-yet-existing entry in an existing
    /// directory, returning that directory and the new entry's name.
    fn vacancy<'p>(&self, path: &'p str) -> Result<(usize, &'p str), FsError> {
        tokens(path)?;
        let (parent_path, name) = match path.rsplit_once('/') {
            Some((_, "")) | None => return Err(FsError::Exists),
            Some((parent, name)) => (parent, name),
        };
        let parent = if parent_path.is_empty() {
            ROOT
        } else {
            self.walk(parent_path)?
        };
        if self.at(parent).mode != Mode::Directory {
            return Err(FsError::NotADirectory);
        }
        if self.find_child(parent, name).is_some() {
            return Err(FsError::Exists);
        }
        Ok((parent, name))
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.node.is_none())
    }

    fn insert(
        &mut self,
        parent: usize,
        mut node: IndexNode,
    ) -> Result<usize, FsError> {
        let index = self.free_slot().ok_or(FsError::NoSpace)?;
        node.parent = Some(parent);
        node.sibling = self.at(parent).child;
        self.slots[index].node = Some(node);
        self.at_mut(parent).child = Some(index);
        Ok(index)
    }

    fn unlink(&mut self, index: usize) {
        let (parent, sibling) = {
            let n = self.at(index);
            (n.parent, n.sibling)
        };
        let Some(parent) = parent else {
            return;
        };
        if self.at(parent).child == Some(index) {
            self.at_mut(parent).child = sibling;
            return;
        }
        let prev = self.children(parent).find(|&c| self.at(c).sibling == Some(index));
        if let Some(prev) = prev {
            self.at_mut(prev).sibling = sibling;
        }
    }

    fn remove_subtree(&mut self, index: usize, storage: &mut impl Storage) {
        while let Some(child) = self.at(index).child {
            self.remove_subtree(child, storage);
        }
        if let Some(addr) = self.at(index).data {
            storage.release(addr);
        }
        self.unlink(index);
        let slot = &mut self.slots[index];
        slot.node = None;
        slot.generation = slot.generation.next();
    }
}

/// Validates `path`, returning an iterator over its tokens. The root path `/`
/// has no tokens.
fn tokens(path: &str) -> Result<impl Iterator<Item = &str>, FsError> {
    let rest = path.strip_prefix('/').ok_or(FsError::Malformed)?;
    if !rest.is_empty()
        && rest.split('/').any(|t| t.is_empty() || t.len() > NAME_LEN)
    {
        return Err(FsError::Malformed);
    }
    Ok(rest.split('/').filter(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bump allocator standing in for the partition arena.
    struct Ram {
        bytes: Vec<u8>,
        live: Vec<u32>,
    }

    impl Ram {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                live: Vec::new(),
            }
        }
    }

    impl Storage for Ram {
        fn allocate(&mut self, size: usize) -> Option<u32> {
            if self.bytes.len() + size > 256 {
                return None;
            }
            let addr = self.bytes.len() as u32;
            self.bytes.resize(self.bytes.len() + size, 0xa5);
            self.live.push(addr);
            Some(addr)
        }
        fn release(&mut self, addr: u32) {
            let i = self.live.iter().position(|&a| a == addr).unwrap();
            self.live.remove(i);
        }
        fn load(&self, addr: u32, out: &mut [u8]) {
            let a = addr as usize;
            out.copy_from_slice(&self.bytes[a..a + out.len()]);
        }
        fn store(&mut self, addr: u32, data: &[u8]) {
            let a = addr as usize;
            self.bytes[a..a + data.len()].copy_from_slice(data);
        }
    }

    #[test]
    fn hello_world_round_trip() {
        let mut fs = FileStore::<8>::new();
        let mut ram = Ram::new();
        fs.mkdir("/docs").unwrap();
        fs.create("/docs/hello", 12, &mut ram).unwrap();
        fs.create("/docs/after", 4, &mut ram).unwrap();
        let after = fs.open("/docs/after").unwrap();
        fs.write(after, b"wxyz", &mut ram).unwrap();

        let h = fs.open("/docs/hello").unwrap();
        assert_eq!(fs.write(h, b"Hello World!", &mut ram), Ok(12));
        let mut back = [0; 12];
        assert_eq!(fs.read(h, &mut back, &ram), Ok(12));
        assert_eq!(&back, b"Hello World!");

        assert_eq!(
            fs.write(h, b"Hello World!!", &mut ram),
            Err(FsError::TooLarge)
        );
        let mut too_long = [0; 13];
        assert_eq!(fs.read(h, &mut too_long, &ram), Err(FsError::TooLarge));
        let mut neighbor = [0; 4];
        fs.read(after, &mut neighbor, &ram).unwrap();
        assert_eq!(&neighbor, b"wxyz");
        assert_eq!(&ram.bytes[..12], b"Hello World!");
    }

    #[test]
    fn malformed_paths() {
        let fs = FileStore::<4>::new();
        for p in ["", "docs", "/docs/", "//", "/a//b", "/this-name-is-way-too-long"]
        {
            assert_eq!(fs.open(p), Err(FsError::Malformed), "{p:?}");
        }
        assert!(fs.open("/").is_ok());
    }

    #[test]
    fn names_longer_than_name_len_are_refused() {
        let long = "seventeen-chars!!";
        assert_eq!(long.len(), NAME_LEN + 1);
        assert_eq!(
            IndexNode::new(long, Mode::File, 0).map(|n| n.size()),
            Err(FsError::Malformed)
        );
        let node = IndexNode::new(&long[..NAME_LEN], Mode::File, 4).unwrap();
        assert_eq!(node.name(), &long[..NAME_LEN]);
    }

    #[test]
    fn lookup_errors() {
        let mut fs = FileStore::<8>::new();
        let mut ram = Ram::new();
        fs.create("/f", 1, &mut ram).unwrap();
        assert_eq!(fs.open("/nope"), Err(FsError::NotFound));
        assert_eq!(fs.mkdir("/f"), Err(FsError::Exists));
        assert_eq!(fs.mkdir("/f/g"), Err(FsError::NotADirectory));
        assert_eq!(fs.open("/f/g"), Err(FsError::NotADirectory));
        assert_eq!(fs.rmdir("/f", &mut ram), Err(FsError::NotADirectory));
        assert_eq!(fs.rmdir("/", &mut ram), Err(FsError::Busy));
        assert_eq!(fs.mkdir("/"), Err(FsError::Exists));
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.delete("/d", &mut ram), Err(FsError::IsADirectory));
        let d = fs.open("/d").unwrap();
        assert_eq!(fs.read(d, &mut [0; 1], &ram), Err(FsError::IsADirectory));
    }

    #[test]
    fn rmdir_is_recursive_and_releases_storage() {
        let mut fs = FileStore::<8>::new();
        let mut ram = Ram::new();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.create("/a/b/one", 8, &mut ram).unwrap();
        fs.create("/a/two", 8, &mut ram).unwrap();
        fs.create("/keep", 8, &mut ram).unwrap();
        assert_eq!(ram.live.len(), 3);

        let stale = fs.open("/a/b/one").unwrap();
        fs.rmdir("/a", &mut ram).unwrap();

        assert_eq!(fs.len(), 2);
        assert_eq!(ram.live, vec![16]);
        assert_eq!(fs.open("/a"), Err(FsError::NotFound));
        assert!(fs.open("/keep").is_ok());
        assert_eq!(fs.node(stale).map(|n| n.size()), Err(FsError::Stale));
    }

    #[test]
    fn stale_handle_after_slot_reuse() {
        let mut fs = FileStore::<4>::new();
        let mut ram = Ram::new();
        fs.create("/x", 2, &mut ram).unwrap();
        let old = fs.open("/x").unwrap();
        fs.delete("/x", &mut ram).unwrap();
        fs.create("/y", 2, &mut ram).unwrap();
        let new = fs.open("/y").unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(fs.write(old, b"hi", &mut ram), Err(FsError::Stale));
    }

    #[test]
    fn directory_listing_is_newest_first() {
        let mut fs = FileStore::<8>::new();
        let mut ram = Ram::new();
        fs.mkdir("/one").unwrap();
        fs.create("/two", 0, &mut ram).unwrap();
        fs.mkdir("/three").unwrap();
        let root = fs.open("/").unwrap();
        let names: Vec<&str> =
            (0..3).map(|i| fs.read_dir(root, i).unwrap()).collect();
        assert_eq!(names, ["three", "two", "one"]);
        assert_eq!(fs.read_dir(root, 3), Err(FsError::NotFound));

        // Removing the middle sibling keeps the chain intact.
        fs.delete("/two", &mut ram).unwrap();
        assert_eq!(fs.read_dir(root, 1), Ok("one"));
    }

    #[test]
    fn slab_exhaustion() {
        let mut fs = FileStore::<3>::new();
        let mut ram = Ram::new();
        fs.mkdir("/a").unwrap();
        fs.create("/b", 4, &mut ram).unwrap();
        assert_eq!(fs.mkdir("/c"), Err(FsError::NoSpace));
        assert_eq!(fs.create("/c", 4, &mut ram), Err(FsError::NoSpace));
        assert_eq!(ram.live.len(), 1);
    }
}
