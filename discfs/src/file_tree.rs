//! The in-memory model of the files and directories placed on the image.


use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::debug;


/// Index of a node within its [`FileTree`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);
impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}


bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct NodeFlags : u8 {
        /// The node is a directory, not a file.
        const DIRECTORY = 0x01;
    }
}


/// A file or directory along with the geometry computed for it by the file system writers.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileTreeNode {
    /// The name of the node as it appears on the image.
    pub name: String,

    /// The full path of the node on the host file system.
    pub full_path: PathBuf,

    pub flags: NodeFlags,

    /// The length of the file data in bytes. Zero for directories.
    pub file_size: u64,

    /// The absolute sector at which the file data is stored.
    ///
    /// Assigned when the data region is allocated. Meaningless for directories.
    pub data_position_normal: u64,

    /// The number of sectors occupied by this node's UDF file entry and, for directories, the
    /// file identifiers of its children.
    pub udf_size: u64,

    /// `udf_size` of this node and all of its descendants.
    pub udf_size_total: u64,

    /// The number of directory links pointing to this directory from its children, i.e. the
    /// number of immediate subdirectories.
    ///
    /// This is not a sum over the whole subtree: only the parent identifier of each immediate
    /// subdirectory points here. The UDF file entry of the directory records this plus one for
    /// the identifier naming it in its own parent.
    pub udf_link_total: u64,

    /// The partition-relative sector at which this node's UDF file entry is stored.
    pub udf_partition_location: u64,

    parent: Option<NodeId>,
    children: Vec<NodeId>,
}
impl FileTreeNode {
    pub fn is_directory(&self) -> bool {
        self.flags.contains(NodeFlags::DIRECTORY)
    }
}


/// A tree of files and directories, stored as a flat arena whose first entry is the root.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileTree {
    nodes: Vec<FileTreeNode>,
    file_count: u64,
    dir_count: u64,
}
impl FileTree {
    /// Creates a tree containing only a root directory corresponding to `root_path`.
    pub fn new<P: Into<PathBuf>>(root_path: P) -> Self {
        let root = FileTreeNode {
            full_path: root_path.into(),
            flags: NodeFlags::DIRECTORY,
            ..FileTreeNode::default()
        };
        Self {
            nodes: vec![root],
            file_count: 0,
            dir_count: 0,
        }
    }

    fn add_node(&mut self, parent: NodeId, mut node: FileTreeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        self.nodes[parent.index()].children.push(id);
        self.nodes.push(node);
        id
    }

    /// Adds a directory below `parent` and returns its ID.
    pub fn add_directory<N: Into<String>, P: Into<PathBuf>>(&mut self, parent: NodeId, name: N, full_path: P) -> NodeId {
        self.dir_count += 1;
        self.add_node(parent, FileTreeNode {
            name: name.into(),
            full_path: full_path.into(),
            flags: NodeFlags::DIRECTORY,
            ..FileTreeNode::default()
        })
    }

    /// Adds a file of `file_size` bytes below `parent` and returns its ID.
    pub fn add_file<N: Into<String>, P: Into<PathBuf>>(&mut self, parent: NodeId, name: N, full_path: P, file_size: u64) -> NodeId {
        self.file_count += 1;
        self.add_node(parent, FileTreeNode {
            name: name.into(),
            full_path: full_path.into(),
            file_size,
            ..FileTreeNode::default()
        })
    }

    pub fn root(&self) -> NodeId { NodeId::ROOT }

    pub fn node(&self, id: NodeId) -> &FileTreeNode { &self.nodes[id.index()] }
    pub fn node_mut(&mut self, id: NodeId) -> &mut FileTreeNode { &mut self.nodes[id.index()] }

    pub fn children(&self, id: NodeId) -> &[NodeId] { &self.nodes[id.index()].children }
    pub fn parent(&self, id: NodeId) -> Option<NodeId> { self.nodes[id.index()].parent }

    /// The number of files in the tree.
    pub fn file_count(&self) -> u64 { self.file_count }

    /// The number of directories in the tree, not counting the root.
    pub fn dir_count(&self) -> u64 { self.dir_count }

    /// The total number of nodes, including the root.
    pub fn len(&self) -> usize { self.nodes.len() }

    /// Whether the root directory has no children.
    pub fn is_empty(&self) -> bool { self.nodes.len() <= 1 }

    /// Returns the IDs of all nodes in pre-order, with siblings in insertion order.
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut ret = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            ret.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        ret
    }

    /// Returns the IDs of all nodes in post-order: every node follows all of its descendants.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut ret = Vec::with_capacity(self.nodes.len());

        // (node, index of the next child to descend into)
        let mut stack = vec![(NodeId::ROOT, 0usize)];
        while let Some(&(id, next_child)) = stack.last() {
            match self.children(id).get(next_child) {
                Some(&child) => {
                    let top = stack.len() - 1;
                    stack[top].1 += 1;
                    stack.push((child, 0));
                },
                None => {
                    stack.pop();
                    ret.push(id);
                },
            }
        }
        ret
    }

    /// Builds a tree from a directory on the host file system.
    ///
    /// Directories are scanned breadth-first. The entries of each directory are sorted by name so
    /// that the same directory always yields the same tree. Symbolic links and other special files
    /// are skipped. Names that are not valid Unicode are converted lossily.
    pub fn scan(root_path: &Path) -> Result<Self, io::Error> {
        let mut tree = Self::new(root_path);
        let mut pending = VecDeque::new();
        pending.push_back(NodeId::ROOT);

        while let Some(dir_id) = pending.pop_front() {
            let dir_path = tree.node(dir_id).full_path.clone();
            let mut entries = fs::read_dir(&dir_path)?
                .collect::<Result<Vec<_>, _>>()?;
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let file_type = entry.file_type()?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if file_type.is_dir() {
                    let child = tree.add_directory(dir_id, name, entry.path());
                    pending.push_back(child);
                } else if file_type.is_file() {
                    let file_size = entry.metadata()?.len();
                    tree.add_file(dir_id, name, entry.path(), file_size);
                } else {
                    debug!("skipping special file {:?}", entry.path());
                }
            }
        }

        debug!("scanned {} files and {} directories below {:?}", tree.file_count, tree.dir_count, root_path);
        Ok(tree)
    }
}
