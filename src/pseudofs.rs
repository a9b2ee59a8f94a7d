//! Pseudo-filesystem: the virtual tree stitching shares into one root.
//!
//! An NFSv4 client starts at PUTROOTFH and walks down; each component of
//! a share's export path is a synthetic read-only directory, and the final
//! component is a junction whose crossing filehandle refers to the share's
//! real root inode. The tree is rebuilt whenever a share is added or
//! removed; in-flight compounds keep the snapshot they started with.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::inode::{Attrs, InodeKind};
use crate::share::ShareConfig;

/// One synthetic node.
#[derive(Debug)]
pub struct PseudoNode {
    pub name: String,
    children: BTreeMap<String, usize>,
    /// Share name this node crosses into, if it is a junction.
    pub junction: Option<String>,
}

/// Result of a pseudo-fs lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PseudoLookup {
    /// An intermediate synthetic directory.
    Directory(u64),
    /// A junction: crossing continues at the named share's root.
    Junction(String),
}

/// A directory listing entry of a synthetic node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoEntry {
    pub name: String,
    pub node: u64,
    pub junction: Option<String>,
}

/// The assembled share-junction tree.
#[derive(Debug, Default)]
pub struct PseudoFs {
    nodes: Vec<PseudoNode>,
}

impl PseudoFs {
    /// Builds the tree from the active share set.
    pub fn build<'a>(shares: impl IntoIterator<Item = &'a Arc<ShareConfig>>) -> PseudoFs {
        let mut fs = PseudoFs {
            nodes: vec![PseudoNode {
                name: String::new(),
                children: BTreeMap::new(),
                junction: None,
            }],
        };
        for share in shares {
            let components: Vec<&str> =
                share.name.split('/').filter(|c| !c.is_empty()).collect();
            if components.is_empty() {
                continue;
            }
            let mut cursor = 0usize;
            for (depth, component) in components.iter().enumerate() {
                let next = match fs.nodes[cursor].children.get(*component) {
                    Some(idx) => *idx,
                    None => {
                        let idx = fs.nodes.len();
                        fs.nodes.push(PseudoNode {
                            name: component.to_string(),
                            children: BTreeMap::new(),
                            junction: None,
                        });
                        fs.nodes[cursor].children.insert(component.to_string(), idx);
                        idx
                    }
                };
                if depth == components.len() - 1 {
                    fs.nodes[next].junction = Some(share.name.clone());
                }
                cursor = next;
            }
        }
        fs
    }

    /// The root node id.
    pub fn root(&self) -> u64 {
        0
    }

    pub fn node(&self, id: u64) -> Option<&PseudoNode> {
        self.nodes.get(id as usize)
    }

    /// Resolves one name under a synthetic directory.
    pub fn lookup(&self, node: u64, name: &str) -> Option<PseudoLookup> {
        let idx = *self.node(node)?.children.get(name)?;
        match &self.nodes[idx].junction {
            Some(share) => Some(PseudoLookup::Junction(share.clone())),
            None => Some(PseudoLookup::Directory(idx as u64)),
        }
    }

    /// Lists a synthetic directory.
    pub fn readdir(&self, node: u64) -> Vec<PseudoEntry> {
        let Some(n) = self.node(node) else { return Vec::new() };
        n.children
            .iter()
            .map(|(name, idx)| PseudoEntry {
                name: name.clone(),
                node: *idx as u64,
                junction: self.nodes[*idx].junction.clone(),
            })
            .collect()
    }

    /// Synthetic attributes for pseudo directories: read-only, owned by
    /// root, link count from child directories.
    pub fn attrs(&self, node: u64) -> Option<Attrs> {
        let n = self.node(node)?;
        let mut attrs = Attrs::new(InodeKind::Directory, 0o555, 0, 0);
        attrs.nlink = 2 + n.children.len() as u32;
        Some(attrs)
    }
}
