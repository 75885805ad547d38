//! Directory-to-tree conversion

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while walking a directory
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize tree: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// A file or directory in the tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    /// Directory entries sorted by name; omitted for files and empty directories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    /// Pretty-printed JSON
    pub fn to_json_pretty(&self) -> TreeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Build the tree rooted at `root`
///
/// Symlinks are followed. Any unreadable entry aborts the walk.
pub fn dir_to_tree(root: &Path) -> TreeResult<FileNode> {
    let metadata = fs::metadata(root).map_err(|e| io_error(root, e))?;

    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());

    let mut node = FileNode {
        name,
        is_dir: metadata.is_dir(),
        children: Vec::new(),
    };

    if !node.is_dir {
        return Ok(node);
    }

    let mut entries = fs::read_dir(root)
        .map_err(|e| io_error(root, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_error(root, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        node.children.push(dir_to_tree(&entry.path())?);
    }

    Ok(node)
}

fn io_error(path: &Path, source: std::io::Error) -> TreeError {
    TreeError::Io {
        path: path.display().to_string(),
        source,
    }
}
