//! Project file tree, open-document model, and engine mount format for Sandbar.
//!
//! This crate defines the data layer shared by the coordination core and the
//! virtualization-engine boundary: the JSON project tree as stored by the
//! document store (`ProjectTree`), the editor-visible open documents
//! (`DocumentModel`), and the nested mount format the engine consumes
//! (`MountNode`, produced by `transform_tree`).

pub mod document;
pub mod mount;
pub mod tree;

pub use document::{DocumentModel, OpenDocument};
pub use mount::{transform_tree, MountNode, MountTree};
pub use tree::{parse_tree_file, parse_tree_str, path_segments, ProjectTree, TreeFile, TreeNode};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("no file at path '{0}' in project tree")]
    PathNotFound(String),
    #[error("tree parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
