use crate::TreeError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single file leaf as the document store represents it: base name and
/// extension are kept separate on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeFile {
    pub filename: String,
    pub file_extension: String,
    pub content: String,
}

impl TreeFile {
    /// Full file name as it appears in the runtime filesystem.
    pub fn file_name(&self) -> String {
        if self.file_extension.is_empty() {
            self.filename.clone()
        } else {
            format!("{}.{}", self.filename, self.file_extension)
        }
    }
}

/// A folder node holding nested files and folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTree {
    pub folder_name: String,
    pub items: Vec<TreeNode>,
}

/// Either a file or a nested folder. Untagged: the two shapes have disjoint
/// field names (`filename` vs `folderName`), matching the store's JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Folder(ProjectTree),
    File(TreeFile),
}

impl ProjectTree {
    /// Look up the content of the file at the given path segments.
    pub fn content_at(&self, segments: &[&str]) -> Option<&str> {
        let (head, rest) = segments.split_first()?;
        for item in &self.items {
            match item {
                TreeNode::File(f) if rest.is_empty() && f.file_name() == *head => {
                    return Some(&f.content);
                }
                TreeNode::Folder(d) if !rest.is_empty() && d.folder_name == *head => {
                    return d.content_at(rest);
                }
                _ => {}
            }
        }
        None
    }

    /// Replace the content of the file at the given path segments, walking
    /// folders by name. Returns false when no matching leaf exists.
    pub fn set_content_at(&mut self, segments: &[&str], content: &str) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return false;
        };
        for item in &mut self.items {
            match item {
                TreeNode::File(f) if rest.is_empty() && f.file_name() == *head => {
                    f.content = content.to_owned();
                    return true;
                }
                TreeNode::Folder(d) if !rest.is_empty() && d.folder_name == *head => {
                    return d.set_content_at(rest, content);
                }
                _ => {}
            }
        }
        false
    }
}

/// Split a runtime path like `/src/index.js` into non-empty segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn parse_tree_str(input: &str) -> Result<ProjectTree, TreeError> {
    Ok(serde_json::from_str(input)?)
}

pub fn parse_tree_file(path: &Path) -> Result<ProjectTree, TreeError> {
    let raw = std::fs::read_to_string(path)?;
    parse_tree_str(&raw)
}
