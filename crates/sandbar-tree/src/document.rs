use crate::tree::{path_segments, ProjectTree};
use crate::TreeError;
use std::collections::HashMap;

/// Editor-visible file: runtime path, current buffer content, and whether the
/// buffer has unsaved edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDocument {
    pub path: String,
    pub content: String,
    pub dirty: bool,
}

/// In-memory document model: the project tree plus the set of open documents.
///
/// Owned by the editor side; the change bridge only calls
/// [`apply_external_update`](Self::apply_external_update) when it observes a
/// runtime-side write.
#[derive(Debug)]
pub struct DocumentModel {
    tree: ProjectTree,
    open: HashMap<String, OpenDocument>,
}

impl DocumentModel {
    pub fn new(tree: ProjectTree) -> Self {
        Self {
            tree,
            open: HashMap::new(),
        }
    }

    pub fn tree(&self) -> &ProjectTree {
        &self.tree
    }

    /// Open the file at `path`, materializing a document from the tree.
    pub fn open(&mut self, path: &str) -> Result<&OpenDocument, TreeError> {
        let segments = path_segments(path);
        let content = self
            .tree
            .content_at(&segments)
            .ok_or_else(|| TreeError::PathNotFound(path.to_owned()))?
            .to_owned();
        Ok(self.open.entry(path.to_owned()).or_insert(OpenDocument {
            path: path.to_owned(),
            content,
            dirty: false,
        }))
    }

    pub fn open_document(&self, path: &str) -> Option<&OpenDocument> {
        self.open.get(path)
    }

    /// Record an editor-side edit to an open document.
    pub fn edit(&mut self, path: &str, content: &str) -> Result<(), TreeError> {
        let doc = self
            .open
            .get_mut(path)
            .ok_or_else(|| TreeError::PathNotFound(path.to_owned()))?;
        doc.content = content.to_owned();
        doc.dirty = true;
        Ok(())
    }

    /// Merge a runtime-originated write into the model: replace the matching
    /// tree leaf and, if the document is open, its live content. The runtime
    /// copy is authoritative, so the dirty flag is cleared. Returns false when
    /// the path has no matching leaf.
    pub fn apply_external_update(&mut self, path: &str, content: &str) -> bool {
        let segments = path_segments(path);
        let replaced = self.tree.set_content_at(&segments, content);
        if replaced {
            if let Some(doc) = self.open.get_mut(path) {
                doc.content = content.to_owned();
                doc.dirty = false;
            }
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_tree_str;

    fn model() -> DocumentModel {
        DocumentModel::new(
            parse_tree_str(
                r#"{
                  "folderName": "app",
                  "items": [
                    { "filename": "package", "fileExtension": "json", "content": "{\"v\":1}" }
                  ]
                }"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn open_materializes_from_tree() {
        let mut m = model();
        let doc = m.open("/package.json").unwrap();
        assert_eq!(doc.content, "{\"v\":1}");
        assert!(!doc.dirty);
        assert!(m.open("/missing.json").is_err());
    }

    #[test]
    fn edit_marks_dirty() {
        let mut m = model();
        m.open("/package.json").unwrap();
        m.edit("/package.json", "{\"v\":2}").unwrap();
        assert!(m.open_document("/package.json").unwrap().dirty);
    }

    #[test]
    fn external_update_replaces_leaf_and_open_doc() {
        let mut m = model();
        m.open("/package.json").unwrap();
        m.edit("/package.json", "local").unwrap();

        assert!(m.apply_external_update("/package.json", "{\"v\":3}"));
        assert_eq!(m.tree().content_at(&["package.json"]), Some("{\"v\":3}"));
        let doc = m.open_document("/package.json").unwrap();
        assert_eq!(doc.content, "{\"v\":3}");
        assert!(!doc.dirty);
    }

    #[test]
    fn external_update_unknown_path_is_rejected() {
        let mut m = model();
        assert!(!m.apply_external_update("/nope.json", "x"));
    }
}
