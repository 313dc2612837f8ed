use crate::tree::{ProjectTree, TreeNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Nested mount format consumed by the virtualization engine:
/// `{"file": {"contents": …}}` leaves under `{"directory": {…}}` maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountNode {
    File { contents: String },
    Directory(MountTree),
}

pub type MountTree = BTreeMap<String, MountNode>;

/// Convert a project tree into the engine's mount format. The root folder
/// name is dropped: its items become the runtime filesystem root.
pub fn transform_tree(tree: &ProjectTree) -> MountTree {
    let mut out = MountTree::new();
    for item in &tree.items {
        insert_node(&mut out, item);
    }
    out
}

fn insert_node(out: &mut MountTree, node: &TreeNode) {
    match node {
        TreeNode::File(f) => {
            out.insert(
                f.file_name(),
                MountNode::File {
                    contents: f.content.clone(),
                },
            );
        }
        TreeNode::Folder(d) => {
            out.insert(d.folder_name.clone(), MountNode::Directory(transform_tree(d)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_tree_str;

    fn sample() -> ProjectTree {
        parse_tree_str(
            r#"{
              "folderName": "app",
              "items": [
                { "filename": "package", "fileExtension": "json", "content": "{}" },
                {
                  "folderName": "src",
                  "items": [
                    { "filename": "index", "fileExtension": "js", "content": "x" }
                  ]
                }
              ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn transform_drops_root_folder() {
        let mount = transform_tree(&sample());
        assert!(mount.contains_key("package.json"));
        assert!(mount.contains_key("src"));
        assert!(!mount.contains_key("app"));
    }

    #[test]
    fn transform_nests_directories() {
        let mount = transform_tree(&sample());
        let MountNode::Directory(src) = &mount["src"] else {
            panic!("expected directory");
        };
        assert_eq!(
            src["index.js"],
            MountNode::File {
                contents: "x".to_owned()
            }
        );
    }

    #[test]
    fn mount_json_shape_is_engine_format() {
        let mount = transform_tree(&sample());
        let json = serde_json::to_value(&mount).unwrap();
        assert_eq!(json["package.json"]["file"]["contents"], "{}");
        assert_eq!(json["src"]["directory"]["index.js"]["file"]["contents"], "x");
    }
}
