use super::{json_pretty, EXIT_SUCCESS};
use sandbar_tree::{parse_tree_file, transform_tree};
use std::path::Path;

/// Parse a project tree document and print the runtime mount tree it
/// transforms into.
pub fn run(tree_path: &Path) -> Result<u8, String> {
    let tree = parse_tree_file(tree_path).map_err(|e| format!("tree error: {e}"))?;
    let files = transform_tree(&tree);
    println!("{}", json_pretty(&files)?);
    Ok(EXIT_SUCCESS)
}
