//! Tree file names.
//!
//! A data file's tree lives next to it under the same name with its
//! extension replaced by `mkl`. Long names are cut so the result still fits
//! the 32-character limit.

use treecast_core::wire::MAX_FILENAME_LENGTH;

pub const TREE_EXTENSION: &str = "mkl";

/// Characters of the data name kept before the `.mkl` suffix.
const STEM_LIMIT: usize = MAX_FILENAME_LENGTH - 4;

/// Name of the tree file for `data_name`.
pub fn tree_name(data_name: &str) -> String {
    let head: String = data_name.chars().take(STEM_LIMIT).collect();
    let stem = match head.rfind('.') {
        Some(dot) => &head[..dot],
        None => head.as_str(),
    };
    format!("{stem}.{TREE_EXTENSION}")
}

/// True for names that are themselves trees. These are never sent or received.
pub fn is_tree_name(name: &str) -> bool {
    name.ends_with(TREE_EXTENSION)
}
