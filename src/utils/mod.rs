mod fs;

pub use fs::{
    clear_path, create_symlink, effective_uid, is_privileged, make_tree_writable,
    remove_staging, restore_attributes,
};
