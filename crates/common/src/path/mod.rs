pub mod denylist;
pub mod normalize;

pub use denylist::is_denylisted;
pub use normalize::{normalize_path, PathError};
