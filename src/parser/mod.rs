//! Tree Parsing Module
//!
//! Turns an uploaded directory-tree export into a typed, cached file list.

pub mod encoding;
pub mod file_types;
pub mod tree;

pub use file_types::{FileCategory, FileTypeSets};
pub use tree::{filter_files, ParseResult, ParsedEntry, TreeParser, TypeStats};
