//! Shared utility functions.

pub mod extraction;

pub use extraction::{
    code_blocks, extract_code_block, extract_implementation, extract_json_object,
    find_matching_brace, CodeBlock,
};
