// quillsync-common: shared types for the QuillSync workspace

pub mod error;
pub mod op;
pub mod protocol;
pub mod transform;
