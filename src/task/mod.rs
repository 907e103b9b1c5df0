pub mod media;
pub mod types;

pub use media::{
    corrected_file_name, detect_extension, extension_for_content_type, file_extension,
    sanitize_file_name, MediaKind, FALLBACK_FILE_NAME, SNIFF_LEN,
};
pub use types::{
    OwnerId, SourceDescriptor, Task, TaskErrorKind, TaskId, TaskSnapshot, TaskState, Tier,
};
