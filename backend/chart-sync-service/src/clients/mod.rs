pub mod source;
pub mod target;
pub mod time;

pub use source::{ChangeSource, HttpChangeSource};
pub use target::{HttpNotesTarget, NotesTarget};
pub use time::format_source_time;
