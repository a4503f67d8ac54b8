pub mod background;
pub mod common;
pub mod completions;
pub mod conflicts;
pub mod diagnostics;
pub mod record;
pub mod reset;
pub mod status;
pub mod sync;
