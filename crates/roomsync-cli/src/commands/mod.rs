pub mod common;
pub mod completions;
pub mod serve;
pub mod status;
pub mod sync;
pub mod usage;
