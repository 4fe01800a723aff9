#[macro_use]
pub mod strong_type;

pub mod ids;
pub mod time;

// Re-export commonly used items at the crate root.
pub use ids::*;
pub use time::Timespec;
