pub mod finding;
pub mod raw;
pub mod scan;
pub mod target;
pub mod vulnerability;

// Re-export commonly used types
pub use finding::*;
pub use raw::*;
pub use scan::*;
pub use target::*;
pub use vulnerability::*;
