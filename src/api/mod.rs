pub mod forwards;
pub mod imports;
pub mod repositories;
pub mod stats;

pub use forwards::*;
pub use imports::*;
pub use repositories::*;
pub use stats::*;
