// Utility functions

pub mod clock;
pub mod logger;
pub mod retry;

pub use clock::*;
pub use logger::*;
pub use retry::*;
