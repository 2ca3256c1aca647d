pub mod concurrent;
pub mod fs;
pub mod http;
pub mod locks;
pub mod size;

pub use concurrent::run_concurrent;
pub use fs::Directory;
pub use locks::KeyedLocks;
pub use size::Size;
