mod allocator;
mod coalescer;
mod dir;

pub use allocator::{reserve, AllocError, DumpPair, MAX_DUMPS};
pub use coalescer::{WriteCoalescer, BUF_SIZE};
pub use dir::DumpDir;
