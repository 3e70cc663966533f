mod fence;

pub use fence::{Fence, FencePool, WAIT_FOREVER};
