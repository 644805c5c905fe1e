// Core modules implementing durable mapping, bulk copy, pools, and error modeling.
pub mod blk;
pub mod error;
pub mod log;
pub mod memcpy;
pub mod pmem;
