mod coordinator;

pub use coordinator::{run_direct, Coordinator};
