//! OS process control: subtree termination and owned-child shutdown.

pub mod child;
pub mod tree;

pub use child::shutdown_child;
pub use tree::{is_alive, pid_exists, terminate_tree};
