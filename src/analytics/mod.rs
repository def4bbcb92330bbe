pub mod aggregator;

pub use aggregator::{apply_delta, on_assign, on_release, on_reset};
