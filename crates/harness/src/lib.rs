mod bench;

pub use bench::{OverlayPair, TestWorkbench, init_test_logging};
