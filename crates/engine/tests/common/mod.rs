pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{
    PART_SIZE, TestEngine, body, channel_body, chunked, failing_body, seeded_bytes, test_engine,
};
#[allow(unused_imports)]
pub use mocks::FlakyBackend;
