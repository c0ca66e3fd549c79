pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{completed, seeded_bytes};
