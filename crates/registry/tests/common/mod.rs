pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{dataset, fixture_path};
