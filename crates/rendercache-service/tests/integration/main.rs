// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod executor;
pub mod invalidation;
pub mod jobs;
pub mod utils;

pub use utils::*;
