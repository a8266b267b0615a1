pub mod aggregator;
pub mod authority;
pub mod guard;
pub mod profiles;
pub mod synthetic;
pub mod types;

#[cfg(test)]
pub mod test_support;

pub use types::*;
