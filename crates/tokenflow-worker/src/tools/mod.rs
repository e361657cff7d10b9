//! Built-in adapters.

mod fixture;
mod noop;

pub use fixture::FixtureAdapter;
pub use noop::NoopAdapter;
