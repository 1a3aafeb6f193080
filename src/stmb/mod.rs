pub mod arcs;
pub mod audit;
pub mod binding;
pub mod compile;
pub mod config;
pub mod engine;
pub mod host;
pub mod json_repair;
pub mod lock;
pub mod lorebook;
pub mod markers;
pub mod paths;
pub mod pipeline;
pub mod profile;
pub mod scheduler;
pub mod sideprompts;
pub mod store;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
