pub mod app;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod logs;
pub mod merger;
pub mod model;
pub mod order;
pub mod prober;
pub mod reachability;
pub mod resolver;
pub mod store;

#[cfg(test)]
mod testing;
