pub mod admission;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
