pub mod dirty_mask;
pub mod graph;
pub mod mutator;
pub mod record;
pub mod registry;
