pub mod complaint;
pub mod stats_models;
