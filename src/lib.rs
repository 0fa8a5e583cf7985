pub mod cli;
pub mod data;
pub mod eval;
pub mod experiment;
pub mod generator;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod module;
