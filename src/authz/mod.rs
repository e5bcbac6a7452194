pub mod cache;
pub mod compiler;
pub mod condition;
pub mod engine;
pub mod errors;
pub mod geometry;
pub mod reference;
pub mod residual;
pub mod types;
pub mod web;
