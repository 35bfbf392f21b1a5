//! # raster2sensor parallel
//!
//! Processing modes shared by the per-pixel and per-plot algorithms.
//! Without the `parallel` feature every mode runs sequentially.

pub mod strategy;

pub use strategy::{ParallelStrategy, ProcessingMode};
