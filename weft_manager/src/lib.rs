//! # Weft Manager
//!
//! Command line front end for the weft pipeline: recording intake,
//! analysis, rewriting, replay, fuzzing campaigns and statistics over a
//! result directory.

pub mod commands;
pub mod report;
