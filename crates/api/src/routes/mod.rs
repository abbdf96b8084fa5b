//! Route handlers

pub mod predict;
