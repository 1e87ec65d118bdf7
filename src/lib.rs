//! Artifact transformation job service
//!
//! Accepts uploaded images and documents, runs each through a named method
//! (upscale, restore, convert, collage, PDF merge, ...) on a pool of workers,
//! and serves the results for download until they expire.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
