//! Core engine services: configuration loading and validation

pub mod config;
