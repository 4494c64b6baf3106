//! HTTP transport and configuration for the model server

pub mod api;
pub mod config;
