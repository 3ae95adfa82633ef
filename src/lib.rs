pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod optimizer;
pub mod prices;
pub mod repo;
pub mod telemetry;
