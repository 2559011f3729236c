pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod exit;
pub mod logs;
pub mod platform;
pub mod report;
pub mod scan;
pub mod ui;
pub mod update;
