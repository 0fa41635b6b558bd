//! Command-line runner for the kube auth proxy supervisor

pub mod app;
pub mod cli;
pub mod logging;
pub mod output;
