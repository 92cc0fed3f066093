//! Machina CLI - trusted install, update, and publish tooling.

pub mod commands;
