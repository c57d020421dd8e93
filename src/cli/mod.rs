//! Command-line front end over the application state coordinator.
mod app;
mod args;

pub use app::*;
pub use args::*;
