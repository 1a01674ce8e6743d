//! Metricator.
//!
//! Metricator is a standalone web service that keeps a cached copy of a remote dataset fresh in
//! the background and computes metrics over it on demand. Metric requests are answered with a task
//! id that can be polled for the results.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;


fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
