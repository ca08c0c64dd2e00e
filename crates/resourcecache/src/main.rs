//! resourcecache.
//!
//! A command line front end to the resource cache: it keeps watching a resource type or polling
//! an external JSON endpoint through the cache, printing what it sees and how long each lookup
//! took.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
