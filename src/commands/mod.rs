pub mod app_command;
pub mod handler;

pub use app_command::{AppCommand, USAGE};
pub use handler::{dispatch, Reply};
