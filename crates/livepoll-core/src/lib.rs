// Library root: the poll session core shared by the server binary and tests.

pub mod config;
pub mod poll;
pub mod protocol;
pub mod registry;
