// Library root: exposes the server's modules so integration tests can drive
// the poll loop and the transport directly.

pub mod app;
pub mod gateway;
pub mod ws_server;
