pub mod api;
pub mod db;
pub mod display;
pub mod http_transport;
pub mod remote_session;
pub mod sysfs_input;
