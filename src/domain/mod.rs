pub mod battery;
pub mod debouncer;
pub mod energy;
pub mod models;
pub mod session_state;
