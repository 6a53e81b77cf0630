pub mod logger;
pub mod signal;

pub use signal::shutdown_signal;
