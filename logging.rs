//! Kernel-style logging macros, backed by the `log` crate
//!
//! The interrupt filter stage never calls any of these.

/// "Error" - The controller (or an endpoint) errored, and most likely will no longer function
macro_rules! log_error {
	($($arg:tt)*) => ( ::log::error!($($arg)*) );
}
/// Warning - Something unexpected happened, but it was recovered
macro_rules! log_warning {
	($($arg:tt)*) => ( ::log::warn!($($arg)*) );
}
/// Notice - Out of the ordinary, but not unexpected
macro_rules! log_notice {
	($($arg:tt)*) => ( ::log::info!($($arg)*) );
}
/// Debug - Low level debugging information (values mostly)
macro_rules! log_debug {
	($($arg:tt)*) => ( ::log::debug!($($arg)*) );
}
/// Trace - Very low level debugging information (action-by-action updates)
macro_rules! log_trace {
	($fmt:expr, $($arg:expr),*) => ( ::log::trace!(concat!("L{}: ", $fmt), line!() $(, $arg)*) );
	($fmt:expr) => ( ::log::trace!(concat!("L{}: ", $fmt), line!()) );
}
