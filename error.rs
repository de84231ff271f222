//! Synchronous error type for controller and endpoint operations
//!
//! Per-transfer (hardware reported) errors are in [crate::status::TransferError], these are the
//! errors that are returned directly to a caller.

/// Error returned by create/submit/abort and the bring-up sequence
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Error
{
	/// A descriptor block (or other DMA memory) could not be allocated
	NoMemory,
	/// The periodic schedule can't fit the requested reservation
	NoBandwidth,
	/// A request parameter was out of range (packet size, polling rate, buffer length)
	InvalidArgument(&'static str),
	/// Root hub port index out of range
	BadPort(u8),
	/// The endpoint handle doesn't refer to a live endpoint (or is the wrong kind)
	UnknownEndpoint,
	/// The endpoint is in the middle of an abort
	Busy,
	/// Isochronous start frame is before the first frame the endpoint can accept
	TooOld,
	/// Isochronous start frame is more than one periodic table span in the future
	TooNew,
	/// A bounded hardware wait expired
	Timeout(&'static str),
	/// The controller failed a mandatory step (halt/reset), and cannot be used
	Fatal(&'static str),
}
impl ::core::fmt::Display for Error
{
	fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
		match *self
		{
		Error::NoMemory => f.write_str("out of DMA memory"),
		Error::NoBandwidth => f.write_str("insufficient periodic bandwidth"),
		Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
		Error::BadPort(p) => write!(f, "bad root hub port {}", p),
		Error::UnknownEndpoint => f.write_str("unknown endpoint"),
		Error::Busy => f.write_str("endpoint busy (abort in progress)"),
		Error::TooOld => f.write_str("start frame already passed"),
		Error::TooNew => f.write_str("start frame too far in the future"),
		Error::Timeout(what) => write!(f, "timed out waiting for {}", what),
		Error::Fatal(what) => write!(f, "controller failure: {}", what),
		}
	}
}
