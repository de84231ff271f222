//! Hardware status decoding and completion types
//!
//! All of the descriptor status bits (qTD, iTD and siTD) are turned into a [TransferError] here,
//! and only here.
use ::alloc::boxed::Box;
use ::alloc::vec::Vec;
use crate::hw_structs;

/// Per-transfer error, delivered through the completion callback
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum TransferError
{
    /// Endpoint returned a STALL handshake
    Stall,
    /// No (valid) response from the device, or the transaction translator reported an error
    DeviceNotResponding,
    /// Babble: the device sent more data than expected
    Overrun,
    /// The controller couldn't write received data to memory fast enough
    BufferOverrun,
    /// The controller couldn't fetch data to send fast enough
    BufferUnderrun,
    /// Corrupted or unexpected PID on an isochronous transaction
    WrongPid,
    /// A split transaction's microframe was missed
    MissedMicroframe,
    /// No progress (or completion) before the deadline
    Timeout,
    /// Endpoint aborted or deleted
    Cancelled,
    /// Isochronous packet whose frame had already passed when it could be scheduled
    TooLate,
}

/// Result of a control/bulk/interrupt transfer
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct TransferResult
{
    /// Bytes transferred (data stage only, for control transfers)
    pub actual_len: usize,
    pub status: Result<(), TransferError>,
}

/// Result of a single isochronous packet
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct IsochPacketResult
{
    pub actual_len: usize,
    pub status: Result<(), TransferError>,
    /// Time (monotonic microseconds) the descriptor carrying this packet was retired
    pub timestamp_us: u64,
}

/// Result of an isochronous request
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct IsochResult
{
    pub start_frame: u64,
    pub packets: Vec<IsochPacketResult>,
}

pub type TransferCallback = Box<dyn FnOnce(TransferResult) + Send>;
pub type IsochCallback = Box<dyn FnOnce(IsochResult) + Send>;

/// Which hardware descriptor the status bits came from
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum StatusSource
{
    Qtd,
    Itd,
    Sitd,
}

/// Transfer context needed to pick between otherwise ambiguous error classes
#[derive(Debug,Copy,Clone)]
pub struct StatusContext
{
    pub source: StatusSource,
    pub dir_in: bool,
    pub split: bool,
}

/// Decoded status flags, independent of descriptor layout
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct StatusBits
{
    pub active: bool,
    pub halted: bool,
    pub data_buffer: bool,
    pub babble: bool,
    pub xact: bool,
    pub missed_uframe: bool,
    /// Transaction translator ERR handshake (siTD only)
    pub tt_error: bool,
}
impl StatusBits
{
    pub fn from_qtd(token: u32) -> Self {
        StatusBits {
            active: token & hw_structs::QTD_TOKEN_STS_ACTIVE != 0,
            halted: token & hw_structs::QTD_TOKEN_STS_HALT != 0,
            data_buffer: token & hw_structs::QTD_TOKEN_STS_DATABUF != 0,
            babble: token & hw_structs::QTD_TOKEN_STS_BABBLE != 0,
            xact: token & hw_structs::QTD_TOKEN_STS_XACTERR != 0,
            missed_uframe: token & hw_structs::QTD_TOKEN_STS_MISSEDUF != 0,
            tt_error: false,
        }
    }
    pub fn from_itd(transaction: u32) -> Self {
        StatusBits {
            active: transaction & hw_structs::ITD_TRANS_ACTIVE != 0,
            data_buffer: transaction & hw_structs::ITD_TRANS_DATABUF != 0,
            babble: transaction & hw_structs::ITD_TRANS_BABBLE != 0,
            xact: transaction & hw_structs::ITD_TRANS_XACTERR != 0,
            ..Default::default()
        }
    }
    pub fn from_sitd(state: u32) -> Self {
        StatusBits {
            active: state & hw_structs::SITD_STS_ACTIVE != 0,
            tt_error: state & hw_structs::SITD_STS_ERR != 0,
            data_buffer: state & hw_structs::SITD_STS_DATABUF != 0,
            babble: state & hw_structs::SITD_STS_BABBLE != 0,
            xact: state & hw_structs::SITD_STS_XACTERR != 0,
            missed_uframe: state & hw_structs::SITD_STS_MISSEDUF != 0,
            ..Default::default()
        }
    }

    /// Is this a (possibly transient) bus error that can be retried by re-arming the descriptor
    pub fn is_bus_error(&self) -> bool {
        self.xact && !self.babble && !self.data_buffer
    }
}

/// Classify the status of a retired descriptor
///
/// Returns `None` for success. The order of the checks matters when more than one bit is set.
pub fn decode(bits: StatusBits, ctx: StatusContext) -> Option<TransferError>
{
    if bits.babble {
        // Babble on a split OUT can only come from the TT failing to deliver, not the device talking too much
        return Some(if !ctx.dir_in && ctx.split { TransferError::DeviceNotResponding } else { TransferError::Overrun });
    }
    if bits.data_buffer {
        return Some(if ctx.dir_in { TransferError::BufferOverrun } else { TransferError::BufferUnderrun });
    }
    if bits.xact {
        return Some(match ctx.source
            {
            StatusSource::Qtd => TransferError::DeviceNotResponding,
            // Isochronous transactions have no handshake, a transaction error means a bad PID/CRC on the data
            StatusSource::Itd | StatusSource::Sitd => TransferError::WrongPid,
            });
    }
    if bits.tt_error {
        return Some(TransferError::DeviceNotResponding);
    }
    if bits.missed_uframe {
        return Some(TransferError::MissedMicroframe);
    }
    if bits.halted {
        return Some(TransferError::Stall);
    }
    None
}

#[cfg(test)]
mod tests
{
    use super::*;

    const IN_HS: StatusContext = StatusContext { source: StatusSource::Qtd, dir_in: true, split: false };
    const OUT_SPLIT: StatusContext = StatusContext { source: StatusSource::Qtd, dir_in: false, split: true };

    #[test]
    fn babble_direction_tie_break()
    {
        let bits = StatusBits::from_qtd(hw_structs::QTD_TOKEN_STS_HALT | hw_structs::QTD_TOKEN_STS_BABBLE);
        assert_eq!(decode(bits, IN_HS), Some(TransferError::Overrun));
        assert_eq!(decode(bits, OUT_SPLIT), Some(TransferError::DeviceNotResponding));
        // Non-split OUT babble is still an overrun
        assert_eq!(decode(bits, StatusContext { split: false, ..OUT_SPLIT }), Some(TransferError::Overrun));
    }

    #[test]
    fn sitd_babble_in()
    {
        let ctx = StatusContext { source: StatusSource::Sitd, dir_in: true, split: true };
        assert_eq!(decode(StatusBits::from_sitd(hw_structs::SITD_STS_BABBLE), ctx), Some(TransferError::Overrun));
    }

    #[test]
    fn buffer_errors()
    {
        let bits = StatusBits::from_qtd(hw_structs::QTD_TOKEN_STS_DATABUF | hw_structs::QTD_TOKEN_STS_HALT);
        assert_eq!(decode(bits, IN_HS), Some(TransferError::BufferOverrun));
        assert_eq!(decode(bits, StatusContext { dir_in: false, ..IN_HS }), Some(TransferError::BufferUnderrun));
    }

    #[test]
    fn halt_only_is_stall()
    {
        assert_eq!(decode(StatusBits::from_qtd(hw_structs::QTD_TOKEN_STS_HALT), IN_HS), Some(TransferError::Stall));
        assert_eq!(decode(StatusBits::from_qtd(0), IN_HS), None);
    }

    #[test]
    fn transaction_errors()
    {
        let q = StatusBits::from_qtd(hw_structs::QTD_TOKEN_STS_HALT | hw_structs::QTD_TOKEN_STS_XACTERR);
        assert!(q.is_bus_error());
        assert_eq!(decode(q, IN_HS), Some(TransferError::DeviceNotResponding));
        let i = StatusBits::from_itd(hw_structs::ITD_TRANS_XACTERR);
        assert_eq!(decode(i, StatusContext { source: StatusSource::Itd, dir_in: true, split: false }), Some(TransferError::WrongPid));
        let s = StatusBits::from_sitd(hw_structs::SITD_STS_ERR);
        assert_eq!(decode(s, StatusContext { source: StatusSource::Sitd, dir_in: false, split: true }), Some(TransferError::DeviceNotResponding));
        let m = StatusBits::from_sitd(hw_structs::SITD_STS_MISSEDUF);
        assert_eq!(decode(m, StatusContext { source: StatusSource::Sitd, dir_in: true, split: true }), Some(TransferError::MissedMicroframe));
    }
}
