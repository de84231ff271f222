//! Hardware-shared descriptor layouts
//!
//! Every field is a [HwWord] - the controller can read (and for status words, write) these at
//! any time, so all accesses are volatile and stored little-endian.
#![allow(dead_code)]
use ::core::cell::UnsafeCell;

/// A 32-bit word shared with the controller
#[repr(transparent)]
pub struct HwWord(UnsafeCell<u32>);
// SAFE: All accesses are single volatile loads/stores
unsafe impl Sync for HwWord {}
impl HwWord
{
    pub const fn new(v: u32) -> Self {
        HwWord(UnsafeCell::new(v))
    }
    pub fn get(&self) -> u32 {
        // SAFE: Aligned, always-valid memory
        u32::from_le(unsafe { ::core::ptr::read_volatile(self.0.get()) })
    }
    pub fn set(&self, v: u32) {
        // SAFE: Aligned, always-valid memory
        unsafe { ::core::ptr::write_volatile(self.0.get(), v.to_le()) }
    }
    pub fn set_bits(&self, bits: u32) {
        self.set(self.get() | bits)
    }
    pub fn clear_bits(&self, bits: u32) {
        self.set(self.get() & !bits)
    }
}
impl ::core::fmt::Debug for HwWord {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{:#x}", self.get())
    }
}

/// Link pointer: terminate bit
pub const LINK_TERMINATE: u32 = 1;
/// Link pointer: type field (bits 2:1)
pub const LINK_TY_ITD : u32 = 0b00 << 1;
pub const LINK_TY_QH  : u32 = 0b01 << 1;
pub const LINK_TY_SITD: u32 = 0b10 << 1;
pub const LINK_TY_FSTN: u32 = 0b11 << 1;
pub const LINK_TY_MASK: u32 = 0b11 << 1;

/// Ensure that the CPU's writes to descriptors are visible before a following publishing write
pub fn publish_barrier() {
    ::core::sync::atomic::fence(::core::sync::atomic::Ordering::SeqCst);
}

fn fmt_link(f: &mut ::core::fmt::Formatter, v: u32) -> ::core::fmt::Result {
    write!(f, "{addr:#x}/{ty}{t}",
        addr = v & !0x1F,
        ty = ["iTD","QH","siTD","FSTN"][ ((v >> 1) & 3) as usize ],
        t = ["","/T"][ (v & 1) as usize ]
        )
}

#[repr(C,align(32))]
pub struct TransferDesc
{
    pub link: HwWord,
    /// Used when there's a short packet
    pub link2: HwWord,
    pub token: HwWord,
    /// First has offset in low 12 bits
    pub pages: [HwWord; 5],
    /// 64-bit extension (only read by 64-bit capable controllers)
    pub pages_hi: [HwWord; 5],
}
const _: [(); 1] = [(); (::core::mem::size_of::<TransferDesc>() == 64) as usize];
impl TransferDesc {
    pub fn token_len(token: u32) -> usize {
        ((token >> QTD_TOKEN_LEN_SHIFT) & 0x7FFF) as usize
    }
    /// Clear to a terminated, inactive descriptor
    pub fn reset(&self) {
        self.link.set(LINK_TERMINATE);
        self.link2.set(LINK_TERMINATE);
        self.token.set(0);
        for p in self.pages.iter().chain(self.pages_hi.iter()) {
            p.set(0);
        }
    }
}
impl ::core::fmt::Debug for TransferDesc {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        let token = self.token.get();
        f.debug_struct("TransferDesc")
            .field("link", &format_args!("{:#x}{}", self.link.get() & !0x1F, ["","/T"][ (self.link.get() & 1) as usize ]))
            .field("link2", &format_args!("{:#x}{}", self.link2.get() & !0x1F, ["","/T"][ (self.link2.get() & 1) as usize ]))
            .field("token", &format_args!("{nb}b{ioc}{dt}/{c_page}/{cerr}/{pid}/{status:02x}",
                nb = (token >> 16) & 0x7FFF,
                ioc = ["","/IOC"][ (token >> 15) as usize & 1 ],
                c_page = (token >> 12) & 7, // C_Page
                cerr = (token >> 10) & 3, // CERR
                pid = ["OUT","IN","SETUP","resv"][ (token >> 8) as usize & 3 ],
                status = token & 0xFF,
                dt = if token & QTD_TOKEN_DATATGL != 0 { "/DT" } else { "" },
                ))
            .field("page0", &self.pages[0])
            .finish()
    }
}

pub const QTD_TOKEN_DATATGL     : u32 = 1<<31;
pub const QTD_TOKEN_LEN_SHIFT   : u32 = 16;
pub const QTD_TOKEN_LEN_MASK    : u32 = 0x7FFF << 16;
pub const QTD_TOKEN_IOC         : u32 = 1<<15;
pub const QTD_TOKEN_CERR_SHIFT  : u32 = 10;
pub const QTD_TOKEN_CERR_MASK   : u32 = 3 << 10;
pub const QTD_TOKEN_PID_SHIFT   : u32 = 8;
pub const QTD_TOKEN_STS_ACTIVE  : u32 = 1<< 7;
pub const QTD_TOKEN_STS_HALT    : u32 = 1<< 6;
pub const QTD_TOKEN_STS_DATABUF : u32 = 1<< 5;
pub const QTD_TOKEN_STS_BABBLE  : u32 = 1<< 4;
pub const QTD_TOKEN_STS_XACTERR : u32 = 1<< 3;
pub const QTD_TOKEN_STS_MISSEDUF: u32 = 1<< 2;
pub const QTD_TOKEN_STS_SPLITX  : u32 = 1<< 1;
pub const QTD_TOKEN_STS_PING    : u32 = 1<< 0;
pub const QTD_TOKEN_STS_MASK    : u32 = 0xFF;
/// Largest byte count a single qTD can describe
pub const QTD_MAX_BYTES: usize = 5 * 0x1000;

#[derive(Copy,Clone,Debug,PartialEq,Eq)]
pub enum Pid
{
    Out = 0,
    In = 1,
    Setup = 2,
}

#[repr(C,align(32))]
pub struct QueueHead
{
    /// Horizontal link:
    /// - 31:5 = Address
    /// - 4:3 = Reserved
    /// - 2:1 = Type (00=iTD, 01=QH, 10=siTD, 11=FSTN)
    /// - 0 = Terminate (only used for non-async, see spec 4.8.2)
    pub hlink: HwWord,
    pub endpoint: HwWord,
    pub endpoint_ext: HwWord,
    /// Pointer to the current descriptor (note: this is written by hardware)
    pub current_td: HwWord,
    // Transfer overlay - can't use TransferDesc as it's aligned
    pub overlay_link: HwWord,
    pub overlay_link2: HwWord,
    pub overlay_token: HwWord,
    pub overlay_pages: [HwWord; 5],
    pub overlay_pages_hi: [HwWord; 5],
}
const _: [(); 1] = [(); (::core::mem::size_of::<QueueHead>() == 96) as usize];
impl QueueHead {
    pub fn reset(&self) {
        self.hlink.set(LINK_TERMINATE);
        self.endpoint.set(0);
        self.endpoint_ext.set(0);
        self.current_td.set(0);
        self.overlay_link.set(LINK_TERMINATE);
        self.overlay_link2.set(LINK_TERMINATE);
        self.overlay_token.set(0);
        for p in self.overlay_pages.iter().chain(self.overlay_pages_hi.iter()) {
            p.set(0);
        }
    }
}
impl ::core::fmt::Debug for QueueHead {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        struct L(u32);
        impl ::core::fmt::Debug for L {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result { fmt_link(f, self.0) }
        }
        f.debug_struct("QueueHead")
            .field("hlink", &L(self.hlink.get()))
            .field("endpoint", &self.endpoint)
            .field("endpoint_ext", &self.endpoint_ext)
            .field("current_td", &self.current_td)
            .field("overlay_link", &self.overlay_link)
            .field("overlay_token", &self.overlay_token)
            .finish()
    }
}

// Endpoint characteristics (`endpoint`)
pub const QH_ENDPT_DEVADDR_MASK: u32 = 0x7F;
pub const QH_ENDPT_INACTIVATE  : u32 = 1 << 7;
pub const QH_ENDPT_ENDPT_SHIFT : u32 = 8;
pub const QH_ENDPT_EPS_SHIFT   : u32 = 12;
pub const QH_ENDPT_EPS_FULL    : u32 = 0b00 << 12;
pub const QH_ENDPT_EPS_LOW     : u32 = 0b01 << 12;
pub const QH_ENDPT_EPS_HIGH    : u32 = 0b10 << 12;
/// Data toggle control (take the toggle from the qTD, not the QH)
pub const QH_ENDPT_DTC         : u32 = 1 << 14;
/// Head of reclamation list
pub const QH_ENDPT_H           : u32 = 1 << 15;
pub const QH_ENDPT_MPS_SHIFT   : u32 = 16;
/// Control endpoint flag (only for non-high-speed control endpoints)
pub const QH_ENDPT_C           : u32 = 1 << 27;
pub const QH_ENDPT_RL_SHIFT    : u32 = 28;
// Endpoint capabilities (`endpoint_ext`)
pub const QH_EXT_SMASK_MASK    : u32 = 0xFF;
pub const QH_EXT_CMASK_SHIFT   : u32 = 8;
pub const QH_EXT_HUBADDR_SHIFT : u32 = 16;
pub const QH_EXT_PORT_SHIFT    : u32 = 23;
pub const QH_EXT_MULT_SHIFT    : u32 = 30;

/// High-speed isochronous transfer descriptor (one frame, up to eight microframe transactions)
#[repr(C,align(32))]
pub struct IsochDesc
{
    pub next: HwWord,
    /// Per-microframe transaction status/control
    pub transactions: [HwWord; 8],
    /// Buffer pointers, the low bits of the first three also hold endpoint information
    pub pages: [HwWord; 7],
    pub pages_hi: [HwWord; 7],
}
const _: [(); 1] = [(); (::core::mem::size_of::<IsochDesc>() == 96) as usize];
impl IsochDesc {
    pub fn reset(&self) {
        self.next.set(LINK_TERMINATE);
        for w in self.transactions.iter().chain(self.pages.iter()).chain(self.pages_hi.iter()) {
            w.set(0);
        }
    }
}
impl ::core::fmt::Debug for IsochDesc {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        f.debug_struct("IsochDesc")
            .field("next", &self.next)
            .field("transactions", &self.transactions)
            .field("pages", &self.pages)
            .finish()
    }
}

pub const ITD_TRANS_ACTIVE    : u32 = 1 << 31;
pub const ITD_TRANS_DATABUF   : u32 = 1 << 30;
pub const ITD_TRANS_BABBLE    : u32 = 1 << 29;
pub const ITD_TRANS_XACTERR   : u32 = 1 << 28;
pub const ITD_TRANS_STATUS_MASK: u32 = 0xF << 28;
pub const ITD_TRANS_LEN_SHIFT : u32 = 16;
pub const ITD_TRANS_LEN_MASK  : u32 = 0xFFF << 16;
pub const ITD_TRANS_IOC       : u32 = 1 << 15;
pub const ITD_TRANS_PG_SHIFT  : u32 = 12;
pub const ITD_PAGE1_DIR_IN    : u32 = 1 << 11;
/// Largest payload of one high-speed isochronous transaction
pub const ITD_MAX_TRANSACTION : usize = 3 * 1024;

/// Split-transaction isochronous descriptor (one full-speed frame)
#[repr(C,align(32))]
pub struct SplitIsochDesc
{
    pub next: HwWord,
    /// Direction, port, hub address, endpoint, device
    pub endpoint: HwWord,
    /// Complete-split mask (15:8), start-split mask (7:0)
    pub uframe: HwWord,
    /// IOC, page select, total bytes, complete-split progress, status
    pub state: HwWord,
    pub pages: [HwWord; 2],
    pub back: HwWord,
    pub pages_hi: [HwWord; 2],
}
const _: [(); 1] = [(); (::core::mem::size_of::<SplitIsochDesc>() == 64) as usize];
impl SplitIsochDesc {
    pub fn reset(&self) {
        self.next.set(LINK_TERMINATE);
        self.endpoint.set(0);
        self.uframe.set(0);
        self.state.set(0);
        self.back.set(LINK_TERMINATE);
        for w in self.pages.iter().chain(self.pages_hi.iter()) {
            w.set(0);
        }
    }
}
impl ::core::fmt::Debug for SplitIsochDesc {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        let state = self.state.get();
        f.debug_struct("SplitIsochDesc")
            .field("next", &self.next)
            .field("endpoint", &self.endpoint)
            .field("uframe", &format_args!("S={:08b} C={:08b}", self.uframe.get() & 0xFF, (self.uframe.get() >> 8) & 0xFF))
            .field("state", &format_args!("{nb}b{ioc}/{status:02x}",
                nb = (state >> 16) & 0x3FF,
                ioc = ["","/IOC"][ (state >> 31) as usize ],
                status = state & 0xFF,
                ))
            .field("back", &self.back)
            .finish()
    }
}

pub const SITD_EP_DIR_IN      : u32 = 1 << 31;
pub const SITD_EP_PORT_SHIFT  : u32 = 24;
pub const SITD_EP_HUB_SHIFT   : u32 = 16;
pub const SITD_EP_ENDPT_SHIFT : u32 = 8;
pub const SITD_UF_CMASK_SHIFT : u32 = 8;
pub const SITD_STATE_IOC      : u32 = 1 << 31;
pub const SITD_STATE_PAGESEL  : u32 = 1 << 30;
pub const SITD_STATE_LEN_SHIFT: u32 = 16;
pub const SITD_STATE_LEN_MASK : u32 = 0x3FF << 16;
pub const SITD_STS_ACTIVE     : u32 = 1 << 7;
/// Transaction translator reported an error handshake
pub const SITD_STS_ERR        : u32 = 1 << 6;
pub const SITD_STS_DATABUF    : u32 = 1 << 5;
pub const SITD_STS_BABBLE     : u32 = 1 << 4;
pub const SITD_STS_XACTERR    : u32 = 1 << 3;
pub const SITD_STS_MISSEDUF   : u32 = 1 << 2;
pub const SITD_STS_SPLITX     : u32 = 1 << 1;
/// Transaction position: the whole payload fits in one start-split
pub const SITD_BP1_TP_ALL     : u32 = 0b00 << 3;
pub const SITD_BP1_TP_BEGIN   : u32 = 0b01 << 3;
/// Largest payload of one full-speed isochronous transaction
pub const SITD_MAX_TRANSACTION: usize = 1023;
/// Bytes per start-split (full-speed bytes per microframe)
pub const SPLIT_BYTES_PER_UFRAME: u32 = 188;

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn hw_word_is_little_endian()
    {
        let w = HwWord::new(0);
        w.set(0x1234_5678);
        assert_eq!(w.get(), 0x1234_5678);
        // SAFE: Reading the raw storage of a local
        let raw = unsafe { *w.0.get() };
        assert_eq!(raw.to_ne_bytes(), 0x1234_5678u32.to_le_bytes());
        w.clear_bits(0x78);
        w.set_bits(1);
        assert_eq!(w.get(), 0x1234_5601);
    }
}
