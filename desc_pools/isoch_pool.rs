//! Isochronous (iTD) and split-isochronous (siTD) descriptor pool helpers
use crate::hw_structs;
use crate::platform::{DmaBuffer,PAGE_SIZE};
use crate::host_periodic::PeriodicLink;
use super::{ItdPool,ItdId,SitdPool,SitdId};

/// An isochronous descriptor of either flavour
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum IsochNode
{
    Itd(ItdId),
    Sitd(SitdId),
}
impl From<IsochNode> for PeriodicLink {
    fn from(n: IsochNode) -> PeriodicLink {
        match n
        {
        IsochNode::Itd(i) => PeriodicLink::Itd(i),
        IsochNode::Sitd(i) => PeriodicLink::Sitd(i),
        }
    }
}

/// Software state shared by both isochronous descriptor types
#[derive(Default)]
pub struct IsochMeta
{
    /// Owning endpoint
    pub endpoint: Option<crate::EndpointId>,
    /// Target frame (64-bit frame number)
    pub frame: u64,
    /// Sequence number of the request this descriptor belongs to
    pub request: u64,
    /// Index of the first packet (within the request) carried by this descriptor
    pub first_packet: u32,
    /// Number of packets carried (zero for a wrap-around dummy)
    pub packets: u8,
    /// Number of extra frames the transaction may still be running after `frame` (complete-splits that wrap)
    pub span: u8,
    /// Microframe of each packet (iTD only)
    pub uframes: [u8; 8],
    /// Next entry in the periodic list (while linked)
    pub next: PeriodicLink,
    /// Set once linked into the periodic table
    pub linked: bool,
    /// Link on the filter stage's done stack
    pub done_next: Option<IsochNode>,
    /// Time the filter stage retired this descriptor
    pub retired_us: u64,
}

/// Description of one high-speed isochronous descriptor
pub struct ItdFill<'a>
{
    pub dev_addr: u8,
    pub endpt: u8,
    pub dir_in: bool,
    pub max_packet_size: u16,
    pub mult: u8,
    /// Contiguous data for all transactions in this descriptor
    pub buffer: DmaBuffer,
    /// (microframe, offset into `buffer`, length)
    pub transactions: &'a [(u8, usize, usize)],
    /// Interrupt on completion of the final transaction
    pub ioc: bool,
}

impl ItdPool
{
    pub fn fill(&self, id: ItdId, f: &ItdFill) {
        let d = self.get(id);
        let base = f.buffer.phys & !(PAGE_SIZE as u64 - 1);
        for i in 0 .. 7 {
            let addr = base + (i * PAGE_SIZE) as u64;
            let addr = if addr < f.buffer.phys + f.buffer.len as u64 || i == 0 { addr } else { 0 };
            let lo = match i
                {
                0 => (f.dev_addr as u32 & 0x7F) | (f.endpt as u32 & 0xF) << 8,
                1 => (f.max_packet_size as u32 & 0x7FF) | if f.dir_in { hw_structs::ITD_PAGE1_DIR_IN } else { 0 },
                2 => f.mult as u32 & 3,
                _ => 0,
                };
            d.pages[i].set( (addr as u32 & !0xFFF) | lo );
            d.pages_hi[i].set( (addr >> 32) as u32 );
        }
        for w in d.transactions.iter() {
            w.set(0);
        }
        let n = f.transactions.len();
        for (i,&(uframe, ofs, len)) in f.transactions.iter().enumerate() {
            let addr = f.buffer.phys + ofs as u64;
            let pg = ((addr - base) / PAGE_SIZE as u64) as u32;
            let mut w = hw_structs::ITD_TRANS_ACTIVE
                | (len as u32) << hw_structs::ITD_TRANS_LEN_SHIFT
                | pg << hw_structs::ITD_TRANS_PG_SHIFT
                | (addr as u32 & 0xFFF)
                ;
            if f.ioc && i == n - 1 {
                w |= hw_structs::ITD_TRANS_IOC;
            }
            d.transactions[uframe as usize].set(w);
        }
    }
}

/// Description of one split-isochronous descriptor
pub struct SitdFill
{
    pub dev_addr: u8,
    pub endpt: u8,
    pub dir_in: bool,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub smask: u8,
    pub cmask: u8,
    pub buffer: DmaBuffer,
    pub ioc: bool,
    /// Back pointer (physical address of the previous frame's siTD, or terminate)
    pub back: u32,
}

impl SitdPool
{
    pub fn fill(&self, id: SitdId, f: &SitdFill) {
        let d = self.get(id);
        d.endpoint.set( if f.dir_in { hw_structs::SITD_EP_DIR_IN } else { 0 }
            | (f.hub_port as u32 & 0x7F) << hw_structs::SITD_EP_PORT_SHIFT
            | (f.hub_addr as u32 & 0x7F) << hw_structs::SITD_EP_HUB_SHIFT
            | (f.endpt as u32 & 0xF) << hw_structs::SITD_EP_ENDPT_SHIFT
            | (f.dev_addr as u32 & 0x7F)
            );
        d.uframe.set( (f.cmask as u32) << hw_structs::SITD_UF_CMASK_SHIFT | f.smask as u32 );
        let bp0 = f.buffer.phys;
        let bp1 = (f.buffer.phys & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
        d.pages[0].set(bp0 as u32);
        d.pages_hi[0].set((bp0 >> 32) as u32);
        let bp1_lo = if f.dir_in {
                0
            }
            else {
                let count = ((f.buffer.len + hw_structs::SPLIT_BYTES_PER_UFRAME as usize - 1) / hw_structs::SPLIT_BYTES_PER_UFRAME as usize).max(1) as u32;
                (if count == 1 { hw_structs::SITD_BP1_TP_ALL } else { hw_structs::SITD_BP1_TP_BEGIN }) | count
            };
        d.pages[1].set( (bp1 as u32 & !0xFFF) | bp1_lo );
        d.pages_hi[1].set( (bp1 >> 32) as u32 );
        d.back.set(f.back);
        hw_structs::publish_barrier();
        d.state.set( if f.ioc { hw_structs::SITD_STATE_IOC } else { 0 }
            | (f.buffer.len as u32) << hw_structs::SITD_STATE_LEN_SHIFT
            | hw_structs::SITD_STS_ACTIVE
            );
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::MockPlatform;

    #[test]
    fn itd_transaction_words()
    {
        let platform = MockPlatform::new();
        let mut pool = ItdPool::new(1);
        let id = pool.alloc(&platform).unwrap();
        pool.fill(id, &ItdFill {
            dev_addr: 5, endpt: 2, dir_in: true, max_packet_size: 1024, mult: 1,
            buffer: DmaBuffer::new(0x2000_0C00, 0x800),
            transactions: &[(0, 0, 0x400), (4, 0x400, 0x400)],
            ioc: true,
            });
        let d = pool.get(id);
        assert_eq!(d.pages[0].get(), 0x2000_0000 | 5 | 2 << 8);
        assert_eq!(d.pages[1].get(), 0x2000_1000 | 1024 | hw_structs::ITD_PAGE1_DIR_IN);
        assert_eq!(d.pages[2].get(), 1);
        let t0 = d.transactions[0].get();
        assert_eq!(t0, hw_structs::ITD_TRANS_ACTIVE | 0x400 << 16 | 0xC00);
        let t4 = d.transactions[4].get();
        assert_eq!(t4, hw_structs::ITD_TRANS_ACTIVE | 0x400 << 16 | 1 << 12 | 0x000 | hw_structs::ITD_TRANS_IOC);
        assert_eq!(d.transactions[1].get(), 0);
        pool.release(id);
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn sitd_out_positions()
    {
        let platform = MockPlatform::new();
        let mut pool = SitdPool::new(1);
        let id = pool.alloc(&platform).unwrap();
        pool.fill(id, &SitdFill {
            dev_addr: 3, endpt: 1, dir_in: false, hub_addr: 2, hub_port: 4,
            smask: 0b0000_0111, cmask: 0,
            buffer: DmaBuffer::new(0x3000_0100, 400),
            ioc: false,
            back: hw_structs::LINK_TERMINATE,
            });
        let d = pool.get(id);
        assert_eq!(d.endpoint.get(), 4 << 24 | 2 << 16 | 1 << 8 | 3);
        // 400 bytes = three start-splits
        assert_eq!(d.pages[1].get(), 0x3000_1000 | hw_structs::SITD_BP1_TP_BEGIN | 3);
        assert_eq!(d.state.get(), 400 << 16 | hw_structs::SITD_STS_ACTIVE);
        pool.release(id);
        unsafe { pool.destroy(&platform); }
    }
}
