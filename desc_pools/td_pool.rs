//! Transfer descriptor pool helpers
use crate::hw_structs::{self,Pid};
use crate::platform::{DmaBuffer,PAGE_SIZE};
use super::{TdPool,TdId,QhId};

/// Software state for a transfer descriptor
#[derive(Default)]
pub struct TdMeta
{
    /// Owning queue head
    pub qh: Option<QhId>,
    /// Next descriptor in the chain
    pub next: Option<TdId>,
    /// Client completion, only present on the final descriptor of a transfer
    pub completion: Option<crate::status::TransferCallback>,
    /// Number of bytes programmed into this descriptor
    pub length: u32,
    pub pid: Option<Pid>,
}

/// Description of one qTD's worth of a transfer
#[derive(Debug,Copy,Clone)]
pub struct TdFill
{
    pub pid: Pid,
    pub buffer: DmaBuffer,
    /// Explicit data toggle (control transfers), `None` to use the queue head's toggle
    pub toggle: Option<bool>,
    pub ioc: bool,
}
impl TdFill
{
    /// Token value that starts this descriptor
    pub fn active_token(&self) -> u32 {
        let mut token = hw_structs::QTD_TOKEN_STS_ACTIVE
            | (self.buffer.len as u32) << hw_structs::QTD_TOKEN_LEN_SHIFT
            | 3 << hw_structs::QTD_TOKEN_CERR_SHIFT
            | (self.pid as u32) << hw_structs::QTD_TOKEN_PID_SHIFT
            ;
        if self.ioc {
            token |= hw_structs::QTD_TOKEN_IOC;
        }
        if let Some(true) = self.toggle {
            token |= hw_structs::QTD_TOKEN_DATATGL;
        }
        token
    }
}

impl TdPool
{
    /// Write the links and buffer pointers of a descriptor, leaving it inactive
    ///
    /// Returns the token that should be written to start it.
    pub fn fill(&mut self, id: TdId, fill: &TdFill, next: u32, alt: u32) -> u32 {
        assert!(fill.buffer.len <= hw_structs::QTD_MAX_BYTES);
        {
            let d = self.get(id);
            d.token.set(0);
            d.link.set(next);
            d.link2.set(alt);
            let base_page = fill.buffer.phys & !(PAGE_SIZE as u64 - 1);
            for i in 0 .. 5 {
                let addr = if i == 0 { fill.buffer.phys } else { base_page + (i * PAGE_SIZE) as u64 };
                if i == 0 || (base_page + (i * PAGE_SIZE) as u64) < fill.buffer.phys + fill.buffer.len as u64 {
                    d.pages[i].set(addr as u32);
                    d.pages_hi[i].set((addr >> 32) as u32);
                }
                else {
                    d.pages[i].set(0);
                    d.pages_hi[i].set(0);
                }
            }
        }
        let m = self.meta_mut(id);
        m.length = fill.buffer.len as u32;
        m.pid = Some(fill.pid);
        fill.active_token()
    }

    /// Set the token, publishing the descriptor to the controller
    pub fn activate(&self, id: TdId, token: u32) {
        hw_structs::publish_barrier();
        self.get(id).token.set(token);
    }

    /// Bytes actually transferred by a completed descriptor
    pub fn transferred(&self, id: TdId) -> usize {
        let remaining = hw_structs::TransferDesc::token_len(self.get(id).token.get());
        (self.meta(id).length as usize).saturating_sub(remaining)
    }

    /// Iterate the descriptors from `first` to `last` (inclusive) along the logical chain
    pub fn chain(&self, first: TdId, last: TdId) -> TdChain<'_> {
        TdChain { pool: self, cur: Some(first), last }
    }
}

pub struct TdChain<'a>
{
    pool: &'a TdPool,
    cur: Option<TdId>,
    last: TdId,
}
impl Iterator for TdChain<'_>
{
    type Item = TdId;
    fn next(&mut self) -> Option<TdId> {
        let rv = self.cur?;
        self.cur = if rv == self.last { None } else { self.pool.meta(rv).next };
        Some(rv)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::MockPlatform;

    #[test]
    fn fill_page_pointers()
    {
        let platform = MockPlatform::new();
        let mut pool = TdPool::new(1);
        let td = pool.alloc(&platform).unwrap();
        let buffer = DmaBuffer::new(0x1_2345_6F00, 0x2200);
        let tok = pool.fill(td, &TdFill { pid: Pid::In, buffer, toggle: Some(true), ioc: true }, 0x1000, 1);
        let d = pool.get(td);
        assert_eq!(d.token.get(), 0, "Must be left inactive");
        assert_eq!(d.pages[0].get(), 0x2345_6F00);
        assert_eq!(d.pages[1].get(), 0x2345_7000);
        assert_eq!(d.pages[2].get(), 0x2345_8000);
        assert_eq!(d.pages[3].get(), 0x2345_9000);
        assert_eq!(d.pages[4].get(), 0);
        assert_eq!(d.pages_hi[0].get(), 1);
        assert_eq!(d.link.get(), 0x1000);
        assert_eq!(tok & hw_structs::QTD_TOKEN_STS_ACTIVE, hw_structs::QTD_TOKEN_STS_ACTIVE);
        assert_eq!(tok & hw_structs::QTD_TOKEN_IOC, hw_structs::QTD_TOKEN_IOC);
        assert_eq!(tok & hw_structs::QTD_TOKEN_DATATGL, hw_structs::QTD_TOKEN_DATATGL);
        assert_eq!(hw_structs::TransferDesc::token_len(tok), 0x2200);
        assert_eq!((tok >> 8) & 3, 1);

        // Hardware finishes with 0x200 bytes left over
        pool.activate(td, tok);
        pool.get(td).token.set( (tok & !hw_structs::QTD_TOKEN_STS_ACTIVE & !hw_structs::QTD_TOKEN_LEN_MASK) | 0x200 << 16 );
        assert_eq!(pool.transferred(td), 0x2000);
        pool.release(td);
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn chain_walk()
    {
        let platform = MockPlatform::new();
        let mut pool = TdPool::new(1);
        let ids: ::alloc::vec::Vec<_> = (0 .. 4).map(|_| pool.alloc(&platform).unwrap()).collect();
        for w in ids.windows(2) {
            pool.meta_mut(w[0]).next = Some(w[1]);
        }
        let walked: ::alloc::vec::Vec<_> = pool.chain(ids[0], ids[2]).collect();
        assert_eq!(walked, &ids[..3]);
        for id in ids {
            pool.release(id);
        }
        unsafe { pool.destroy(&platform); }
    }
}
