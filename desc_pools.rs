//! Descriptor pools
//!
//! Each descriptor type has its own pool. A pool is a list of DMA memory blocks (whole pages),
//! each carved into fixed-size slots, plus a free list of slot indexes. Descriptors never move
//! once allocated, and the physical address of a slot is derived from its index.
use ::alloc::vec::Vec;
use ::alloc::collections::VecDeque;
use ::core::marker::PhantomData;
use crate::error::Error;
use crate::hw_structs;
use crate::platform::{Platform,DmaRegion,PAGE_SIZE};

mod qh_pool;
mod td_pool;
mod isoch_pool;
pub use self::qh_pool::{QhMeta,QhProgress};
pub use self::td_pool::{TdMeta,TdFill};
pub use self::isoch_pool::{IsochMeta,IsochNode,ItdFill,SitdFill};

pub type QhPool = DescPool<hw_structs::QueueHead>;
pub type TdPool = DescPool<hw_structs::TransferDesc>;
pub type ItdPool = DescPool<hw_structs::IsochDesc>;
pub type SitdPool = DescPool<hw_structs::SplitIsochDesc>;
pub type QhId = DescId<hw_structs::QueueHead>;
pub type TdId = DescId<hw_structs::TransferDesc>;
pub type ItdId = DescId<hw_structs::IsochDesc>;
pub type SitdId = DescId<hw_structs::SplitIsochDesc>;

/// A hardware descriptor that can live in a [DescPool]
pub trait Descriptor: 'static
{
    /// Software-only state kept alongside each slot
    type Meta: Default;
    const NAME: &'static str;
    /// Put the hardware fields into an inert state
    fn reset(&self);
}
impl Descriptor for hw_structs::QueueHead {
    type Meta = QhMeta;
    const NAME: &'static str = "QH";
    fn reset(&self) { hw_structs::QueueHead::reset(self) }
}
impl Descriptor for hw_structs::TransferDesc {
    type Meta = TdMeta;
    const NAME: &'static str = "qTD";
    fn reset(&self) { hw_structs::TransferDesc::reset(self) }
}
impl Descriptor for hw_structs::IsochDesc {
    type Meta = IsochMeta;
    const NAME: &'static str = "iTD";
    fn reset(&self) { hw_structs::IsochDesc::reset(self) }
}
impl Descriptor for hw_structs::SplitIsochDesc {
    type Meta = IsochMeta;
    const NAME: &'static str = "siTD";
    fn reset(&self) { hw_structs::SplitIsochDesc::reset(self) }
}

/// Index of a descriptor within its pool
///
/// Typed by the descriptor, so an index from one pool can't be handed to another.
pub struct DescId<D>(u32, PhantomData<fn()->D>);
impl<D> DescId<D> {
    fn new(idx: usize) -> Self {
        DescId(idx as u32, PhantomData)
    }
    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}
impl<D> Clone for DescId<D> {
    fn clone(&self) -> Self { *self }
}
impl<D> Copy for DescId<D> {}
impl<D> PartialEq for DescId<D> {
    fn eq(&self, other: &Self) -> bool { self.0 == other.0 }
}
impl<D> Eq for DescId<D> {}
impl<D: Descriptor> ::core::fmt::Debug for DescId<D> {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{}#{}", D::NAME, self.0)
    }
}

/// One physically-contiguous allocation, subdivided into slots
struct MemoryBlock
{
    region: DmaRegion,
}

struct Slot<M>
{
    in_use: bool,
    meta: M,
}

pub struct DescPool<D: Descriptor>
{
    pages_per_block: usize,
    blocks: Vec<MemoryBlock>,
    slots: Vec<Slot<D::Meta>>,
    free: VecDeque<u32>,
    in_use: usize,
    pd: PhantomData<D>,
}
// SAFE: The pool owns the memory, and all hardware fields are accessed with volatile operations
unsafe impl<D: Descriptor> Send for DescPool<D> where D::Meta: Send {}
impl<D: Descriptor> DescPool<D>
{
    const SLOT_SIZE: usize = ::core::mem::size_of::<D>();

    pub fn new(pages_per_block: usize) -> Self {
        DescPool {
            pages_per_block: pages_per_block.max(1),
            blocks: Vec::new(),
            slots: Vec::new(),
            free: VecDeque::new(),
            in_use: 0,
            pd: PhantomData,
        }
    }

    /// Number of descriptors in each memory block
    pub fn per_block(&self) -> usize {
        self.pages_per_block * PAGE_SIZE / Self::SLOT_SIZE
    }
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
    pub fn in_use(&self) -> usize {
        self.in_use
    }
    pub fn is_allocated(&self, id: DescId<D>) -> bool {
        self.slots.get(id.idx()).map(|s| s.in_use).unwrap_or(false)
    }

    /// Allocate a descriptor, growing the pool by one block if the free list is empty
    ///
    /// The hardware fields are reset, and the metadata is default.
    pub fn alloc(&mut self, platform: &dyn Platform) -> Result<DescId<D>, Error> {
        if self.free.is_empty() {
            self.grow(platform)?;
        }
        let idx = match self.free.pop_front()
            {
            Some(i) => i as usize,
            None => return Err(Error::NoMemory),
            };
        let slot = &mut self.slots[idx];
        assert!(!slot.in_use, "{} {} on the free list while in use", D::NAME, idx);
        slot.in_use = true;
        slot.meta = Default::default();
        self.in_use += 1;
        let rv = DescId::new(idx);
        self.get(rv).reset();
        Ok(rv)
    }

    /// Return a descriptor to the pool
    ///
    /// The physical address is left as-is, the metadata (logical links, client references) is cleared.
    /// The caller must ensure that the controller can no longer reach the descriptor.
    pub fn release(&mut self, id: DescId<D>) {
        let slot = &mut self.slots[id.idx()];
        if !slot.in_use {
            panic!("Releasing an unused {:?}", id);
        }
        slot.in_use = false;
        slot.meta = Default::default();
        self.in_use -= 1;
        if self.in_use == 0 {
            // Fully idle: restore creation order
            self.free.clear();
            self.free.extend(0 .. self.slots.len() as u32);
        }
        else {
            self.free.push_back(id.0);
        }
    }

    fn grow(&mut self, platform: &dyn Platform) -> Result<(), Error> {
        let region = match platform.alloc_dma(self.pages_per_block)
            {
            Some(r) => r,
            None => {
                log_warning!("{} pool: unable to allocate a {} page block", D::NAME, self.pages_per_block);
                return Err(Error::NoMemory);
                },
            };
        if region.phys + region.len() as u64 > (1 << 32) {
            log_error!("{} pool: block at {:#x} is above 4GiB", D::NAME, region.phys);
            // SAFE: Never shared with the controller
            unsafe { platform.free_dma(region); }
            return Err(Error::NoMemory);
        }
        let base = self.slots.len();
        let count = self.per_block();
        log_debug!("{} pool: new block {} @ {:#x}, slots {}..{}", D::NAME, self.blocks.len(), region.phys, base, base + count);
        self.blocks.push(MemoryBlock { region });
        for i in 0 .. count {
            self.slots.push(Slot { in_use: false, meta: Default::default() });
            self.free.push_back( (base + i) as u32 );
        }
        Ok( () )
    }

    fn block_and_offset(&self, id: DescId<D>) -> (&MemoryBlock, usize) {
        let per_block = self.per_block();
        (&self.blocks[id.idx() / per_block], (id.idx() % per_block) * Self::SLOT_SIZE)
    }

    /// Hardware view of the descriptor
    pub fn get(&self, id: DescId<D>) -> &D {
        debug_assert!(self.slots[id.idx()].in_use, "Accessing a free {:?}", id);
        let (block, ofs) = self.block_and_offset(id);
        // SAFE: In-bounds and aligned (slots are a multiple of the alignment from a page-aligned base),
        //       and all fields are interior-mutable hardware words.
        unsafe { &*(block.region.virt.as_ptr().add(ofs) as *const D) }
    }
    /// Physical address (for link pointers)
    pub fn phys(&self, id: DescId<D>) -> u32 {
        let (block, ofs) = self.block_and_offset(id);
        (block.region.phys + ofs as u64) as u32
    }
    /// Find the descriptor at a physical address
    pub fn from_phys(&self, addr: u32) -> Option<DescId<D>> {
        let addr = addr as u64;
        let per_block = self.per_block();
        for (i,b) in self.blocks.iter().enumerate() {
            if b.region.phys <= addr && addr < b.region.phys + b.region.len() as u64 {
                let ofs = (addr - b.region.phys) as usize;
                if ofs % Self::SLOT_SIZE != 0 {
                    return None;
                }
                let slot = ofs / Self::SLOT_SIZE;
                if slot >= per_block {
                    return None;
                }
                return Some(DescId::new(i * per_block + slot));
            }
        }
        None
    }

    pub fn meta(&self, id: DescId<D>) -> &D::Meta {
        &self.slots[id.idx()].meta
    }
    pub fn meta_mut(&mut self, id: DescId<D>) -> &mut D::Meta {
        &mut self.slots[id.idx()].meta
    }

    /// Release all memory blocks
    ///
    /// UNSAFE: The controller must be halted (or otherwise not referencing any descriptor)
    pub unsafe fn destroy(&mut self, platform: &dyn Platform) {
        if self.in_use != 0 {
            log_warning!("{} pool: destroying with {} descriptors still allocated", D::NAME, self.in_use);
        }
        for b in self.blocks.drain(..) {
            platform.free_dma(b.region);
        }
        self.slots.clear();
        self.free.clear();
        self.in_use = 0;
    }
}
impl<D: Descriptor> Drop for DescPool<D>
{
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            log_error!("BUG: {} pool dropped with {} blocks, should be destroyed first", D::NAME, self.blocks.len());
        }
    }
}

/// One pool per descriptor type
pub struct Pools
{
    pub qh: QhPool,
    pub td: TdPool,
    pub itd: ItdPool,
    pub sitd: SitdPool,
}
impl Pools
{
    pub fn new(pages_per_block: usize) -> Self {
        Pools {
            qh: QhPool::new(pages_per_block),
            td: TdPool::new(pages_per_block),
            itd: ItdPool::new(pages_per_block),
            sitd: SitdPool::new(pages_per_block),
        }
    }

    pub fn isoch_meta(&self, n: IsochNode) -> &IsochMeta {
        match n
        {
        IsochNode::Itd(i) => self.itd.meta(i),
        IsochNode::Sitd(i) => self.sitd.meta(i),
        }
    }
    pub fn isoch_meta_mut(&mut self, n: IsochNode) -> &mut IsochMeta {
        match n
        {
        IsochNode::Itd(i) => self.itd.meta_mut(i),
        IsochNode::Sitd(i) => self.sitd.meta_mut(i),
        }
    }
    pub fn release_node(&mut self, n: IsochNode) {
        match n
        {
        IsochNode::Itd(i) => self.itd.release(i),
        IsochNode::Sitd(i) => self.sitd.release(i),
        }
    }

    /// UNSAFE: The controller must be halted
    pub unsafe fn destroy(&mut self, platform: &dyn Platform) {
        self.qh.destroy(platform);
        self.td.destroy(platform);
        self.itd.destroy(platform);
        self.sitd.destroy(platform);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::MockPlatform;

    #[test]
    fn grows_by_whole_blocks()
    {
        let platform = MockPlatform::new();
        let mut pool = TdPool::new(1);
        assert_eq!(pool.per_block(), 64);
        let n = 150;
        let ids: Vec<_> = (0 .. n).map(|_| pool.alloc(&platform).expect("alloc")).collect();
        assert_eq!(pool.block_count(), (n + pool.per_block() - 1) / pool.per_block());
        assert_eq!(pool.in_use(), n);
        for id in ids {
            pool.release(id);
        }
        assert_eq!(pool.block_count(), 3);
        assert_eq!(pool.in_use(), 0);
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn idle_pool_restores_allocation_order()
    {
        let platform = MockPlatform::new();
        let mut pool = QhPool::new(1);
        let first: Vec<_> = (0 .. 10).map(|_| pool.alloc(&platform).unwrap()).collect();
        let first_phys: Vec<_> = first.iter().map(|&id| pool.phys(id)).collect();
        // Release out of order
        for &id in first.iter().rev() {
            pool.release(id);
        }
        let second: Vec<_> = (0 .. 10).map(|_| pool.alloc(&platform).unwrap()).collect();
        let second_phys: Vec<_> = second.iter().map(|&id| pool.phys(id)).collect();
        assert_eq!(first_phys, second_phys);
        for id in second {
            pool.release(id);
        }
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn released_goes_to_tail()
    {
        let platform = MockPlatform::new();
        let mut pool = SitdPool::new(1);
        let a = pool.alloc(&platform).unwrap();
        let b = pool.alloc(&platform).unwrap();
        pool.release(a);
        // `a` is at the back of the free list, so the next allocation is a fresh slot
        let c = pool.alloc(&platform).unwrap();
        assert!(c != a);
        assert!(c != b);
        pool.release(b);
        pool.release(c);
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn phys_round_trip()
    {
        let platform = MockPlatform::new();
        let mut pool = ItdPool::new(1);
        let ids: Vec<_> = (0 .. 50).map(|_| pool.alloc(&platform).unwrap()).collect();
        for &id in &ids {
            assert_eq!(pool.phys(id) % 32, 0);
            assert_eq!(pool.from_phys(pool.phys(id)), Some(id));
        }
        assert_eq!(pool.from_phys(pool.phys(ids[0]) + 4), None);
        assert_eq!(pool.from_phys(0x10), None);
        for id in ids {
            pool.release(id);
        }
        unsafe { pool.destroy(&platform); }
    }

    #[test]
    fn exhaustion_is_reported()
    {
        let platform = MockPlatform::new();
        platform.set_dma_limit(Some(0));
        let mut pool = QhPool::new(1);
        assert_eq!(pool.alloc(&platform), Err(Error::NoMemory));
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    #[should_panic]
    fn double_release_panics()
    {
        let platform = MockPlatform::new();
        let mut pool = TdPool::new(1);
        let a = pool.alloc(&platform).unwrap();
        let _b = pool.alloc(&platform).unwrap();
        pool.release(a);
        pool.release(a);
    }

    #[test]
    fn release_clears_meta()
    {
        let platform = MockPlatform::new();
        let mut pool = TdPool::new(1);
        let a = pool.alloc(&platform).unwrap();
        let b = pool.alloc(&platform).unwrap();
        pool.meta_mut(a).next = Some(b);
        pool.meta_mut(a).length = 10;
        pool.release(a);
        let _keep = b;
        // Allocate until `a` comes back around
        let mut others = Vec::new();
        loop {
            let n = pool.alloc(&platform).unwrap();
            if n == a {
                break;
            }
            others.push(n);
        }
        assert!(pool.meta(a).next.is_none());
        assert_eq!(pool.meta(a).length, 0);
    }
}
