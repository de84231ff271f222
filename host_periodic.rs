//! Periodic schedule: frame list, list links, and bandwidth accounting
//!
//! Each of the 1024 frame slots heads a list: isochronous descriptors first (iTDs, then siTDs
//! ordered by their transaction translator start microframe), followed by the interrupt queue
//! head tree. The software mirror (`PeriodicLink`) is authoritative, the hardware link words are
//! always written from it.
use ::alloc::vec::Vec;
use crate::error::Error;
use crate::hw_structs::{self,HwWord};
use crate::desc_pools::{Pools,DescPool,Descriptor,QhId,ItdId,SitdId,IsochNode};
use crate::platform::{Platform,DmaRegion};
use crate::PERIODIC_SIZE;

/// Number of frame slots bandwidth is tracked over (the schedule repeats every 32 frames)
pub const BW_SLOTS: usize = 32;
/// High-speed periodic budget per microframe (80% of 7500 bytes)
pub const HS_UFRAME_BUDGET: u32 = 6000;
/// Full-speed periodic budget per frame, per transaction translator (90% of 1500 bytes)
pub const FS_FRAME_BUDGET: u32 = 1350;

/// A (software) periodic list link
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum PeriodicLink
{
    Terminate,
    Itd(ItdId),
    Sitd(SitdId),
    Qh(QhId),
}
impl Default for PeriodicLink {
    fn default() -> Self {
        PeriodicLink::Terminate
    }
}
impl PeriodicLink {
    pub fn as_isoch(&self) -> Option<IsochNode> {
        match *self
        {
        PeriodicLink::Itd(i) => Some(IsochNode::Itd(i)),
        PeriodicLink::Sitd(i) => Some(IsochNode::Sitd(i)),
        _ => None,
        }
    }
}

/// Descriptor types that can appear in the periodic list
pub trait PeriodicEntry: Descriptor
{
    const LINK_TYPE: u32;
    fn link_word(&self) -> &HwWord;
}
impl PeriodicEntry for hw_structs::QueueHead {
    const LINK_TYPE: u32 = hw_structs::LINK_TY_QH;
    fn link_word(&self) -> &HwWord { &self.hlink }
}
impl PeriodicEntry for hw_structs::IsochDesc {
    const LINK_TYPE: u32 = hw_structs::LINK_TY_ITD;
    fn link_word(&self) -> &HwWord { &self.next }
}
impl PeriodicEntry for hw_structs::SplitIsochDesc {
    const LINK_TYPE: u32 = hw_structs::LINK_TY_SITD;
    fn link_word(&self) -> &HwWord { &self.next }
}

fn entry_link<D: PeriodicEntry>(pool: &DescPool<D>, id: crate::desc_pools::DescId<D>) -> u32 {
    pool.phys(id) | D::LINK_TYPE
}
fn write_entry_link<D: PeriodicEntry>(pool: &DescPool<D>, id: crate::desc_pools::DescId<D>, v: u32) {
    pool.get(id).link_word().set(v)
}

/// Periodic list link operations
impl Pools
{
    /// Hardware encoding of a link
    pub fn link_value(&self, l: PeriodicLink) -> u32 {
        match l
        {
        PeriodicLink::Terminate => hw_structs::LINK_TERMINATE,
        PeriodicLink::Itd(i) => entry_link(&self.itd, i),
        PeriodicLink::Sitd(i) => entry_link(&self.sitd, i),
        PeriodicLink::Qh(i) => entry_link(&self.qh, i),
        }
    }
    pub fn periodic_next(&self, l: PeriodicLink) -> PeriodicLink {
        match l
        {
        PeriodicLink::Terminate => PeriodicLink::Terminate,
        PeriodicLink::Itd(i) => self.itd.meta(i).next,
        PeriodicLink::Sitd(i) => self.sitd.meta(i).next,
        PeriodicLink::Qh(i) => self.qh.meta(i).periodic_next,
        }
    }
    /// Update both the software and hardware next pointers of an entry
    pub fn set_periodic_next(&mut self, l: PeriodicLink, next: PeriodicLink) {
        let v = self.link_value(next);
        match l
        {
        PeriodicLink::Terminate => panic!("set_periodic_next on a terminator"),
        PeriodicLink::Itd(i) => { self.itd.meta_mut(i).next = next; write_entry_link(&self.itd, i, v); },
        PeriodicLink::Sitd(i) => { self.sitd.meta_mut(i).next = next; write_entry_link(&self.sitd, i, v); },
        PeriodicLink::Qh(i) => { self.qh.meta_mut(i).periodic_next = next; write_entry_link(&self.qh, i, v); },
        }
    }
    /// Interrupt polling period of an entry (isochronous entries sort before all queue heads)
    pub fn periodic_period(&self, l: PeriodicLink) -> u32 {
        match l
        {
        PeriodicLink::Qh(i) => self.qh.meta(i).period,
        _ => u32::MAX,
        }
    }
}

/// The frame list
pub struct PeriodicTable
{
    region: Option<DmaRegion>,
    slots: Vec<PeriodicLink>,
    pub bandwidth: Bandwidth,
}
impl PeriodicTable
{
    pub fn new(platform: &dyn Platform) -> Result<Self, Error> {
        let region = platform.alloc_dma(1).ok_or(Error::NoMemory)?;
        if region.phys >= 1 << 32 {
            log_error!("Periodic list allocated above 4GiB ({:#x})", region.phys);
            // SAFE: Not yet visible to the controller
            unsafe { platform.free_dma(region); }
            return Err(Error::NoMemory);
        }
        let rv = PeriodicTable {
            region: Some(region),
            slots: ::alloc::vec![PeriodicLink::Terminate; PERIODIC_SIZE],
            bandwidth: Bandwidth::default(),
            };
        for i in 0 .. PERIODIC_SIZE {
            rv.hw(i).set(hw_structs::LINK_TERMINATE);
        }
        Ok(rv)
    }
    pub fn phys(&self) -> u32 {
        self.region.as_ref().map(|r| r.phys as u32).unwrap_or(0)
    }
    fn hw(&self, slot: usize) -> &HwWord {
        let r = match self.region
            {
            Some(ref r) => r,
            None => panic!("BUG: Periodic table used after destroy"),
            };
        assert!(slot < PERIODIC_SIZE);
        // SAFE: The region is one page (1024 words), and HwWord is a transparent u32
        unsafe { &*(r.virt.as_ptr() as *const HwWord).add(slot) }
    }
    /// Hardware value of a slot (for checks)
    pub fn hw_slot(&self, slot: usize) -> u32 {
        self.hw(slot).get()
    }
    pub fn head(&self, slot: usize) -> PeriodicLink {
        self.slots[slot]
    }

    /// Set the entry after `prev` (or the slot head if `None`)
    pub fn set_after(&mut self, pools: &mut Pools, slot: usize, prev: Option<PeriodicLink>, next: PeriodicLink) {
        match prev
        {
        None => {
            self.slots[slot] = next;
            self.hw(slot).set(pools.link_value(next));
            },
        Some(p) => pools.set_periodic_next(p, next),
        }
    }

    /// Locate `target` in a slot's list, returning its predecessor (`Some(None)` for the slot head)
    pub fn find_prev(&self, pools: &Pools, slot: usize, target: PeriodicLink) -> Option<Option<PeriodicLink>> {
        let mut prev = None;
        let mut cur = self.slots[slot];
        while cur != PeriodicLink::Terminate {
            if cur == target {
                return Some(prev);
            }
            prev = Some(cur);
            cur = pools.periodic_next(cur);
        }
        None
    }

    /// Remove an entry from one slot's list, leaving the entry's own next pointer intact
    /// (the controller may currently be looking at it)
    pub fn unlink(&mut self, pools: &mut Pools, slot: usize, target: PeriodicLink) -> bool {
        match self.find_prev(pools, slot, target)
        {
        Some(prev) => {
            let next = pools.periodic_next(target);
            self.set_after(pools, slot, prev, next);
            true
            },
        None => false,
        }
    }

    /// Link an isochronous descriptor into a slot
    ///
    /// iTDs go after existing iTDs, siTDs go after all iTDs and any siTD whose
    /// translator start microframe is not later than this one's.
    pub fn insert_isoch(&mut self, pools: &mut Pools, slot: usize, node: IsochNode) {
        let my_start = pools.isoch_meta(node).uframes[0];
        let mut prev = None;
        let mut cur = self.slots[slot];
        loop
        {
            let advance = match (node, cur)
                {
                (_, PeriodicLink::Itd(_)) => true,
                (IsochNode::Sitd(_), PeriodicLink::Sitd(s)) => pools.sitd.meta(s).uframes[0] <= my_start,
                _ => false,
                };
            if !advance {
                break;
            }
            prev = Some(cur);
            cur = pools.periodic_next(cur);
        }
        // The new entry must point onwards before it becomes visible
        pools.set_periodic_next(node.into(), cur);
        hw_structs::publish_barrier();
        self.set_after(pools, slot, prev, node.into());
        pools.isoch_meta_mut(node).linked = true;
    }

    /// Iterate the entries of a slot
    pub fn iter_slot<'a>(&'a self, pools: &'a Pools, slot: usize) -> impl Iterator<Item=PeriodicLink> + 'a {
        let mut cur = self.slots[slot];
        ::core::iter::from_fn(move || {
            if cur == PeriodicLink::Terminate {
                None
            }
            else {
                let rv = cur;
                cur = pools.periodic_next(cur);
                Some(rv)
            }
        })
    }

    /// UNSAFE: The controller must not be using the frame list
    pub unsafe fn destroy(&mut self, platform: &dyn Platform) {
        if let Some(r) = self.region.take() {
            platform.free_dma(r);
        }
    }
}

/// Convert a raw polling interval to a whole number of frames (power of two, at most the table size)
///
/// High-speed intervals are in microframes, full/low-speed in frames.
pub fn normalized_period(interval: u32, high_speed: bool) -> u32
{
    let frames = if high_speed { interval / 8 } else { interval };
    let frames = frames.clamp(1, PERIODIC_SIZE as u32);
    1 << (31 - frames.leading_zeros())
}

/// Microframe mask for a high-speed endpoint starting at `uframe`
pub fn hs_smask(interval_uframes: u32, uframe: u8) -> u8
{
    if interval_uframes >= 8 {
        return 1 << uframe;
    }
    let interval = 1 << (31 - interval_uframes.max(1).leading_zeros());
    (uframe as u32 .. 8).step_by(interval).fold(0u8, |m,uf| m | 1 << uf)
}

/// Bandwidth held by one endpoint
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct Reservation
{
    /// Microframe bitmask in each tracked frame slot
    hs_mask: [u8; BW_SLOTS],
    hs_bytes: u16,
    /// (hub address, frame slot mask, bytes)
    tt: Option<(u8, u32, u16)>,
}

/// Placement chosen for a high-speed reservation
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct HsPhase
{
    /// Frame offset within the period
    pub frame: u32,
    /// First microframe used
    pub uframe: u8,
}
/// Placement chosen for a transaction translator reservation
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct TtPhase
{
    pub frame: u32,
    /// Bytes already scheduled on the full-speed bus ahead of this endpoint
    pub offset: u32,
}

#[derive(Default)]
pub struct Bandwidth
{
    hs: [[u16; 8]; BW_SLOTS],
    tt: Vec<(u8, [u16; BW_SLOTS])>,
}
impl Bandwidth
{
    fn hs_worst(&self, mask: &[u8; BW_SLOTS]) -> u32 {
        let mut worst = 0;
        for (slot,&m) in mask.iter().enumerate() {
            for uf in 0 .. 8 {
                if m & (1 << uf) != 0 {
                    worst = worst.max(self.hs[slot][uf] as u32);
                }
            }
        }
        worst
    }
    fn apply_hs(&mut self, mask: &[u8; BW_SLOTS], bytes: u16, add: bool) {
        for (slot,&m) in mask.iter().enumerate() {
            for uf in 0 .. 8 {
                if m & (1 << uf) != 0 {
                    let v = &mut self.hs[slot][uf];
                    *v = if add { *v + bytes } else { v.saturating_sub(bytes) };
                }
            }
        }
    }
    fn tt_entry(&mut self, hub: u8) -> &mut [u16; BW_SLOTS] {
        let i = match self.tt.iter().position(|e| e.0 == hub)
            {
            Some(i) => i,
            None => {
                self.tt.push( (hub, [0; BW_SLOTS]) );
                self.tt.len() - 1
                },
            };
        &mut self.tt[i].1
    }
    pub fn tt_load(&self, hub: u8, slot: usize) -> u32 {
        self.tt.iter().find(|e| e.0 == hub).map(|e| e.1[slot % BW_SLOTS] as u32).unwrap_or(0)
    }

    /// Reserve high-speed bandwidth
    ///
    /// `all_slots` reserves the microframes in every tracked frame (for streams that can start on any frame).
    pub fn reserve_hs(&mut self, interval_uframes: u32, bytes: u32, all_slots: bool) -> Result<(Reservation, HsPhase), Error> {
        if interval_uframes == 0 {
            return Err(Error::InvalidArgument("polling interval"));
        }
        let mut best: Option<([u8; BW_SLOTS], HsPhase, u32)> = None;
        let mut consider = |mask: [u8; BW_SLOTS], phase: HsPhase, worst: u32| {
            if best.as_ref().map(|b| worst < b.2).unwrap_or(true) {
                best = Some((mask, phase, worst));
            }
        };
        if interval_uframes < 8 {
            let interval = 1 << (31 - interval_uframes.leading_zeros());
            for p in 0 .. interval {
                let mut bits = 0u8;
                let mut uf = p;
                while uf < 8 {
                    bits |= 1 << uf;
                    uf += interval;
                }
                let mask = [bits; BW_SLOTS];
                consider(mask, HsPhase { frame: 0, uframe: p as u8 }, self.hs_worst(&mask));
            }
        }
        else {
            let period = normalized_period(interval_uframes, true).min(BW_SLOTS as u32);
            let phases = if all_slots { 1 } else { period };
            for f in 0 .. phases {
                for uf in 0 .. 8 {
                    let mut mask = [0u8; BW_SLOTS];
                    for (s,m) in mask.iter_mut().enumerate() {
                        if all_slots || s as u32 % period == f {
                            *m = 1 << uf;
                        }
                    }
                    consider(mask, HsPhase { frame: f, uframe: uf }, self.hs_worst(&mask));
                }
            }
        }
        let (mask, phase, worst) = best.ok_or(Error::NoBandwidth)?;
        if worst + bytes > HS_UFRAME_BUDGET {
            log_debug!("reserve_hs: {} bytes every {} uframes doesn't fit (worst {})", bytes, interval_uframes, worst);
            return Err(Error::NoBandwidth);
        }
        self.apply_hs(&mask, bytes as u16, true);
        Ok( (Reservation { hs_mask: mask, hs_bytes: bytes as u16, tt: None }, phase) )
    }

    /// Reserve full-speed bandwidth behind a hub's transaction translator
    pub fn reserve_tt(&mut self, hub: u8, period_frames: u32, bytes: u32, all_slots: bool) -> Result<(Reservation, TtPhase), Error> {
        let period = period_frames.clamp(1, BW_SLOTS as u32);
        let phases = if all_slots { 1 } else { period };
        let loads = *self.tt_entry(hub);
        let mut best: Option<(u32, u32, u32)> = None;
        for f in 0 .. phases {
            let mask = (0 .. BW_SLOTS as u32).filter(|s| all_slots || s % period == f).fold(0u32, |m,s| m | 1 << s);
            let worst = (0 .. BW_SLOTS).filter(|s| mask & 1 << s != 0).map(|s| loads[s] as u32).max().unwrap_or(0);
            if best.map(|b| worst < b.2).unwrap_or(true) {
                best = Some((f, mask, worst));
            }
        }
        let (frame, mask, worst) = best.ok_or(Error::NoBandwidth)?;
        if worst + bytes > FS_FRAME_BUDGET {
            log_debug!("reserve_tt: hub {} {} bytes doesn't fit (worst {})", hub, bytes, worst);
            return Err(Error::NoBandwidth);
        }
        let e = self.tt_entry(hub);
        for s in 0 .. BW_SLOTS {
            if mask & 1 << s != 0 {
                e[s] += bytes as u16;
            }
        }
        Ok( (Reservation { hs_mask: [0; BW_SLOTS], hs_bytes: 0, tt: Some((hub, mask, bytes as u16)) }, TtPhase { frame, offset: worst }) )
    }

    pub fn release(&mut self, r: &Reservation) {
        self.apply_hs(&r.hs_mask, r.hs_bytes, false);
        if let Some((hub, mask, bytes)) = r.tt {
            let e = self.tt_entry(hub);
            for s in 0 .. BW_SLOTS {
                if mask & 1 << s != 0 {
                    e[s] = e[s].saturating_sub(bytes);
                }
            }
        }
    }

    /// Bytes left in the most loaded high-speed microframe
    pub fn available_hs(&self) -> u32 {
        let worst = self.hs.iter().flat_map(|f| f.iter()).map(|&v| v as u32).max().unwrap_or(0);
        HS_UFRAME_BUDGET.saturating_sub(worst)
    }
}
