//! Host OS services used by the driver (DMA memory, time, PCI configuration space)
use ::core::ptr::NonNull;

pub const PAGE_SIZE: usize = 0x1000;

/// A physically contiguous, page aligned, uncached allocation
#[derive(Debug)]
pub struct DmaRegion
{
    pub virt: NonNull<u8>,
    pub phys: u64,
    pub pages: usize,
}
// SAFE: The region is plain memory, ownership of the handle is ownership of the memory
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}
impl DmaRegion
{
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

/// A client data buffer, as seen by the controller
///
/// The owner must keep the memory valid (and physically contiguous) until the transfer's completion is delivered.
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct DmaBuffer
{
    pub phys: u64,
    pub len: usize,
}
impl DmaBuffer
{
    pub const EMPTY: DmaBuffer = DmaBuffer { phys: 0, len: 0 };

    pub fn new(phys: u64, len: usize) -> Self {
        DmaBuffer { phys, len }
    }
    /// Sub-range of this buffer
    pub fn slice(&self, ofs: usize, len: usize) -> DmaBuffer {
        assert!(ofs + len <= self.len, "DmaBuffer::slice({}+{}) out of range ({})", ofs, len, self.len);
        DmaBuffer { phys: self.phys + ofs as u64, len }
    }
}

/// Services provided by the host OS
pub trait Platform: Send + Sync
{
    /// Allocate `pages` contiguous pages of DMA-able memory
    ///
    /// Control structures must be below 4GiB (the driver programs `CTRLDSSEGMENT` to zero).
    fn alloc_dma(&self, pages: usize) -> Option<DmaRegion>;
    /// Release memory from [Platform::alloc_dma]
    ///
    /// UNSAFE: The controller must no longer be able to access the region
    unsafe fn free_dma(&self, region: DmaRegion);
    /// Monotonic time in microseconds
    fn monotonic_us(&self) -> u64;
    /// Busy-wait for the specified number of microseconds
    fn delay_us(&self, us: u32);

    /// Read from the controller's PCI configuration space (for the BIOS ownership handoff)
    fn read_pci_config(&self, _offset: u8) -> Option<u32> {
        None
    }
    fn write_pci_config(&self, _offset: u8, _value: u32) {
    }
}
impl<T: Platform + ?Sized> Platform for ::alloc::sync::Arc<T>
{
    fn alloc_dma(&self, pages: usize) -> Option<DmaRegion> { (**self).alloc_dma(pages) }
    unsafe fn free_dma(&self, region: DmaRegion) { (**self).free_dma(region) }
    fn monotonic_us(&self) -> u64 { (**self).monotonic_us() }
    fn delay_us(&self, us: u32) { (**self).delay_us(us) }
    fn read_pci_config(&self, offset: u8) -> Option<u32> { (**self).read_pci_config(offset) }
    fn write_pci_config(&self, offset: u8, value: u32) { (**self).write_pci_config(offset, value) }
}

/// Returned by [wait_for] when the condition never became true
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct TimedOut;

/// Poll `cond` every `interval_us`, giving up after `max_polls` attempts
///
/// The condition is checked once before the first delay, so an already-true condition never sleeps.
pub fn wait_for(platform: &dyn Platform, interval_us: u32, max_polls: u32, mut cond: impl FnMut() -> bool) -> Result<(), TimedOut>
{
    if cond() {
        return Ok( () );
    }
    for _ in 0 .. max_polls {
        platform.delay_us(interval_us);
        if cond() {
            return Ok( () );
        }
    }
    Err(TimedOut)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn dma_buffer_slice()
    {
        let b = DmaBuffer::new(0x1000_0F00, 0x300);
        assert_eq!(b.slice(0x100, 0x80), DmaBuffer::new(0x1000_1000, 0x80));
    }
}
