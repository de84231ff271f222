//! Interrupt filter stage
//!
//! Runs in interrupt context: it must not block, allocate, or call out to clients. Anything that
//! needs more than that is left for the action stage.
use ::alloc::vec::Vec;
use ::core::sync::atomic::{Ordering,AtomicU32};
use ::spinning_top::Spinlock;
use crate::desc_pools::{IsochNode,Pools};
use crate::hw_regs::{self,OpReg};
use crate::{Schedule,PERIODIC_SIZE};

/// Isochronous descriptors the filter stage has unlinked, waiting for the action stage
///
/// Threaded through the descriptors' own metadata, so pushing never allocates.
#[derive(Default)]
pub(crate) struct DoneStack
{
    head: Spinlock<Option<IsochNode>>,
    produced: AtomicU32,
    consumed: AtomicU32,
}
impl DoneStack
{
    pub fn push(&self, pools: &mut Pools, node: IsochNode) {
        let mut head = self.head.lock();
        pools.isoch_meta_mut(node).done_next = head.take();
        *head = Some(node);
        self.produced.fetch_add(1, Ordering::Release);
    }
    /// Take everything, oldest first
    pub fn drain(&self, pools: &mut Pools) -> Vec<IsochNode> {
        let mut cur = self.head.lock().take();
        let mut rv = Vec::new();
        while let Some(n) = cur {
            cur = pools.isoch_meta_mut(n).done_next.take();
            rv.push(n);
        }
        rv.reverse();
        self.consumed.fetch_add(rv.len() as u32, Ordering::Release);
        rv
    }
    /// Number pushed and not yet drained
    pub fn pending(&self) -> u32 {
        self.produced.load(Ordering::Acquire).wrapping_sub(self.consumed.load(Ordering::Acquire))
    }
}

/// Filter stage outcome
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct FilterResult
{
    /// The action stage needs to run
    pub run_action: bool,
}

impl super::HostInner
{
    /// Interrupt handler proper: acknowledge, note what happened, and pull finished isochronous descriptors
    pub fn handle_filter(&self) -> FilterResult
    {
        self.filter_active.store(true, Ordering::Release);
        let sts = self.regs.read_op(OpReg::UsbSts) & Self::INTERRUPTS;
        let mut run_action = false;
        if sts != 0 {
            if sts & hw_regs::USBINTR_FrameRollover != 0 {
                self.latch_rollover();
            }
            if sts & hw_regs::USBINTR_HostSystemError != 0 {
                self.fatal.store(true, Ordering::SeqCst);
                run_action = true;
            }
            // Port change, determine what port(s) and leave it for the hub polling
            if sts & hw_regs::USBINTR_PortChange != 0 {
                for i in 0 .. self.nports() {
                    if self.regs.read_port_sc(i) & hw_regs::PORTSC_CHANGE_MASK != 0 {
                        self.port_update.fetch_or(1 << i, Ordering::SeqCst);
                    }
                }
                run_action = true;
            }
            if sts & (hw_regs::USBINTR_IOC|hw_regs::USBINTR_Error) != 0 {
                match self.schedule.try_lock()
                {
                Some(mut lh) => {
                    let current = self.frame_number_64();
                    self.scan_periodic(&mut lh, current);
                    },
                // Lock holder is on this CPU (or busy): let the action stage do the scan
                None => self.scan_pending.store(true, Ordering::Release),
                }
                run_action = true;
            }
            // SAFE: Writing to this register does nothing but ACK the interrupt
            unsafe { self.regs.write_op(OpReg::UsbSts, sts); }
        }
        self.filter_active.store(false, Ordering::Release);
        FilterResult { run_action }
    }

    /// Unlink isochronous descriptors whose frames (including any wrapped complete-splits) have passed
    pub(crate) fn scan_periodic(&self, s: &mut Schedule, current: u64)
    {
        let start = s.last_scanned_frame.max(current.saturating_sub(PERIODIC_SIZE as u64));
        if start >= current {
            return ;
        }
        let now = self.platform.monotonic_us();
        for frame in start .. current {
            let slot = (frame % PERIODIC_SIZE as u64) as usize;
            let mut cur = s.periodic.head(slot);
            while let Some(node) = cur.as_isoch() {
                let next = s.pools.periodic_next(cur);
                let (linked_frame, span) = {
                    let m = s.pools.isoch_meta(node);
                    (m.frame, m.span)
                    };
                if linked_frame + (span as u64) < current {
                    s.periodic.unlink(&mut s.pools, slot, cur);
                    s.pools.isoch_meta_mut(node).retired_us = now;
                    self.done.push(&mut s.pools, node);
                }
                cur = next;
            }
        }
        s.last_scanned_frame = current.saturating_sub(1);
    }

    /// Record root hub port changes (bitmask)
    pub(crate) fn note_port_changes(&self, bits: u32) {
        self.port_update.fetch_or(bits, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::*;
    use crate::platform::DmaBuffer;
    use crate::usb_host::{EndpointSpec,EndpointAddr,Usb1};
    use crate::Config;

    #[test]
    fn done_stack_order()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let mut lh = host.schedule.lock();
        let s = &mut *lh;
        let a = IsochNode::Sitd(s.pools.sitd.alloc(&*host.platform).unwrap());
        let b = IsochNode::Sitd(s.pools.sitd.alloc(&*host.platform).unwrap());
        let stack = DoneStack::default();
        stack.push(&mut s.pools, a);
        stack.push(&mut s.pools, b);
        assert_eq!(stack.pending(), 2);
        assert_eq!(stack.drain(&mut s.pools), [a, b]);
        assert_eq!(stack.pending(), 0);
        assert!(stack.drain(&mut s.pools).is_empty());
        s.pools.release_node(a);
        s.pools.release_node(b);
    }

    #[test]
    fn port_change_latched()
    {
        let (host, io, _platform) = make_host(Config::default());
        io.set_port(2, hw_regs::PORTSC_CurrentConnectStatus | hw_regs::PORTSC_ConnectStatusChange);
        io.raise_status(hw_regs::USBINTR_PortChange);
        assert!(host.handle_filter().run_action);
        assert_eq!(host.take_port_changes(), 1 << 2);
        // Status was acknowledged
        assert_eq!(io.op(OpReg::UsbSts) & hw_regs::USBSTS_ACK_MASK, 0);
        assert!(!host.handle_filter().run_action);
    }

    #[test]
    fn host_system_error_is_fatal()
    {
        let (host, io, _platform) = make_host(Config::default());
        io.raise_status(hw_regs::USBINTR_HostSystemError);
        assert!(host.handle_filter().run_action);
        assert!(host.take_fatal());
        assert!(!host.take_fatal());
    }

    #[test]
    fn scan_deferred_while_locked()
    {
        let (host, io, _platform) = make_host(Config::default());
        let spec = EndpointSpec { addr: EndpointAddr::new(3, 1), max_packet_size: 64, usb1: Some(Usb1 { hub_addr: 1, hub_port: 1, is_fullspeed: true }) };
        let id = host.create_isoch(spec, true, 1, 1).unwrap();
        host.submit_isoch(id, None, DmaBuffer::new(0x4000_0000, 64), &[64], Box::new(|_| ())).unwrap();
        io.set_frame(10);
        io.raise_status(hw_regs::USBINTR_IOC);
        {
            let _held = host.schedule.lock();
            assert!(host.handle_filter().run_action);
        }
        assert!(host.scan_pending.load(Ordering::Acquire));
        assert_eq!(host.done.pending(), 0);

        // Next interrupt gets the lock
        io.raise_status(hw_regs::USBINTR_IOC);
        host.handle_filter();
        assert_eq!(host.done.pending(), 1);
        let s = host.schedule.lock();
        assert_eq!(s.last_scanned_frame, 9);
        assert_eq!(s.endpoints.isoch(id).unwrap().scheduled, 1, "Counted down when retired, not when unlinked");
    }
}
