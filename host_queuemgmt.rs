//! HostInner async queue management functions
//!
//! The async schedule is a ring of queue heads with exactly one flagged as the head of the
//! reclamation list. New queue heads go in directly after the head.
use ::core::sync::atomic::Ordering;
use crate::desc_pools::QhId;
use crate::error::Error;
use crate::hw_regs::{self,OpReg};
use crate::hw_structs;
use crate::status::{TransferError,TransferResult};
use crate::{Schedule,ReleaseGate,DeferredItem,Delivery,EndpointId};

#[derive(Default)]
pub struct AsyncList
{
    /// Queue head with the H-bit set (`None` when the list is empty)
    pub head: Option<QhId>,
    /// Control/bulk transfers queued and not yet retired
    pub outstanding: usize,
}
impl AsyncList
{
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// Async queue management
impl super::HostInner
{
    /// Add the specified QH to the async list
    pub(crate) fn async_link(&self, s: &mut Schedule, qh: QhId) -> Result<(), Error>
    {
        let pools = &mut s.pools;
        match s.async_list.head
        {
        None => {
            // Empty list: this QH points at itself and becomes the head
            pools.qh.set_head_flag(qh, true);
            pools.qh.set_hlink(qh, pools.qh.link_value(qh));
            pools.qh.meta_mut(qh).async_next = Some(qh);
            hw_structs::publish_barrier();
            if self.async_enabled() {
                log_warning!("async_link({:?}): Async schedule still running with an empty list", qh);
            }
            let phys = pools.qh.phys(qh);
            let attempts = self.config.async_base_attempts();
            let mut latched = false;
            for attempt in 0 .. attempts {
                // SAFE: The async schedule is disabled, and the QH is valid
                unsafe { self.regs.write_op(OpReg::AsyncListAddr, phys); }
                if self.regs.read_op(OpReg::AsyncListAddr) == phys {
                    latched = true;
                    break;
                }
                log_debug!("async_link({:?}): ASYNCLISTADDR didn't latch (attempt {})", qh, attempt+1);
            }
            if !latched {
                log_error!("async_link({:?}): ASYNCLISTADDR write lost {} times", qh, attempts);
                pools.qh.meta_mut(qh).async_next = None;
                pools.qh.set_head_flag(qh, false);
                return Err(Error::Timeout("async list base"));
            }
            s.async_list.head = Some(qh);
            },
        Some(head) => {
            let next = pools.qh.meta(head).async_next.unwrap_or(head);
            pools.qh.set_head_flag(qh, false);
            // - `hlink` to point to the head's next
            pools.qh.set_hlink(qh, pools.qh.link_value(next));
            pools.qh.meta_mut(qh).async_next = Some(next);
            hw_structs::publish_barrier();
            // - Set head's next to this
            pools.qh.set_hlink(head, pools.qh.link_value(qh));
            pools.qh.meta_mut(head).async_next = Some(qh);
            },
        }
        log_trace!("async_link({:?}): head={:?}", qh, s.async_list.head);
        self.async_update_enable(s);
        Ok( () )
    }

    /// Remove a QH from the async list, returning when its descriptors can be released
    ///
    /// The QH's own `hlink` is left as-is (the controller may be following it).
    pub(crate) fn async_unlink(&self, s: &mut Schedule, qh: QhId) -> ReleaseGate
    {
        let next = match s.pools.qh.meta(qh).async_next
            {
            Some(n) => n,
            None => return ReleaseGate::Now,
            };
        let was_running = self.async_enabled();
        if next == qh {
            // Sole entry: stop the schedule before pulling the base out from under it
            let epoch = self.doorbell_epoch.load(Ordering::Acquire);
            // SAFE: Only clears the enable
            unsafe {
                let cmd = self.regs.read_op(OpReg::UsbCmd);
                self.regs.write_op(OpReg::UsbCmd, cmd & !hw_regs::USBCMD_AsyncEnable);
            }
            let stopped = self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & hw_regs::USBSTS_AsyncEnabled == 0);
            // SAFE: Schedule is disabled (or we've given up waiting for it)
            unsafe { self.regs.write_op(OpReg::AsyncListAddr, 0); }
            s.async_list.head = None;
            s.pools.qh.meta_mut(qh).async_next = None;
            s.pools.qh.set_head_flag(qh, false);
            return match stopped
                {
                Ok(()) => ReleaseGate::Now,
                Err(_) => {
                    log_warning!("async_unlink({:?}): Async schedule didn't stop", qh);
                    ReleaseGate::Doorbell(epoch)
                    },
                };
        }

        // Find the previous entry
        let mut prev = next;
        loop {
            match s.pools.qh.meta(prev).async_next
            {
            Some(n) if n == qh => break,
            Some(n) => prev = n,
            None => {
                log_error!("BUG: async_unlink({:?}): ring broken at {:?}", qh, prev);
                return ReleaseGate::Doorbell(self.doorbell_epoch.load(Ordering::Acquire));
                },
            }
        }
        if s.async_list.head == Some(qh) {
            s.pools.qh.set_head_flag(next, true);
            s.async_list.head = Some(next);
        }
        s.pools.qh.set_hlink(prev, s.pools.qh.link_value(next));
        s.pools.qh.meta_mut(prev).async_next = Some(next);
        s.pools.qh.meta_mut(qh).async_next = None;
        s.pools.qh.set_head_flag(qh, false);
        log_trace!("async_unlink({:?}): prev={:?} next={:?}", qh, prev, next);

        if was_running {
            // Controller may have the QH cached, wait for it to pass through the new topology
            let epoch = self.doorbell_epoch.load(Ordering::Acquire);
            match self.ring_doorbell()
            {
            Ok(()) => ReleaseGate::Now,
            Err(_) => {
                log_warning!("async_unlink({:?}): Doorbell not answered, deferring release", qh);
                ReleaseGate::Doorbell(epoch)
                },
            }
        }
        else {
            ReleaseGate::Now
        }
    }

    /// Start the async schedule if there's something for it to do
    pub(crate) fn async_update_enable(&self, s: &Schedule)
    {
        if s.async_list.head.is_some() && s.async_list.outstanding > 0 {
            let cmd = self.regs.read_op(OpReg::UsbCmd);
            if cmd & hw_regs::USBCMD_AsyncEnable == 0 {
                log_debug!("async_update_enable: starting async schedule");
                // SAFE: List base is valid
                unsafe { self.regs.write_op(OpReg::UsbCmd, cmd | hw_regs::USBCMD_AsyncEnable); }
            }
        }
    }

    fn async_enabled(&self) -> bool {
        self.regs.read_op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable != 0
            || self.regs.read_op(OpReg::UsbSts) & hw_regs::USBSTS_AsyncEnabled != 0
    }

    /// Ring the "interrupt on async advance" doorbell and wait (bounded) for the answer
    pub(crate) fn ring_doorbell(&self) -> Result<(), crate::platform::TimedOut>
    {
        // SAFE: Setting IAAD only requests an interrupt
        unsafe {
            let cmd = self.regs.read_op(OpReg::UsbCmd);
            self.regs.write_op(OpReg::UsbCmd, cmd | hw_regs::USBCMD_IAAD);
        }
        self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & hw_regs::USBINTR_IntrAsyncAdvance != 0)?;
        // SAFE: Write-1-to-clear of only the doorbell status
        unsafe { self.regs.write_op(OpReg::UsbSts, hw_regs::USBINTR_IntrAsyncAdvance); }
        self.doorbell_epoch.fetch_add(1, Ordering::AcqRel);
        Ok( () )
    }

    /// Force an endpoint's queue head to stop, and retire its transfers with `error`
    ///
    /// Async queue heads are unlinked for the duration (using the doorbell rendezvous) and put back
    /// (still halted, unless only the front transfer was removed) if the endpoint isn't being deleted.
    /// Interrupt queue heads stay in the periodic tree, their descriptors are released once the frame has passed.
    pub(crate) fn halt_and_unlink_for_abort(&self, s: &mut Schedule, id: EndpointId, deleting: bool, error: TransferError, front_only: bool) -> Result<(), Error>
    {
        let (qh, is_async, linked) = {
            let ep = s.endpoints.queue(id)?;
            (ep.qh, ep.is_async(), ep.linked)
            };
        log_debug!("halt_and_unlink_for_abort({:?}): {:?} deleting={} front_only={} {:?}", id, qh, deleting, front_only, error);
        s.pools.qh.halt(qh);
        let gate = if is_async {
                if linked {
                    let g = self.async_unlink(s, qh);
                    let ep = s.endpoints.queue_mut(id)?;
                    ep.linked = false;
                    ep.unlink_gate = g;
                    g
                }
                else {
                    // Parked, but maybe not yet let go of
                    s.endpoints.queue(id)?.unlink_gate
                }
            }
            else {
                ReleaseGate::Frame(self.frame_number_64())
            };

        // Retire the transfers
        let n = {
            let ep = s.endpoints.queue(id)?;
            if front_only { ep.transfers.len().min(1) } else { ep.transfers.len() }
            };
        for _ in 0 .. n {
            let t = match s.endpoints.queue_mut(id)?.transfers.pop_front()
                {
                Some(t) => t,
                None => break,
                };
            let actual = t.completed_bytes(&s.pools.td);
            let callback = Self::release_chain(s, t.first, t.last, gate);
            if is_async {
                s.async_list.outstanding = s.async_list.outstanding.saturating_sub(1);
            }
            match callback
            {
            Some(cb) => s.deliveries.push(Delivery::Transfer(cb, TransferResult { actual_len: actual, status: Err(error) })),
            None => log_error!("BUG: halt_and_unlink_for_abort({:?}): transfer without completion", id),
            }
        }

        let ep = s.endpoints.queue_mut(id)?;
        ep.last_progress = None;
        ep.last_progress_us = self.platform.monotonic_us();
        let resume_at = ep.transfers.front().map(|t| t.first).unwrap_or(ep.dummy);
        let dummy = ep.dummy;
        if deleting {
            s.release_gated(DeferredItem::Td(dummy), gate);
            s.release_gated(DeferredItem::Qh(qh), gate);
            return Ok( () );
        }

        // Point the overlay at what's left, keeping the data toggle
        s.pools.qh.reset_overlay(qh, s.pools.td.phys(resume_at), true);
        let ep = s.endpoints.queue_mut(id)?;
        if front_only {
            ep.halted = false;
        }
        else {
            s.pools.qh.halt(qh);
            ep.halted = true;
        }
        if is_async && linked {
            match self.async_link(s, qh)
            {
            Ok(()) => {
                let ep = s.endpoints.queue_mut(id)?;
                ep.linked = true;
                ep.unlink_gate = ReleaseGate::Now;
                },
            // Will be re-linked lazily on the next submission
            Err(e) => log_warning!("halt_and_unlink_for_abort({:?}): relink failed: {}", id, e),
            }
        }
        Ok( () )
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::*;
    use crate::usb_host::{EndpointSpec,EndpointAddr};
    use crate::{Config,DmaBuffer,TransferOptions};
    use ::std::sync::{Arc,Mutex};

    fn spec(dev: u8) -> EndpointSpec {
        EndpointSpec { addr: EndpointAddr::new(dev, 0), max_packet_size: 64, usb1: None }
    }

    #[test]
    fn ring_insertion_after_head()
    {
        let (host, io, _platform) = make_host(Config::default());
        let a = host.create_control(spec(1)).unwrap();
        let b = host.create_control(spec(2)).unwrap();
        let c = host.create_control(spec(3)).unwrap();
        let s = host.schedule.lock();
        let qa = s.endpoints.queue(a).unwrap().qh;
        let qb = s.endpoints.queue(b).unwrap().qh;
        let qc = s.endpoints.queue(c).unwrap().qh;
        assert_eq!(s.async_list.head, Some(qa));
        assert!(s.pools.qh.is_head(qa));
        assert!(!s.pools.qh.is_head(qb));
        // a -> c -> b -> a
        assert_eq!(s.pools.qh.meta(qa).async_next, Some(qc));
        assert_eq!(s.pools.qh.meta(qc).async_next, Some(qb));
        assert_eq!(s.pools.qh.meta(qb).async_next, Some(qa));
        assert_eq!(s.pools.qh.get(qa).hlink.get(), s.pools.qh.link_value(qc));
        assert_eq!(s.pools.qh.get(qb).hlink.get(), s.pools.qh.link_value(qa));
        assert_eq!(io.op(OpReg::AsyncListAddr), s.pools.qh.phys(qa));
        // Nothing outstanding, so the schedule isn't started
        assert_eq!(io.op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable, 0);
    }

    #[test]
    fn head_removal_passes_flag()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let a = host.create_control(spec(1)).unwrap();
        let b = host.create_control(spec(2)).unwrap();
        let qb = host.schedule.lock().endpoints.queue(b).unwrap().qh;
        host.delete_endpoint(a).unwrap();
        let s = host.schedule.lock();
        assert_eq!(s.async_list.head, Some(qb));
        assert!(s.pools.qh.is_head(qb));
        assert_eq!(s.pools.qh.meta(qb).async_next, Some(qb));
        assert_eq!(s.pools.qh.get(qb).hlink.get(), s.pools.qh.link_value(qb));
    }

    #[test]
    fn sole_unlink_stops_schedule_first()
    {
        let (host, io, _platform) = make_host(Config::default());
        let a = host.create_control(spec(1)).unwrap();
        host.submit_control(a, DmaBuffer::new(0x8000_0000, 8), DmaBuffer::EMPTY, false, TransferOptions::default(), Box::new(|_| ())).unwrap();
        assert!(io.op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable != 0);
        io.clear_writes();
        host.delete_endpoint(a).unwrap();
        let ev = io.writes();
        let disable = ev.iter().position(|&(r,v)| r == OpReg::UsbCmd && v & hw_regs::USBCMD_AsyncEnable == 0).expect("ASE cleared");
        let clear = ev.iter().position(|&(r,v)| r == OpReg::AsyncListAddr && v == 0).expect("base cleared");
        assert!(disable < clear);
        assert_eq!(host.schedule.lock().async_list.head, None);

        // Re-linking with nothing outstanding leaves the schedule off
        let b = host.create_control(spec(2)).unwrap();
        assert_eq!(io.op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable, 0);
        assert!(io.op(OpReg::AsyncListAddr) != 0);
        // ... and a transfer starts it
        host.submit_control(b, DmaBuffer::new(0x8000_0000, 8), DmaBuffer::EMPTY, false, TransferOptions::default(), Box::new(|_| ())).unwrap();
        assert!(io.op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable != 0);
    }

    #[test]
    fn release_waits_for_doorbell()
    {
        let (host, io, _platform) = make_host(Config::default());
        let a = host.create_control(spec(1)).unwrap();
        let b = host.create_control(spec(2)).unwrap();
        host.submit_control(a, DmaBuffer::new(0x8000_0000, 8), DmaBuffer::EMPTY, false, TransferOptions::default(), Box::new(|_| ())).unwrap();
        let qb = host.schedule.lock().endpoints.queue(b).unwrap().qh;

        // Controller ignores the doorbell: nothing may be released
        io.state.lock().doorbell_ack = false;
        host.delete_endpoint(b).unwrap();
        {
            let s = host.schedule.lock();
            assert!(s.pools.qh.is_allocated(qb));
            assert_eq!(s.deferred_count(), 2);
        }
        host.housekeeping_tick();
        assert!(host.schedule.lock().pools.qh.is_allocated(qb));

        // Doorbell answered on the next attempt
        {
            let mut st = io.state.lock();
            st.doorbell_ack = true;
        }
        io.clear_writes();
        host.housekeeping_tick();
        let s = host.schedule.lock();
        assert!(!s.pools.qh.is_allocated(qb));
        assert_eq!(s.deferred_count(), 0);
        assert!(io.writes().iter().any(|&(r,v)| r == OpReg::UsbCmd && v & hw_regs::USBCMD_IAAD != 0));
    }

    #[test]
    fn lost_base_writes_are_retried()
    {
        let mut config = Config::default();
        config.quirks |= crate::Quirks::ASYNC_BASE_WRITE_RETRY;
        let (host, io, _platform) = make_host(config);
        io.state.lock().drop_async_base_writes = 3;
        let a = host.create_control(spec(1)).unwrap();
        let s = host.schedule.lock();
        assert_eq!(io.op(OpReg::AsyncListAddr), s.pools.qh.phys(s.endpoints.queue(a).unwrap().qh));
    }

    #[test]
    fn lost_base_write_default_attempts()
    {
        let (host, io, _platform) = make_host(Config::default());
        io.state.lock().drop_async_base_writes = 3;
        let a = host.create_control(spec(1)).unwrap();
        let s = host.schedule.lock();
        assert_eq!(io.op(OpReg::AsyncListAddr), s.pools.qh.phys(s.endpoints.queue(a).unwrap().qh));
    }

    #[test]
    fn lost_base_write_attempts_bounded()
    {
        let (host, io, _platform) = make_host(Config::default());
        io.state.lock().drop_async_base_writes = 4;
        assert_eq!(host.create_control(spec(1)).map(|_| ()), Err(Error::Timeout("async list base")));
        assert_eq!(host.schedule.lock().pools.qh.in_use(), 0);
    }

    #[test]
    fn abort_keeps_place()
    {
        let (host, io, _platform) = make_host(Config::default());
        let a = host.create_control(spec(1)).unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0 .. 2 {
            let r = results.clone();
            host.submit_control(a, DmaBuffer::new(0x8000_0000, 8), DmaBuffer::new(0x8000_1000, 18), true, TransferOptions::default(),
                Box::new(move |res| r.lock().unwrap().push(res))).unwrap();
        }
        host.abort_endpoint(a).unwrap();
        {
            let s = host.schedule.lock();
            let ep = s.endpoints.queue(a).unwrap();
            assert!(ep.transfers.is_empty());
            assert!(ep.linked);
            assert!(ep.halted);
            assert!(s.pools.qh.is_halted(ep.qh));
            assert_eq!(s.async_list.outstanding, 0);
            // Only the QH and its dummy left
            assert_eq!(s.pools.td.in_use(), 1);
        }
        // Completions come from the action stage
        assert!(results.lock().unwrap().is_empty());
        host.handle_action();
        let r = results.lock().unwrap();
        assert_eq!(r.len(), 2);
        assert!(r.iter().all(|r| r.status == Err(TransferError::Cancelled)));
        drop(r);
        let _ = io;
    }
}
