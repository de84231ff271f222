//! Housekeeping: isochronous admission, transfer timeouts, and idle queue heads
use crate::status::TransferError;
use crate::{Schedule,EndpointId};

/// What the monitor decided about a queue
enum Verdict
{
    Fine,
    TimedOut(&'static str),
    Idle,
}

impl super::HostInner
{
    /// Periodic housekeeping, nominally every few milliseconds
    pub fn housekeeping_tick(&self)
    {
        // Frame rollover interrupts can be missed (or not delivered at all)
        self.latch_rollover();
        let now = self.platform.monotonic_us();
        let run_action = {
            let mut lh = self.schedule.lock();
            let s = &mut *lh;
            let current = self.frame_number_64();
            self.scan_periodic(s, current);
            self.isoch_admit(s, current);

            for id in s.endpoints.queue_ids() {
                self.check_queue(s, id, now);
            }

            self.run_deferred(s);
            // A rendezvous that timed out earlier is retried here
            if s.waiting_on_doorbell() && !self.async_idle() {
                match self.ring_doorbell()
                {
                Ok(()) => self.run_deferred(s),
                Err(_) => log_warning!("housekeeping_tick: doorbell still unanswered ({} descriptors held)", s.deferred_count()),
                }
            }
            !s.deliveries.is_empty() || self.done.pending() > 0
            };
        if run_action {
            self.handle_action();
        }
    }

    fn check_queue(&self, s: &mut Schedule, id: EndpointId, now: u64)
    {
        let verdict = {
            let pools = &s.pools;
            let ep = match s.endpoints.queue_mut(id)
                {
                Ok(ep) => ep,
                Err(_) => return,
                };
            match ep.transfers.front()
            {
            None => {
                let threshold_us = self.config.inactive_threshold_ms as u64 * 1000;
                if ep.is_async() && ep.linked && threshold_us > 0 && now.saturating_sub(ep.idle_since_us) > threshold_us {
                    Verdict::Idle
                }
                else {
                    Verdict::Fine
                }
                },
            Some(t) => {
                if t.deadline_us.map(|d| now >= d).unwrap_or(false) {
                    Verdict::TimedOut("deadline")
                }
                else if let Some(limit) = t.no_data_us {
                    let progress = pools.qh.progress(ep.qh);
                    // Only meaningful once the controller has picked up this transfer
                    let on_this = pools.td.chain(t.first, t.last).any(|td| pools.td.phys(td) == progress.current_td);
                    if !on_this {
                        Verdict::Fine
                    }
                    else if ep.last_progress != Some(progress) {
                        ep.last_progress = Some(progress);
                        ep.last_progress_us = now;
                        Verdict::Fine
                    }
                    else if now.saturating_sub(ep.last_progress_us) >= limit {
                        Verdict::TimedOut("no data")
                    }
                    else {
                        Verdict::Fine
                    }
                }
                else {
                    Verdict::Fine
                }
                },
            }
            };

        match verdict
        {
        Verdict::Fine => {},
        Verdict::TimedOut(why) => {
            log_warning!("check_queue({:?}): transfer timed out ({})", id, why);
            if let Err(e) = self.halt_and_unlink_for_abort(s, id, false, TransferError::Timeout, true) {
                log_error!("check_queue({:?}): retiring timed out transfer failed: {}", id, e);
            }
            },
        Verdict::Idle => {
            let qh = match s.endpoints.queue(id)
                {
                Ok(ep) => ep.qh,
                Err(_) => return,
                };
            // Re-linking waits on this gate
            let gate = self.async_unlink(s, qh);
            if let Ok(ep) = s.endpoints.queue_mut(id) {
                ep.linked = false;
                ep.unlink_gate = gate;
            }
            s.inactive.push(id);
            log_debug!("check_queue({:?}): idle, moved {:?} to the inactive list ({:?})", id, qh, gate);
            },
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::*;
    use crate::hw_regs::{self,OpReg};
    use crate::hw_structs;
    use crate::status::TransferResult;
    use crate::usb_host::{EndpointSpec,EndpointAddr};
    use crate::{Config,DmaBuffer,TransferOptions,HostInner};
    use ::std::sync::{Arc,Mutex};

    fn spec(dev: u8) -> EndpointSpec {
        EndpointSpec { addr: EndpointAddr::new(dev, 2), max_packet_size: 512, usb1: None }
    }
    fn collector() -> (Arc<Mutex<Vec<TransferResult>>>, crate::status::TransferCallback) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o2 = out.clone();
        (out, Box::new(move |r| o2.lock().unwrap().push(r)))
    }
    /// Make the overlay look like the controller is working on the front transfer with `remaining` bytes left
    fn set_overlay(host: &HostInner, id: EndpointId, remaining: u32) {
        let s = host.schedule.lock();
        let ep = s.endpoints.queue(id).unwrap();
        let first = ep.transfers.front().unwrap().first;
        let q = s.pools.qh.get(ep.qh);
        q.current_td.set(s.pools.td.phys(first));
        q.overlay_token.set(hw_structs::QTD_TOKEN_STS_ACTIVE | remaining << hw_structs::QTD_TOKEN_LEN_SHIFT);
    }

    #[test]
    fn no_data_timeout()
    {
        let (host, _io, platform) = make_host(Config::default());
        let id = host.create_bulk(spec(1), true).unwrap();
        let (out, cb) = collector();
        let (out2, cb2) = collector();
        let opts = TransferOptions { no_data_timeout_ms: Some(100), ..Default::default() };
        host.submit_data(id, DmaBuffer::new(0x2000_0000, 4096), opts, cb).unwrap();
        host.submit_data(id, DmaBuffer::new(0x2000_2000, 4096), opts, cb2).unwrap();

        set_overlay(&host, id, 4096);
        host.housekeeping_tick();
        platform.advance_ms(60);
        // Data moved, the clock restarts
        set_overlay(&host, id, 2048);
        host.housekeeping_tick();
        platform.advance_ms(60);
        host.housekeeping_tick();
        assert!(out.lock().unwrap().is_empty());
        platform.advance_ms(60);
        host.housekeeping_tick();
        assert_eq!(*out.lock().unwrap(), [TransferResult { actual_len: 0, status: Err(TransferError::Timeout) }]);
        assert!(out2.lock().unwrap().is_empty());

        // Second transfer is next in line, and the queue head was put back
        let s = host.schedule.lock();
        let ep = s.endpoints.queue(id).unwrap();
        assert_eq!(ep.transfers.len(), 1);
        assert!(ep.linked);
        assert!(!ep.halted);
        assert_eq!(s.pools.qh.get(ep.qh).overlay_link.get(), s.pools.td.phys(ep.transfers[0].first));
    }

    #[test]
    fn not_started_is_not_stalled()
    {
        let (host, _io, platform) = make_host(Config::default());
        let id = host.create_bulk(spec(1), true).unwrap();
        let (out, cb) = collector();
        let opts = TransferOptions { no_data_timeout_ms: Some(10), ..Default::default() };
        host.submit_data(id, DmaBuffer::new(0x2000_0000, 512), opts, cb).unwrap();
        for _ in 0 .. 5 {
            platform.advance_ms(20);
            host.housekeeping_tick();
        }
        assert!(out.lock().unwrap().is_empty());
    }

    #[test]
    fn completion_deadline()
    {
        let (host, _io, platform) = make_host(Config::default());
        let id = host.create_control(EndpointSpec { max_packet_size: 64, ..spec(1) }).unwrap();
        let (out, cb) = collector();
        let opts = TransferOptions { timeout_ms: Some(50), no_data_timeout_ms: Some(0) };
        host.submit_control(id, DmaBuffer::new(0x3000_0000, 8), DmaBuffer::EMPTY, false, opts, cb).unwrap();
        platform.advance_ms(49);
        host.housekeeping_tick();
        assert!(out.lock().unwrap().is_empty());
        platform.advance_ms(1);
        host.housekeeping_tick();
        assert_eq!(*out.lock().unwrap(), [TransferResult { actual_len: 0, status: Err(TransferError::Timeout) }]);
        let s = host.schedule.lock();
        assert_eq!(s.async_list.outstanding, 0);
        assert_eq!(s.pools.td.in_use(), 1);
    }

    #[test]
    fn idle_queue_heads_parked()
    {
        let (host, io, platform) = make_host(Config::default());
        let a = host.create_bulk(spec(1), true).unwrap();
        let b = host.create_bulk(spec(2), true).unwrap();
        platform.advance_ms(1500);
        host.housekeeping_tick();
        assert!(host.schedule.lock().inactive.is_empty());
        // b is busy
        host.submit_data(b, DmaBuffer::new(0x2000_0000, 512), TransferOptions::default(), Box::new(|_| ())).unwrap();
        platform.advance_ms(1000);
        host.housekeeping_tick();
        {
            let s = host.schedule.lock();
            assert_eq!(s.inactive, [a]);
            assert!(!s.endpoints.queue(a).unwrap().linked);
            let qa = s.endpoints.queue(a).unwrap().qh;
            let qb = s.endpoints.queue(b).unwrap().qh;
            // Only b left on the ring
            assert_eq!(s.pools.qh.meta(qb).async_next, Some(qb));
            assert!(s.pools.qh.is_allocated(qa));
        }

        // Next use puts it back
        host.submit_data(a, DmaBuffer::new(0x2000_1000, 512), TransferOptions::default(), Box::new(|_| ())).unwrap();
        let s = host.schedule.lock();
        assert!(s.inactive.is_empty());
        assert!(s.endpoints.queue(a).unwrap().linked);
        assert_eq!(s.async_list.outstanding, 2);
        assert!(io.op(OpReg::UsbCmd) & hw_regs::USBCMD_AsyncEnable != 0);
    }

    #[test]
    fn parked_queue_head_waits_for_doorbell()
    {
        let (host, io, platform) = make_host(Config::default());
        let a = host.create_bulk(spec(1), true).unwrap();
        let b = host.create_bulk(spec(2), true).unwrap();
        host.submit_data(b, DmaBuffer::new(0x2000_0000, 512), TransferOptions::default(), Box::new(|_| ())).unwrap();
        io.state.lock().doorbell_ack = false;
        platform.advance_ms(2500);
        host.housekeeping_tick();
        let qa = {
            let s = host.schedule.lock();
            let ep = s.endpoints.queue(a).unwrap();
            assert_eq!(s.inactive, [a]);
            assert!(!ep.linked);
            match ep.unlink_gate
            {
            crate::ReleaseGate::Doorbell(_) => {},
            g => panic!("unexpected gate {:?}", g),
            }
            ep.qh
            };

        // Controller may still hold the queue head: no re-link yet
        let tds = host.schedule.lock().pools.td.in_use();
        let (out, cb) = collector();
        assert_eq!(host.submit_data(a, DmaBuffer::new(0x2000_1000, 512), TransferOptions::default(), cb),
            Err(crate::Error::Timeout("async advance doorbell")));
        {
            let s = host.schedule.lock();
            assert_eq!(s.inactive, [a]);
            assert!(!s.endpoints.queue(a).unwrap().linked);
            assert_eq!(s.pools.td.in_use(), tds);
            assert!(s.pools.qh.meta(qa).async_next.is_none());
        }
        assert!(out.lock().unwrap().is_empty());

        // Once the doorbell is answered the next submission goes through
        io.state.lock().doorbell_ack = true;
        host.submit_data(a, DmaBuffer::new(0x2000_1000, 512), TransferOptions::default(), Box::new(|_| ())).unwrap();
        let s = host.schedule.lock();
        let ep = s.endpoints.queue(a).unwrap();
        assert!(ep.linked);
        assert_eq!(ep.unlink_gate, crate::ReleaseGate::Now);
        assert!(s.inactive.is_empty());
        assert!(s.pools.qh.meta(qa).async_next.is_some());
    }

    #[test]
    fn parked_queue_head_delete_waits_for_doorbell()
    {
        let (host, io, platform) = make_host(Config::default());
        let a = host.create_bulk(spec(1), true).unwrap();
        let b = host.create_bulk(spec(2), true).unwrap();
        host.submit_data(b, DmaBuffer::new(0x2000_0000, 512), TransferOptions::default(), Box::new(|_| ())).unwrap();
        io.state.lock().doorbell_ack = false;
        platform.advance_ms(2500);
        host.housekeeping_tick();
        let qa = host.schedule.lock().endpoints.queue(a).unwrap().qh;

        host.delete_endpoint(a).unwrap();
        assert!(host.schedule.lock().pools.qh.is_allocated(qa));
        io.state.lock().doorbell_ack = true;
        host.housekeeping_tick();
        assert!(!host.schedule.lock().pools.qh.is_allocated(qa));
    }
}
