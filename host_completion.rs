//! Interrupt action stage: retire finished work and run client completions
//!
//! Completions are collected under the schedule lock and only called once it has been released,
//! so a completion may submit more work on the same endpoint.
use ::alloc::vec::Vec;
use ::core::sync::atomic::Ordering;
use crate::desc_pools::TdId;
use crate::hw_structs::{self,Pid};
use crate::status::{self,StatusBits,StatusContext,StatusSource,TransferError,TransferResult};
use crate::{Schedule,EndpointId,Delivery,ReleaseGate};

/// State of the front transfer on a queue
enum Walk
{
    Running,
    /// Halted on a bus error that can be retried
    Retry(TdId),
    Done(Result<(), TransferError>),
}

impl super::HostInner
{
    /// Action stage, run (outside interrupt context) whenever the filter stage asks for it
    pub fn handle_action(&self)
    {
        let deliveries = {
            let mut lh = self.schedule.lock();
            let s = &mut *lh;
            let current = self.frame_number_64();
            if self.scan_pending.swap(false, Ordering::AcqRel) {
                self.scan_periodic(s, current);
            }
            self.drain_done(s);

            let now = self.platform.monotonic_us();
            for id in s.endpoints.queue_ids() {
                self.scavenge_queue(s, id, now);
            }
            self.isoch_admit(s, current);
            self.run_deferred(s);
            ::core::mem::replace(&mut s.deliveries, Vec::new())
            };
        if self.fatal.load(Ordering::Acquire) {
            log_error!("handle_action: host system error, controller has stopped");
        }
        self.deliver(deliveries);
    }

    /// Retire the isochronous descriptors the filter stage has unlinked
    pub(crate) fn drain_done(&self, s: &mut Schedule)
    {
        let now = self.platform.monotonic_us();
        for node in self.done.drain(&mut s.pools) {
            self.isoch_retire(s, node, TransferError::TooLate, ReleaseGate::Now, now);
        }
    }

    /// Run completions (no locks held)
    fn deliver(&self, deliveries: Vec<Delivery>)
    {
        for d in deliveries {
            match d
            {
            Delivery::Transfer(cb, r) => cb(r),
            Delivery::Isoch(cb, r) => cb(r),
            Delivery::AbortDone(id) => self.isoch_abort_done(id),
            }
        }
    }

    /// Retire completed transfers from the front of a queue head
    fn scavenge_queue(&self, s: &mut Schedule, id: EndpointId, now: u64)
    {
        loop
        {
            let (qh, is_async, split, first, last, is_control, retries) = match s.endpoints.queue(id)
                {
                Ok(ep) => match ep.transfers.front()
                    {
                    Some(t) => (ep.qh, ep.is_async(), ep.spec.usb1.is_some(), t.first, t.last, t.is_control, t.retries),
                    None => return,
                    },
                Err(_) => return,
                };

            let walk = self.walk_transfer(s, first, last, is_control, retries, split);
            let result = match walk
                {
                Walk::Running => return,
                Walk::Retry(td) => {
                    let d = s.pools.td.get(td);
                    let tok = d.token.get() & !(hw_structs::QTD_TOKEN_STS_MASK | hw_structs::QTD_TOKEN_CERR_MASK);
                    d.token.set(tok | hw_structs::QTD_TOKEN_STS_ACTIVE | 3 << hw_structs::QTD_TOKEN_CERR_SHIFT);
                    s.pools.qh.rearm_overlay(qh);
                    if let Ok(ep) = s.endpoints.queue_mut(id) {
                        if let Some(t) = ep.transfers.front_mut() {
                            t.retries += 1;
                        }
                    }
                    log_debug!("scavenge_queue({:?}): bus error on {:?}, retry {}", id, td, retries + 1);
                    return ;
                    },
                Walk::Done(r) => r,
                };

            let t = match s.endpoints.queue_mut(id).ok().and_then(|ep| ep.transfers.pop_front())
                {
                Some(t) => t,
                None => return,
                };
            let actual_len = t.completed_bytes(&s.pools.td);
            let callback = Self::release_chain(s, t.first, t.last, ReleaseGate::Now);
            if is_async {
                s.async_list.outstanding = s.async_list.outstanding.saturating_sub(1);
            }
            let resume_at = match s.endpoints.queue_mut(id)
                {
                Ok(ep) => {
                    ep.last_progress = None;
                    ep.last_progress_us = now;
                    if ep.transfers.is_empty() {
                        ep.idle_since_us = now;
                    }
                    ep.transfers.front().map(|t| t.first).unwrap_or(ep.dummy)
                    },
                Err(_) => return,
                };
            if let Err(e) = result {
                log_debug!("scavenge_queue({:?}): transfer failed: {:?} ({} bytes)", id, e, actual_len);
                // Queue head stopped on the failed descriptor, restart it on what's left
                let phys = s.pools.td.phys(resume_at);
                s.pools.qh.reset_overlay(qh, phys, e != TransferError::Stall);
            }
            match callback
            {
            Some(cb) => s.deliveries.push(Delivery::Transfer(cb, TransferResult { actual_len, status: result })),
            None => log_error!("BUG: scavenge_queue({:?}): transfer without completion", id),
            }
        }
    }

    /// Follow a transfer's descriptors the way the controller did
    fn walk_transfer(&self, s: &Schedule, first: TdId, last: TdId, is_control: bool, retries: u8, split: bool) -> Walk
    {
        let mut td = first;
        loop
        {
            let token = s.pools.td.get(td).token.get();
            let pid = s.pools.td.meta(td).pid;
            let bits = StatusBits::from_qtd(token);
            if bits.active {
                return Walk::Running;
            }
            if bits.halted {
                if bits.is_bus_error() && retries < self.config.bus_error_retries {
                    return Walk::Retry(td);
                }
                let ctx = StatusContext { source: StatusSource::Qtd, dir_in: pid == Some(Pid::In), split };
                return Walk::Done(Err(status::decode(bits, ctx).unwrap_or(TransferError::Stall)));
            }
            if td == last {
                return Walk::Done(Ok( () ));
            }
            let short = pid == Some(Pid::In) && hw_structs::TransferDesc::token_len(token) > 0;
            if short {
                if is_control {
                    // Controller took the alternate link to the status stage
                    td = last;
                    continue ;
                }
                return Walk::Done(Ok( () ));
            }
            td = match s.pools.td.meta(td).next
                {
                Some(n) => n,
                None => {
                    log_error!("BUG: walk_transfer: chain ends at {:?} before {:?}", td, last);
                    return Walk::Done(Ok( () ));
                    },
                };
        }
    }
}
