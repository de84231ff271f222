//! Interrupt endpoints on the periodic schedule
//!
//! Interrupt queue heads form a tree across the frame list: each slot's list runs from the
//! longest period to the shortest, so a queue head shared by several slots has the same
//! successor in all of them.
use crate::desc_pools::QhId;
use crate::error::Error;
use crate::host_periodic::{self,PeriodicLink,Reservation};
use crate::host_transfer::{QueueEndpoint,QueueKind};
use crate::hw_structs;
use crate::usb_host::{EndpointSpec,make_endpoint_spec};
use crate::{Schedule,Endpoint,EndpointId,PERIODIC_SIZE};

/// Placement of an interrupt queue head in the frame list
pub(crate) struct IntrSchedule
{
    /// Frames between polls (power of two)
    pub period: u32,
    /// First frame slot used
    pub offset: u32,
    pub reservation: Reservation,
}
impl IntrSchedule
{
    fn slots(&self) -> impl Iterator<Item=usize> {
        (self.offset as usize .. PERIODIC_SIZE).step_by(self.period as usize)
    }
}

impl super::HostInner
{
    /// Create an interrupt endpoint polled every `interval` (microframes for high-speed, frames otherwise)
    pub fn create_interrupt(&self, spec: EndpointSpec, dir_in: bool, interval: u32) -> Result<EndpointId, Error>
    {
        let high_speed = spec.is_high_speed();
        if interval == 0 || (high_speed && interval > 32768) || (!high_speed && interval > 255) {
            return Err(Error::InvalidArgument("polling interval"));
        }
        let max_mps = match spec.usb1
            {
            None => 1024,
            Some(u) if u.is_fullspeed => 64,
            Some(_) => 8,
            };
        if spec.max_packet_size == 0 || spec.max_packet_size > max_mps {
            return Err(Error::InvalidArgument("max packet size"));
        }
        let period = host_periodic::normalized_period(interval, high_speed);
        let mps = spec.max_packet_size as u32;

        let now = self.platform.monotonic_us();
        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let (reservation, offset, smask, cmask) = match spec.usb1
            {
            None => {
                let (r, phase) = s.periodic.bandwidth.reserve_hs(interval, mps, false)?;
                (r, phase.frame, host_periodic::hs_smask(interval, phase.uframe), 0)
                },
            Some(u) => {
                // Low-speed transactions take eight times as long on the full-speed bus
                let cost = if u.is_fullspeed { mps } else { mps * 8 };
                let (r, phase) = s.periodic.bandwidth.reserve_tt(u.hub_addr, period, cost, false)?;
                let start = (phase.offset / hw_structs::SPLIT_BYTES_PER_UFRAME).min(3);
                (r, phase.frame, 1u8 << start, 0b111u8 << (start + 2))
                },
            };
        let sched = IntrSchedule { period, offset, reservation };

        let (qh, dummy) = match self.alloc_qh_pair(s)
            {
            Ok(v) => v,
            Err(e) => {
                s.periodic.bandwidth.release(&sched.reservation);
                return Err(e);
                },
            };
        let (endpoint_id, mut endpoint_ext) = make_endpoint_spec(&spec, false);
        endpoint_ext |= smask as u32 | (cmask as u32) << hw_structs::QH_EXT_CMASK_SHIFT;
        let dummy_phys = s.pools.td.phys(dummy);
        s.pools.qh.init_endpoint(qh, endpoint_id, endpoint_ext, dummy_phys);
        s.pools.qh.meta_mut(qh).period = period;
        log_debug!("create_interrupt({:?}): {:?} period={} offset={} smask={:#x} cmask={:#x}",
            spec.addr, qh, period, offset, smask, cmask);

        self.intr_link(s, qh, &sched);
        let mut ep = QueueEndpoint::new(spec, QueueKind::Interrupt(sched), dir_in, qh, dummy, now);
        ep.linked = true;
        let id = s.endpoints.insert(Endpoint::Queue(ep));
        s.pools.qh.meta_mut(qh).endpoint = Some(id);
        Ok(id)
    }

    /// Insert a queue head into every slot it polls in
    fn intr_link(&self, s: &mut Schedule, qh: QhId, sched: &IntrSchedule)
    {
        let me = PeriodicLink::Qh(qh);
        // Find the entry that follows (equal or shorter period)
        let mut next = PeriodicLink::Terminate;
        for slot in sched.slots() {
            let n = Self::intr_find_insert_point(s, slot, sched.period).1;
            if n != PeriodicLink::Terminate {
                if next != PeriodicLink::Terminate {
                    // If the `next` is already set, then it must agree
                    debug_assert!(next == n, "intr_link: slot {} disagrees ({:?} != {:?})", slot, n, next);
                }
                else {
                    next = n;
                }
            }
        }
        s.pools.set_periodic_next(me, next);
        hw_structs::publish_barrier();

        for slot in sched.slots() {
            let (prev, _) = Self::intr_find_insert_point(s, slot, sched.period);
            s.periodic.set_after(&mut s.pools, slot, prev, me);
        }
    }

    /// Take an interrupt endpoint's queue head out of the frame list and give back its bandwidth
    ///
    /// The queue head itself stays valid until the current frame has passed.
    pub(crate) fn intr_unlink(&self, s: &mut Schedule, id: EndpointId) -> Result<(), Error>
    {
        let ep = s.endpoints.queue(id)?;
        let sched = match ep.kind
            {
            QueueKind::Interrupt(ref sched) => sched,
            _ => return Err(Error::InvalidArgument("not an interrupt endpoint")),
            };
        let me = PeriodicLink::Qh(ep.qh);
        for slot in sched.slots() {
            if !s.periodic.unlink(&mut s.pools, slot, me) {
                log_warning!("intr_unlink({:?}): not present in slot {}", id, slot);
            }
        }
        s.periodic.bandwidth.release(&sched.reservation);
        Ok( () )
    }

    /// Returns the entry to insert after (`None` for the slot head) and the entry that would follow
    fn intr_find_insert_point(s: &Schedule, slot: usize, period: u32) -> (Option<PeriodicLink>, PeriodicLink) {
        let mut prev = None;
        let mut cur = s.periodic.head(slot);
        loop
        {
            if cur == PeriodicLink::Terminate {
                break (prev, cur);
            }
            if s.pools.periodic_period(cur) <= period {
                break (prev, cur);
            }
            prev = Some(cur);
            cur = s.pools.periodic_next(cur);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::test_support::*;
    use crate::usb_host::{EndpointAddr,Usb1};
    use crate::Config;

    fn fs_spec(hub: u8) -> EndpointSpec {
        EndpointSpec {
            addr: EndpointAddr::new(hub + 10, 1),
            max_packet_size: 8,
            usb1: Some(Usb1 { hub_addr: hub, hub_port: 1, is_fullspeed: true }),
        }
    }
    fn qh_of(host: &crate::HostInner, id: EndpointId) -> QhId {
        host.schedule.lock().endpoints.queue(id).unwrap().qh
    }

    #[test]
    fn tree_order()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let a = host.create_interrupt(fs_spec(1), true, 8).unwrap();
        let b = host.create_interrupt(fs_spec(2), true, 2).unwrap();
        let c = host.create_interrupt(fs_spec(3), true, 4).unwrap();
        let (qa, qb, qc) = (qh_of(&host, a), qh_of(&host, b), qh_of(&host, c));
        {
            let s = host.schedule.lock();
            let slot = |i| s.periodic.iter_slot(&s.pools, i).collect::<Vec<_>>();
            assert_eq!(slot(0), [PeriodicLink::Qh(qa), PeriodicLink::Qh(qc), PeriodicLink::Qh(qb)]);
            assert_eq!(slot(8), [PeriodicLink::Qh(qa), PeriodicLink::Qh(qc), PeriodicLink::Qh(qb)]);
            assert_eq!(slot(4), [PeriodicLink::Qh(qc), PeriodicLink::Qh(qb)]);
            assert_eq!(slot(2), [PeriodicLink::Qh(qb)]);
            assert_eq!(slot(1), []);
            assert_eq!(s.periodic.hw_slot(4), s.pools.link_value(PeriodicLink::Qh(qc)));
            assert_eq!(s.pools.qh.get(qc).hlink.get(), s.pools.link_value(PeriodicLink::Qh(qb)));
            assert_eq!(s.pools.qh.get(qb).hlink.get(), hw_structs::LINK_TERMINATE);
        }

        host.delete_endpoint(c).unwrap();
        let s = host.schedule.lock();
        assert_eq!(s.periodic.iter_slot(&s.pools, 0).collect::<Vec<_>>(), [PeriodicLink::Qh(qa), PeriodicLink::Qh(qb)]);
        assert_eq!(s.periodic.head(4), PeriodicLink::Qh(qb));
        // Freed once the frame is over
        assert!(s.pools.qh.is_allocated(qc));
        assert_eq!(s.periodic.bandwidth.tt_load(3, 0), 0);
    }

    #[test]
    fn split_masks()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let a = host.create_interrupt(fs_spec(1), false, 1).unwrap();
        let s = host.schedule.lock();
        let qa = s.endpoints.queue(a).unwrap().qh;
        let ext = s.pools.qh.get(qa).endpoint_ext.get();
        assert_eq!(ext & 0xFFFF, 0b11100 << 8 | 0b1);
    }

    #[test]
    fn start_split_follows_tt_load()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let spec = EndpointSpec { max_packet_size: 64, ..fs_spec(1) };
        // 64 bytes each: the fourth starts 192 bytes in, past the first microframe
        let ids: Vec<_> = (0 .. 4).map(|_| host.create_interrupt(spec, false, 1).unwrap()).collect();
        let s = host.schedule.lock();
        let ext = |id| s.pools.qh.get(s.endpoints.queue(id).unwrap().qh).endpoint_ext.get() & 0xFFFF;
        assert_eq!(ext(ids[2]), 0b11100 << 8 | 0b1);
        assert_eq!(ext(ids[3]), 0b111000 << 8 | 0b10);
        assert_eq!(s.periodic.bandwidth.tt_load(1, 0), 256);
    }

    #[test]
    fn high_speed_masks()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let spec = EndpointSpec { addr: EndpointAddr::new(4, 2), max_packet_size: 512, usb1: None };
        let a = host.create_interrupt(spec, true, 2).unwrap();
        let s = host.schedule.lock();
        let qa = s.endpoints.queue(a).unwrap().qh;
        assert_eq!(s.pools.qh.get(qa).endpoint_ext.get() & 0xFFFF, 0b0101_0101);
        // Every frame polls
        assert!((0 .. PERIODIC_SIZE).all(|i| s.periodic.head(i) == PeriodicLink::Qh(qa)));
    }

    #[test]
    fn bad_parameters()
    {
        let (host, _io, _platform) = make_host(Config::default());
        assert_eq!(host.create_interrupt(fs_spec(1), true, 0).map(|_| ()), Err(Error::InvalidArgument("polling interval")));
        assert_eq!(host.create_interrupt(fs_spec(1), true, 256).map(|_| ()), Err(Error::InvalidArgument("polling interval")));
        let big = EndpointSpec { max_packet_size: 65, ..fs_spec(1) };
        assert_eq!(host.create_interrupt(big, true, 8).map(|_| ()), Err(Error::InvalidArgument("max packet size")));
        assert_eq!(host.schedule.lock().pools.qh.in_use(), 0);
    }

    #[test]
    fn bandwidth_exhaustion()
    {
        let (host, _io, _platform) = make_host(Config::default());
        let spec = EndpointSpec { addr: EndpointAddr::new(4, 2), max_packet_size: 1024, usb1: None };
        // Every microframe of every frame
        for _ in 0 .. 5 {
            host.create_interrupt(spec, true, 1).unwrap();
        }
        assert_eq!(host.create_interrupt(spec, true, 1).map(|_| ()), Err(Error::NoBandwidth));
        assert_eq!(host.schedule.lock().pools.qh.in_use(), 5);
    }
}
