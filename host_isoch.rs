//! Isochronous endpoints
//!
//! A submission is turned into descriptors straight away and parked on the endpoint's to-do list.
//! The admission pass (run from the action stage and the housekeeping tick) moves descriptors into
//! the frame list once their frame is inside the scheduling window, and the filter stage pulls them
//! back out once their frame has gone by.
use ::alloc::collections::VecDeque;
use ::alloc::vec::Vec;
use ::core::sync::atomic::Ordering;
use crate::desc_pools::{IsochNode,ItdFill,SitdFill,SitdId,Pools};
use crate::error::Error;
use crate::host_periodic::{self,Reservation};
use crate::hw_structs;
use crate::platform::DmaBuffer;
use crate::status::{self,IsochCallback,IsochPacketResult,IsochResult,StatusBits,StatusContext,StatusSource,TransferError};
use crate::usb_host::{EndpointSpec,Usb1};
use crate::{Schedule,Endpoint,EndpointId,DeferredItem,Delivery,ReleaseGate,PERIODIC_SIZE};

/// How far past the current frame (or the end of the last submission) a request may start
const SCHEDULE_SPAN: u64 = PERIODIC_SIZE as u64;

/// How an endpoint's packets map onto descriptors
#[derive(Debug,Copy,Clone)]
pub(crate) struct StreamLayout
{
    pub dev_addr: u8,
    pub endpt: u8,
    pub dir_in: bool,
    pub max_packet_size: u16,
    pub mult: u8,
    pub usb1: Option<Usb1>,
    /// Packets per descriptor (more than one for high-speed intervals below a frame)
    pub per_desc: usize,
    /// Microframes between packets within a descriptor
    pub uframe_step: u8,
    /// First microframe (start-split microframe for full-speed)
    pub uframe: u8,
    /// Frames between descriptors
    pub frame_step: u32,
}
impl StreamLayout
{
    fn max_packet_len(&self) -> usize {
        self.max_packet_size as usize * self.mult as usize
    }
}

pub(crate) struct IsochRequest
{
    seq: u64,
    start_frame: u64,
    /// Pre-filled with the programmed lengths
    packets: Vec<IsochPacketResult>,
    /// Descriptors carrying packets that haven't been retired
    remaining: usize,
    callback: Option<IsochCallback>,
}

pub(crate) struct IsochEndpoint
{
    pub spec: EndpointSpec,
    pub layout: StreamLayout,
    pub reservation: Reservation,
    /// Built, not yet in the frame list (in frame order)
    pub todo: VecDeque<IsochNode>,
    /// Number of descriptors linked into the frame list and not yet retired
    pub scheduled: usize,
    /// Frame after the end of the last submission
    pub first_available_frame: Option<u64>,
    pub requests: VecDeque<IsochRequest>,
    next_seq: u64,
    pub aborting: bool,
    pub deleting: bool,
}

/// S-mask, C-mask, and C-mask bits that wrap into the following frame for a split transaction
fn split_masks(start: u8, len: usize, dir_in: bool) -> (u8, u8, u8)
{
    let per_uframe = hw_structs::SPLIT_BYTES_PER_UFRAME as usize;
    let count = ((len + per_uframe - 1) / per_uframe).max(1);
    if !dir_in {
        // OUT: one start-split per 188 bytes, no complete-splits
        let s = (start as usize).min(8 - count);
        ((((1u16 << count) - 1) << s) as u8, 0, 0)
    }
    else {
        // IN: one start-split, complete-splits from two microframes later
        let mask: u16 = ((1u16 << (count + 1)) - 1) << (start + 2);
        (1 << start, mask as u8 | (mask >> 8) as u8, (mask >> 8) as u8)
    }
}

fn to_result(e: Option<TransferError>) -> Result<(), TransferError> {
    match e
    {
    Some(e) => Err(e),
    None => Ok( () ),
    }
}

/// Length and status of packet `j` carried by a retired descriptor
fn packet_status(pools: &Pools, node: IsochNode, j: usize, uframes: &[u8; 8], programmed: usize, dir_in: bool, unrun: TransferError) -> (usize, Result<(), TransferError>)
{
    match node
    {
    IsochNode::Itd(i) => {
        let w = pools.itd.get(i).transactions[uframes[j] as usize].get();
        let bits = StatusBits::from_itd(w);
        if bits.active {
            return (0, Err(unrun));
        }
        // Length is only written back for IN
        let len = if dir_in { ((w & hw_structs::ITD_TRANS_LEN_MASK) >> hw_structs::ITD_TRANS_LEN_SHIFT) as usize } else { programmed };
        (len, to_result(status::decode(bits, StatusContext { source: StatusSource::Itd, dir_in, split: false })))
        },
    IsochNode::Sitd(i) => {
        let st = pools.sitd.get(i).state.get();
        let bits = StatusBits::from_sitd(st);
        if bits.active {
            return (0, Err(unrun));
        }
        let remaining = ((st & hw_structs::SITD_STATE_LEN_MASK) >> hw_structs::SITD_STATE_LEN_SHIFT) as usize;
        (programmed.saturating_sub(remaining), to_result(status::decode(bits, StatusContext { source: StatusSource::Sitd, dir_in, split: true })))
        },
    }
}

impl super::HostInner
{
    /// Create an isochronous endpoint, reserving its bandwidth in every frame
    pub fn create_isoch(&self, spec: EndpointSpec, dir_in: bool, interval: u32, mult: u8) -> Result<EndpointId, Error>
    {
        let high_speed = spec.is_high_speed();
        if interval == 0 || (high_speed && interval > 32768) || (!high_speed && interval > PERIODIC_SIZE as u32) {
            return Err(Error::InvalidArgument("polling interval"));
        }
        let mps = spec.max_packet_size;
        let mult = if high_speed { mult } else { 1 };
        if high_speed {
            if mult == 0 || mult > 3 {
                return Err(Error::InvalidArgument("transactions per microframe"));
            }
            if mps == 0 || mps > 1024 {
                return Err(Error::InvalidArgument("max packet size"));
            }
        }
        else {
            if let Some(Usb1 { is_fullspeed: false, .. }) = spec.usb1 {
                return Err(Error::InvalidArgument("low-speed isochronous endpoint"));
            }
            if mps == 0 || mps as usize > hw_structs::SITD_MAX_TRANSACTION {
                return Err(Error::InvalidArgument("max packet size"));
            }
        }

        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let (reservation, uframe, per_desc, uframe_step, frame_step) = match spec.usb1
            {
            None => {
                let (r, phase) = s.periodic.bandwidth.reserve_hs(interval, mps as u32 * mult as u32, true)?;
                if interval < 8 {
                    let step = 1u32 << (31 - interval.leading_zeros());
                    (r, phase.uframe, (8 / step) as usize, step as u8, 1)
                }
                else {
                    (r, phase.uframe, 1, 0, host_periodic::normalized_period(interval, true))
                }
                },
            Some(u) => {
                let (r, phase) = s.periodic.bandwidth.reserve_tt(u.hub_addr, host_periodic::normalized_period(interval, false), mps as u32, true)?;
                let start = (phase.offset / hw_structs::SPLIT_BYTES_PER_UFRAME).min(7) as u8;
                (r, start, 1, 0, host_periodic::normalized_period(interval, false))
                },
            };
        let layout = StreamLayout {
            dev_addr: spec.addr.dev_addr(),
            endpt: spec.addr.endpt(),
            dir_in,
            max_packet_size: mps,
            mult,
            usb1: spec.usb1,
            per_desc,
            uframe_step,
            uframe,
            frame_step,
            };
        log_debug!("create_isoch({:?}): {:?}", spec.addr, layout);
        let id = s.endpoints.insert(Endpoint::Isoch(IsochEndpoint {
            spec,
            layout,
            reservation,
            todo: VecDeque::new(),
            scheduled: 0,
            first_available_frame: None,
            requests: VecDeque::new(),
            next_seq: 0,
            aborting: false,
            deleting: false,
            }));
        Ok(id)
    }

    /// Queue a run of packets (one per service interval) packed back to back in `buffer`
    ///
    /// Returns the frame of the first packet.
    pub fn submit_isoch(&self, id: EndpointId, start_frame: Option<u64>, buffer: DmaBuffer, lengths: &[u16], complete: IsochCallback) -> Result<u64, Error>
    {
        if lengths.is_empty() {
            return Err(Error::InvalidArgument("no packets"));
        }
        self.check_buffer(&buffer)?;
        let current = self.frame_number_64();
        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let (layout, fa, seq) = {
            let ep = s.endpoints.isoch(id)?;
            if ep.aborting || ep.deleting {
                return Err(Error::Busy);
            }
            (ep.layout, ep.first_available_frame, ep.next_seq)
            };
        if lengths.iter().any(|&l| l as usize > layout.max_packet_len()) {
            return Err(Error::InvalidArgument("packet larger than max packet size"));
        }
        if lengths.iter().map(|&l| l as usize).sum::<usize>() > buffer.len {
            return Err(Error::InvalidArgument("buffer too small"));
        }

        let start = start_frame.unwrap_or_else(|| fa.unwrap_or(0).max(current + self.keep_away as u64));
        if let Some(fa) = fa {
            if start < fa {
                log_debug!("submit_isoch({:?}): start {} before {}", id, start, fa);
                return Err(Error::TooOld);
            }
        }
        if start >= fa.unwrap_or(0).max(current) + SCHEDULE_SPAN {
            log_debug!("submit_isoch({:?}): start {} too far ahead of {}", id, start, current);
            return Err(Error::TooNew);
        }

        let mut nodes = Vec::new();
        let built = if layout.usb1.is_none() {
                self.build_itds(s, id, &layout, start, buffer, lengths, seq, &mut nodes)
            }
            else {
                self.build_sitds(s, id, &layout, start, buffer, lengths, seq, &mut nodes)
            };
        let end = match built
            {
            Ok(end) => end,
            Err(e) => {
                log_warning!("submit_isoch({:?}): {} after {} descriptors", id, e, nodes.len());
                for n in nodes {
                    s.pools.release_node(n);
                }
                return Err(e);
                },
            };
        let real = nodes.iter().filter(|&&n| s.pools.isoch_meta(n).packets > 0).count();
        log_trace!("submit_isoch({:?}): {} packets in {} descriptors, frames {}..{}", id, lengths.len(), nodes.len(), start, end);

        let ep = s.endpoints.isoch_mut(id)?;
        ep.todo.extend(nodes);
        ep.requests.push_back(IsochRequest {
            seq,
            start_frame: start,
            packets: lengths.iter().map(|&l| IsochPacketResult { actual_len: l as usize, status: Ok( () ), timestamp_us: 0 }).collect(),
            remaining: real,
            callback: Some(complete),
            });
        ep.next_seq += 1;
        ep.first_available_frame = Some(end);
        self.isoch_admit(s, current);
        Ok(start)
    }

    /// High-speed: `per_desc` packets to each iTD, one iTD every `frame_step` frames
    fn build_itds(&self, s: &mut Schedule, id: EndpointId, l: &StreamLayout, start: u64, buffer: DmaBuffer, lengths: &[u16], seq: u64, nodes: &mut Vec<IsochNode>) -> Result<u64, Error>
    {
        let n_desc = (lengths.len() + l.per_desc - 1) / l.per_desc;
        let mut frame = start;
        let mut ofs = 0;
        for (k, chunk) in lengths.chunks(l.per_desc).enumerate() {
            let itd = s.pools.itd.alloc(&*self.platform)?;
            nodes.push(IsochNode::Itd(itd));
            let mut transactions = [(0u8, 0usize, 0usize); 8];
            let mut len = 0;
            let m = s.pools.itd.meta_mut(itd);
            for (j, &plen) in chunk.iter().enumerate() {
                let uf = l.uframe + j as u8 * l.uframe_step;
                transactions[j] = (uf, len, plen as usize);
                m.uframes[j] = uf;
                len += plen as usize;
            }
            m.endpoint = Some(id);
            m.frame = frame;
            m.request = seq;
            m.first_packet = (k * l.per_desc) as u32;
            m.packets = chunk.len() as u8;
            s.pools.itd.fill(itd, &ItdFill {
                dev_addr: l.dev_addr,
                endpt: l.endpt,
                dir_in: l.dir_in,
                max_packet_size: l.max_packet_size,
                mult: l.mult,
                buffer: buffer.slice(ofs, len),
                transactions: &transactions[.. chunk.len()],
                ioc: k + 1 == n_desc,
                });
            ofs += len;
            frame += l.frame_step as u64;
        }
        Ok(frame)
    }

    /// Full-speed: one siTD per packet
    ///
    /// An IN packet whose complete-splits run past the end of its frame needs an entry in the
    /// next frame pointing back at it: the next packet's siTD if that is in the following frame,
    /// otherwise an extra siTD that carries no data.
    fn build_sitds(&self, s: &mut Schedule, id: EndpointId, l: &StreamLayout, start: u64, buffer: DmaBuffer, lengths: &[u16], seq: u64, nodes: &mut Vec<IsochNode>) -> Result<u64, Error>
    {
        let usb1 = match l.usb1
            {
            Some(u) => u,
            None => return Err(Error::InvalidArgument("not a split endpoint")),
            };
        let n = lengths.len();
        let mut pending: Option<(SitdId, u64, u8)> = None;
        let mut ofs = 0;
        for (i, &len) in lengths.iter().enumerate() {
            let frame = start + i as u64 * l.frame_step as u64;
            let mut back = hw_structs::LINK_TERMINATE;
            if let Some((prev, prev_frame, wrapped)) = pending.take() {
                if prev_frame + 1 == frame {
                    back = s.pools.sitd.phys(prev);
                }
                else {
                    self.push_wrap_sitd(s, id, l, usb1, seq, prev, prev_frame, wrapped, nodes)?;
                }
            }
            let (smask, cmask, wrapped) = split_masks(l.uframe, len as usize, l.dir_in);
            let sitd = s.pools.sitd.alloc(&*self.platform)?;
            nodes.push(IsochNode::Sitd(sitd));
            {
                let m = s.pools.sitd.meta_mut(sitd);
                m.endpoint = Some(id);
                m.frame = frame;
                m.request = seq;
                m.first_packet = i as u32;
                m.packets = 1;
                m.span = if wrapped != 0 { 1 } else { 0 };
                m.uframes[0] = smask.trailing_zeros() as u8;
            }
            s.pools.sitd.fill(sitd, &SitdFill {
                dev_addr: l.dev_addr,
                endpt: l.endpt,
                dir_in: l.dir_in,
                hub_addr: usb1.hub_addr,
                hub_port: usb1.hub_port,
                smask,
                cmask,
                buffer: buffer.slice(ofs, len as usize),
                ioc: i + 1 == n,
                back,
                });
            if wrapped != 0 {
                pending = Some((sitd, frame, wrapped));
            }
            ofs += len as usize;
        }
        if let Some((prev, prev_frame, wrapped)) = pending {
            self.push_wrap_sitd(s, id, l, usb1, seq, prev, prev_frame, wrapped, nodes)?;
        }
        Ok(start + n as u64 * l.frame_step as u64)
    }

    fn push_wrap_sitd(&self, s: &mut Schedule, id: EndpointId, l: &StreamLayout, usb1: Usb1, seq: u64, prev: SitdId, prev_frame: u64, wrapped: u8, nodes: &mut Vec<IsochNode>) -> Result<(), Error>
    {
        let sitd = s.pools.sitd.alloc(&*self.platform)?;
        nodes.push(IsochNode::Sitd(sitd));
        {
            let m = s.pools.sitd.meta_mut(sitd);
            m.endpoint = Some(id);
            m.frame = prev_frame + 1;
            m.request = seq;
            m.packets = 0;
        }
        let back = s.pools.sitd.phys(prev);
        s.pools.sitd.fill(sitd, &SitdFill {
            dev_addr: l.dev_addr,
            endpt: l.endpt,
            dir_in: l.dir_in,
            hub_addr: usb1.hub_addr,
            hub_port: usb1.hub_port,
            smask: 0,
            cmask: wrapped,
            buffer: DmaBuffer::EMPTY,
            ioc: false,
            back,
            });
        Ok( () )
    }

    /// Move to-do descriptors whose frame is inside the scheduling window into the frame list
    ///
    /// Anything that is already inside the keep-away window is retired as `TooLate`.
    pub(crate) fn isoch_admit(&self, s: &mut Schedule, current: u64)
    {
        let window = self.config.isoch_window(self.keep_away) as u64;
        let keep_away = self.keep_away as u64;
        let now = self.platform.monotonic_us();
        for id in s.endpoints.isoch_ids() {
            loop
            {
                let node = match s.endpoints.isoch(id)
                    {
                    Ok(ep) if !ep.aborting => match ep.todo.front()
                        {
                        Some(&n) => n,
                        None => break,
                        },
                    _ => break,
                    };
                let frame = s.pools.isoch_meta(node).frame;
                if frame < current + keep_away {
                    s.endpoints.isoch_mut(id).map(|ep| ep.todo.pop_front()).ok();
                    log_debug!("isoch_admit({:?}): {:?} for frame {} missed (now {})", id, node, frame, current);
                    self.isoch_drop_late(s, id, node, now);
                }
                else if frame < current + window {
                    s.endpoints.isoch_mut(id).map(|ep| ep.todo.pop_front()).ok();
                    s.periodic.insert_isoch(&mut s.pools, (frame % PERIODIC_SIZE as u64) as usize, node);
                    if let Ok(ep) = s.endpoints.isoch_mut(id) {
                        ep.scheduled += 1;
                    }
                }
                else {
                    break;
                }
            }
        }
    }

    /// Retire a to-do descriptor that can no longer be scheduled in time
    fn isoch_drop_late(&self, s: &mut Schedule, id: EndpointId, node: IsochNode, now: u64)
    {
        let (frame, span) = {
            let m = s.pools.isoch_meta(node);
            (m.frame, m.span)
            };
        let phys = match node
            {
            IsochNode::Sitd(i) => s.pools.sitd.phys(i),
            IsochNode::Itd(i) => s.pools.itd.phys(i),
            };
        self.isoch_retire(s, node, TransferError::TooLate, ReleaseGate::Now, now);
        if span == 0 {
            return ;
        }
        // Whatever points back at this descriptor from the next frame
        let next = match s.endpoints.isoch(id).ok().and_then(|ep| ep.todo.front().copied())
            {
            Some(n) if s.pools.isoch_meta(n).frame == frame + 1 => n,
            _ => return,
            };
        if s.pools.isoch_meta(next).packets == 0 {
            s.endpoints.isoch_mut(id).map(|ep| ep.todo.pop_front()).ok();
            self.isoch_retire(s, next, TransferError::TooLate, ReleaseGate::Now, now);
        }
        else if let IsochNode::Sitd(i) = next {
            let d = s.pools.sitd.get(i);
            if d.back.get() == phys {
                d.back.set(hw_structs::LINK_TERMINATE);
            }
        }
    }

    /// Record the outcome of a descriptor's packets and release it
    ///
    /// Packets still marked active are reported as `unrun`. Completed requests (in submission
    /// order) are queued for delivery.
    pub(crate) fn isoch_retire(&self, s: &mut Schedule, node: IsochNode, unrun: TransferError, gate: ReleaseGate, now: u64)
    {
        let (endpoint, seq, first, count, uframes, retired_us, linked) = {
            let m = s.pools.isoch_meta(node);
            (m.endpoint, m.request, m.first_packet as usize, m.packets as usize, m.uframes, m.retired_us, m.linked)
            };
        let timestamp_us = if retired_us != 0 { retired_us } else { now };
        let ep = match endpoint
            {
            Some(id) => s.endpoints.isoch_mut(id).ok(),
            None => None,
            };
        if let Some(ep) = ep {
            if linked {
                ep.scheduled = ep.scheduled.saturating_sub(1);
            }
            if count > 0 {
                let dir_in = ep.layout.dir_in;
                match ep.requests.iter_mut().find(|r| r.seq == seq)
                {
                Some(req) => {
                    for j in 0 .. count {
                        let p = &mut req.packets[first + j];
                        let (actual_len, status) = packet_status(&s.pools, node, j, &uframes, p.actual_len, dir_in, unrun);
                        *p = IsochPacketResult { actual_len, status, timestamp_us };
                    }
                    req.remaining = req.remaining.saturating_sub(1);
                    },
                None => log_error!("BUG: isoch_retire({:?}): request {} not found", node, seq),
                }
                while ep.requests.front().map(|r| r.remaining == 0).unwrap_or(false) {
                    if let Some(mut r) = ep.requests.pop_front() {
                        if let Some(cb) = r.callback.take() {
                            s.deliveries.push(Delivery::Isoch(cb, IsochResult { start_frame: r.start_frame, packets: r.packets }));
                        }
                    }
                }
            }
        }
        s.release_gated(DeferredItem::Node(node), gate);
    }

    /// Cancel everything queued on an isochronous endpoint
    ///
    /// Rejected with `Busy` until the previous abort's completions have been delivered. With `deleting`
    /// set the endpoint is removed once they have, including when another abort is already running.
    pub(crate) fn isoch_abort(&self, id: EndpointId, deleting: bool) -> Result<(), Error>
    {
        {
            let mut s = self.schedule.lock();
            let ep = s.endpoints.isoch_mut(id)?;
            // Flagged under the same lock that `isoch_abort_done` checks it under
            if deleting {
                ep.deleting = true;
            }
            if ep.aborting {
                return if deleting { Ok( () ) } else { Err(Error::Busy) };
            }
            // Blocks admission and new submissions
            ep.aborting = true;
        }
        // A filter pass may be half way through the frame list
        while self.filter_active.load(Ordering::Acquire) {
            ::core::hint::spin_loop();
        }

        let now = self.platform.monotonic_us();
        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let current = self.frame_number_64();
        // Descriptors the filter stage has already retired
        self.drain_done(s);

        let todo: Vec<_> = s.endpoints.isoch_mut(id)?.todo.drain(..).collect();
        let n_todo = todo.len();
        for node in todo {
            self.isoch_retire(s, node, TransferError::Cancelled, ReleaseGate::Now, now);
        }
        let mut n_linked = 0;
        for slot in 0 .. PERIODIC_SIZE {
            let mine: Vec<IsochNode> = s.periodic.iter_slot(&s.pools, slot)
                .filter_map(|l| l.as_isoch())
                .filter(|&n| s.pools.isoch_meta(n).endpoint == Some(id))
                .collect();
            for node in mine {
                s.periodic.unlink(&mut s.pools, slot, node.into());
                self.isoch_retire(s, node, TransferError::Cancelled, ReleaseGate::Frame(current), now);
                n_linked += 1;
            }
        }

        let ep = s.endpoints.isoch_mut(id)?;
        if ep.scheduled != 0 || !ep.requests.is_empty() {
            log_error!("BUG: isoch_abort({:?}): {} scheduled, {} requests left", id, ep.scheduled, ep.requests.len());
            ep.scheduled = 0;
        }
        for mut r in ep.requests.drain(..) {
            if let Some(cb) = r.callback.take() {
                s.deliveries.push(Delivery::Isoch(cb, IsochResult { start_frame: r.start_frame, packets: r.packets }));
            }
        }
        ep.first_available_frame = None;
        s.deliveries.push(Delivery::AbortDone(id));
        log_debug!("isoch_abort({:?}): {} pending, {} linked", id, n_todo, n_linked);
        Ok( () )
    }

    /// Abort, then remove the endpoint once the abort's completions have been delivered
    pub(crate) fn isoch_delete(&self, id: EndpointId) -> Result<(), Error>
    {
        self.isoch_abort(id, true)
    }

    /// Action stage: the completions queued by an abort have all been delivered
    pub(crate) fn isoch_abort_done(&self, id: EndpointId)
    {
        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let finish = match s.endpoints.isoch_mut(id)
            {
            Ok(ep) => {
                ep.aborting = false;
                ep.deleting
                },
            Err(_) => return,
            };
        if finish {
            if let Some(Endpoint::Isoch(ep)) = s.endpoints.remove(id) {
                s.periodic.bandwidth.release(&ep.reservation);
                log_debug!("isoch_abort_done({:?}): {:?} removed", id, ep.spec.addr);
            }
        }
    }
}
