//! Queue head endpoints (control, bulk, interrupt) and transfer submission
//!
//! Every queue head ends on an inactive "dummy" qTD. A new transfer is written into the current
//! dummy (activated last) followed by freshly allocated descriptors and a new dummy, so the
//! controller never sees a partially built chain.
use ::alloc::collections::VecDeque;
use ::alloc::vec::Vec;
use crate::desc_pools::{QhId,TdId,TdPool,TdFill,QhProgress};
use crate::error::Error;
use crate::hw_structs::{self,Pid};
use crate::platform::DmaBuffer;
use crate::status::{TransferCallback,TransferError};
use crate::usb_host::{EndpointSpec,make_endpoint_spec};
use crate::{Schedule,Endpoint,EndpointId,DeferredItem,ReleaseGate};

/// Per-transfer timeout overrides
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct TransferOptions
{
    /// Complete within this many milliseconds or fail with `Timeout`
    pub timeout_ms: Option<u32>,
    /// Fail with `Timeout` if no data moves for this many milliseconds (`Some(0)` disables the endpoint default)
    pub no_data_timeout_ms: Option<u32>,
}

pub(crate) enum QueueKind
{
    Control,
    Bulk,
    Interrupt(crate::host_interrupt::IntrSchedule),
}

/// A transfer queued on a queue head
pub(crate) struct QueuedTransfer
{
    pub first: TdId,
    /// Final descriptor (carries the completion)
    pub last: TdId,
    pub is_control: bool,
    pub deadline_us: Option<u64>,
    pub no_data_us: Option<u64>,
    /// Bus errors re-armed so far
    pub retries: u8,
}
impl QueuedTransfer
{
    /// Data bytes moved so far (setup and status stages don't count)
    pub fn completed_bytes(&self, pool: &TdPool) -> usize {
        pool.chain(self.first, self.last)
            .filter(|&td| pool.meta(td).pid != Some(Pid::Setup))
            .map(|td| pool.transferred(td))
            .sum()
    }
}

pub(crate) struct QueueEndpoint
{
    pub spec: EndpointSpec,
    pub kind: QueueKind,
    pub dir_in: bool,
    pub qh: QhId,
    /// Inactive descriptor at the end of the chain
    pub dummy: TdId,
    pub transfers: VecDeque<QueuedTransfer>,
    /// On its schedule (always true for interrupt endpoints)
    pub linked: bool,
    /// Rendezvous still owed from the last async unlink, the controller may have the QH cached until it opens
    pub unlink_gate: ReleaseGate,
    /// Overlay is held halted (after an abort), cleared by the next submission
    pub halted: bool,
    /// Overlay snapshot from the last housekeeping pass
    pub last_progress: Option<QhProgress>,
    pub last_progress_us: u64,
    /// Time the transfer queue last became empty
    pub idle_since_us: u64,
}
impl QueueEndpoint
{
    pub fn new(spec: EndpointSpec, kind: QueueKind, dir_in: bool, qh: QhId, dummy: TdId, now: u64) -> Self {
        QueueEndpoint {
            spec,
            kind,
            dir_in,
            qh,
            dummy,
            transfers: VecDeque::new(),
            linked: false,
            unlink_gate: ReleaseGate::Now,
            halted: false,
            last_progress: None,
            last_progress_us: now,
            idle_since_us: now,
        }
    }
    /// Control and bulk endpoints live on the async schedule
    pub fn is_async(&self) -> bool {
        match self.kind
        {
        QueueKind::Interrupt(_) => false,
        _ => true,
        }
    }
}

/// Split a buffer into qTD-sized pieces, with every piece but the last a whole number of packets
pub(crate) fn split_buffer(buffer: DmaBuffer, max_packet_size: usize) -> Vec<DmaBuffer>
{
    let mut rv = Vec::new();
    if buffer.len == 0 {
        rv.push(buffer);
        return rv;
    }
    let mut ofs = 0;
    while ofs < buffer.len {
        let phys = buffer.phys + ofs as u64;
        let room = hw_structs::QTD_MAX_BYTES - (phys & 0xFFF) as usize;
        let rem = buffer.len - ofs;
        let len = if rem <= room { rem } else { room - room % max_packet_size };
        rv.push(buffer.slice(ofs, len));
        ofs += len;
    }
    rv
}

fn check_max_packet(spec: &EndpointSpec, hs_max: u16, fs_max: u16, ls_max: u16) -> Result<(), Error> {
    let max = match spec.usb1
        {
        None => hs_max,
        Some(u) if u.is_fullspeed => fs_max,
        Some(_) => ls_max,
        };
    if spec.max_packet_size == 0 || spec.max_packet_size > max {
        Err(Error::InvalidArgument("max packet size"))
    }
    else {
        Ok( () )
    }
}

impl super::HostInner
{
    /// Allocate a queue head and its initial dummy descriptor
    pub(crate) fn alloc_qh_pair(&self, s: &mut Schedule) -> Result<(QhId, TdId), Error> {
        let qh = s.pools.qh.alloc(&*self.platform)?;
        match s.pools.td.alloc(&*self.platform)
        {
        Ok(td) => {
            s.pools.td.meta_mut(td).qh = Some(qh);
            Ok( (qh, td) )
            },
        Err(e) => {
            s.pools.qh.release(qh);
            Err(e)
            },
        }
    }

    fn create_async(&self, spec: EndpointSpec, kind: QueueKind, dir_in: bool) -> Result<EndpointId, Error>
    {
        let is_control = match kind { QueueKind::Control => true, _ => false };
        let now = self.platform.monotonic_us();
        let mut s = self.schedule.lock();
        let (qh, dummy) = self.alloc_qh_pair(&mut s)?;
        let (endpoint_id, endpoint_ext) = make_endpoint_spec(&spec, is_control);
        let dummy_phys = s.pools.td.phys(dummy);
        s.pools.qh.init_endpoint(qh, endpoint_id, endpoint_ext, dummy_phys);
        let id = s.endpoints.insert(Endpoint::Queue(QueueEndpoint::new(spec, kind, dir_in, qh, dummy, now)));
        s.pools.qh.meta_mut(qh).endpoint = Some(id);
        if let Err(e) = self.async_link(&mut s, qh) {
            s.endpoints.remove(id);
            s.pools.td.release(dummy);
            s.pools.qh.release(qh);
            return Err(e);
        }
        s.endpoints.queue_mut(id)?.linked = true;
        log_debug!("create_async({:?}): {:?} {:?}", spec.addr, id, qh);
        Ok(id)
    }

    pub fn create_control(&self, spec: EndpointSpec) -> Result<EndpointId, Error>
    {
        check_max_packet(&spec, 64, 64, 8)?;
        self.create_async(spec, QueueKind::Control, false)
    }
    pub fn create_bulk(&self, spec: EndpointSpec, dir_in: bool) -> Result<EndpointId, Error>
    {
        if let Some(crate::usb_host::Usb1 { is_fullspeed: false, .. }) = spec.usb1 {
            return Err(Error::InvalidArgument("low-speed bulk endpoint"));
        }
        check_max_packet(&spec, 512, 64, 0)?;
        self.create_async(spec, QueueKind::Bulk, dir_in)
    }

    pub(crate) fn check_buffer(&self, buffer: &DmaBuffer) -> Result<(), Error> {
        if !self.is_64bit && buffer.phys + buffer.len as u64 > 1 << 32 {
            return Err(Error::InvalidArgument("buffer above 4GiB"));
        }
        Ok( () )
    }

    /// Queue a control request (SETUP, optional DATA, STATUS)
    pub fn submit_control(&self, id: EndpointId, setup: DmaBuffer, data: DmaBuffer, data_in: bool, opts: TransferOptions, complete: TransferCallback) -> Result<(), Error>
    {
        if setup.len != 8 {
            return Err(Error::InvalidArgument("setup packet length"));
        }
        self.check_buffer(&setup)?;
        self.check_buffer(&data)?;
        let mps = {
            let s = self.schedule.lock();
            let ep = s.endpoints.queue(id)?;
            match ep.kind
            {
            QueueKind::Control => {},
            _ => return Err(Error::InvalidArgument("not a control endpoint")),
            }
            ep.spec.max_packet_size as usize
            };

        let mut fills = Vec::new();
        fills.push(TdFill { pid: Pid::Setup, buffer: setup, toggle: Some(false), ioc: false });
        if data.len > 0 {
            let pid = if data_in { Pid::In } else { Pid::Out };
            let mut toggle = true;
            for piece in split_buffer(data, mps) {
                fills.push(TdFill { pid, buffer: piece, toggle: Some(toggle), ioc: false });
                // Non-final pieces are whole packets
                if (piece.len / mps) % 2 == 1 {
                    toggle = !toggle;
                }
            }
        }
        let status_pid = if data.len > 0 && data_in { Pid::Out } else { Pid::In };
        fills.push(TdFill { pid: status_pid, buffer: DmaBuffer::EMPTY, toggle: Some(true), ioc: true });
        self.queue_transfer(id, fills, true, opts, complete)
    }

    /// Queue a bulk or interrupt transfer in the endpoint's direction
    pub fn submit_data(&self, id: EndpointId, buffer: DmaBuffer, opts: TransferOptions, complete: TransferCallback) -> Result<(), Error>
    {
        self.check_buffer(&buffer)?;
        let (mps, pid) = {
            let s = self.schedule.lock();
            let ep = s.endpoints.queue(id)?;
            if let QueueKind::Control = ep.kind {
                return Err(Error::InvalidArgument("control endpoint"));
            }
            (ep.spec.max_packet_size as usize, if ep.dir_in { Pid::In } else { Pid::Out })
            };
        let mut fills: Vec<_> = split_buffer(buffer, mps).into_iter()
            .map(|b| TdFill { pid, buffer: b, toggle: None, ioc: false })
            .collect();
        if let Some(f) = fills.last_mut() {
            f.ioc = true;
        }
        self.queue_transfer(id, fills, false, opts, complete)
    }

    fn queue_transfer(&self, id: EndpointId, fills: Vec<TdFill>, is_control: bool, opts: TransferOptions, complete: TransferCallback) -> Result<(), Error>
    {
        let now = self.platform.monotonic_us();
        let mut lh = self.schedule.lock();
        let s = &mut *lh;
        let (qh, old_dummy, is_async, linked, default_no_data) = {
            let ep = s.endpoints.queue(id)?;
            let default_no_data = match ep.kind
                {
                QueueKind::Control => self.config.control_no_data_timeout_ms,
                QueueKind::Bulk => self.config.bulk_no_data_timeout_ms,
                QueueKind::Interrupt(_) => 0,
                };
            (ep.qh, ep.dummy, ep.is_async(), ep.linked, default_no_data)
            };

        // The old dummy carries the first descriptor, so `n` new ones (the last becomes the new dummy)
        let n = fills.len();
        let mut new = Vec::with_capacity(n);
        for _ in 0 .. n {
            match s.pools.td.alloc(&*self.platform)
            {
            Ok(td) => new.push(td),
            Err(e) => {
                log_warning!("queue_transfer({:?}): descriptor allocation failed", id);
                for td in new {
                    s.pools.td.release(td);
                }
                return Err(e);
                },
            }
        }
        if is_async && !linked {
            // Lazily put back on the async schedule, once the controller has let go of it
            let gate = s.endpoints.queue(id)?.unlink_gate;
            let res = if self.gate_open(gate) || (self.ring_doorbell().is_ok() && self.gate_open(gate)) {
                    self.async_link(s, qh)
                }
                else {
                    log_warning!("queue_transfer({:?}): {:?} still owed {:?}, not re-linking", id, qh, gate);
                    Err(Error::Timeout("async advance doorbell"))
                };
            if let Err(e) = res {
                for td in new {
                    s.pools.td.release(td);
                }
                return Err(e);
            }
            let ep = s.endpoints.queue_mut(id)?;
            ep.linked = true;
            ep.unlink_gate = ReleaseGate::Now;
            s.inactive.retain(|&e| e != id);
            log_debug!("queue_transfer({:?}): re-linked inactive {:?}", id, qh);
        }

        let new_dummy = new[n-1];
        let mut tds = Vec::with_capacity(n);
        tds.push(old_dummy);
        tds.extend_from_slice(&new[.. n-1]);
        let status_td = if is_control { Some(tds[n-1]) } else { None };

        let dummy_phys = s.pools.td.phys(new_dummy);
        let mut tokens = Vec::with_capacity(n);
        for i in 0 .. n {
            let next = if i + 1 < n { tds[i+1] } else { new_dummy };
            let is_data = !is_control || (i != 0 && i != n-1);
            // Short packets skip to the status stage (control) or the next transfer
            let alt = match (fills[i].pid, is_data, status_td)
                {
                (Pid::In, true, Some(st)) => s.pools.td.phys(st),
                (Pid::In, true, None) => dummy_phys,
                _ => hw_structs::LINK_TERMINATE,
                };
            let next_phys = s.pools.td.phys(next);
            tokens.push( s.pools.td.fill(tds[i], &fills[i], next_phys, alt) );
            let m = s.pools.td.meta_mut(tds[i]);
            m.qh = Some(qh);
            m.next = Some(next);
        }
        s.pools.td.meta_mut(tds[n-1]).completion = Some(complete);
        s.pools.td.meta_mut(new_dummy).qh = Some(qh);
        // Activate back to front, the old dummy (already visible to the controller) last
        for i in (0 .. n).rev() {
            s.pools.td.activate(tds[i], tokens[i]);
        }

        let no_data_ms = opts.no_data_timeout_ms.unwrap_or(default_no_data);
        let t = QueuedTransfer {
            first: old_dummy,
            last: tds[n-1],
            is_control,
            deadline_us: opts.timeout_ms.map(|ms| now + ms as u64 * 1000),
            no_data_us: if no_data_ms > 0 { Some(no_data_ms as u64 * 1000) } else { None },
            retries: 0,
            };
        let ep = s.endpoints.queue_mut(id)?;
        ep.dummy = new_dummy;
        if ep.transfers.is_empty() {
            ep.last_progress = None;
            ep.last_progress_us = now;
        }
        ep.transfers.push_back(t);
        if ep.halted {
            ep.halted = false;
            let first_phys = s.pools.td.phys(old_dummy);
            s.pools.qh.reset_overlay(qh, first_phys, true);
        }
        if is_async {
            s.async_list.outstanding += 1;
            self.async_update_enable(s);
        }
        log_trace!("queue_transfer({:?}): {} TDs on {:?}", id, n, qh);
        Ok( () )
    }

    /// Cancel everything queued on an endpoint
    ///
    /// Completions (as `Cancelled`) are delivered by the next action stage pass.
    pub fn abort_endpoint(&self, id: EndpointId) -> Result<(), Error>
    {
        let is_isoch = match self.schedule.lock().endpoints.get(id)
            {
            Some(Endpoint::Queue(_)) => false,
            Some(Endpoint::Isoch(_)) => true,
            None => return Err(Error::UnknownEndpoint),
            };
        if is_isoch {
            self.isoch_abort(id, false)
        }
        else {
            let mut s = self.schedule.lock();
            self.halt_and_unlink_for_abort(&mut s, id, false, TransferError::Cancelled, false)
        }
    }

    /// Remove an endpoint, cancelling anything queued on it
    pub fn delete_endpoint(&self, id: EndpointId) -> Result<(), Error>
    {
        let is_isoch = match self.schedule.lock().endpoints.get(id)
            {
            Some(Endpoint::Queue(_)) => false,
            Some(Endpoint::Isoch(_)) => true,
            None => return Err(Error::UnknownEndpoint),
            };
        if is_isoch {
            return self.isoch_delete(id);
        }
        let mut s = self.schedule.lock();
        let is_async = s.endpoints.queue(id)?.is_async();
        if !is_async {
            self.intr_unlink(&mut s, id)?;
        }
        self.halt_and_unlink_for_abort(&mut s, id, true, TransferError::Cancelled, false)?;
        s.inactive.retain(|&e| e != id);
        s.endpoints.remove(id);
        log_debug!("delete_endpoint({:?})", id);
        Ok( () )
    }

    /// Release a chain of descriptors (and hand back the completion, if any)
    pub(crate) fn release_chain(s: &mut Schedule, first: TdId, last: TdId, gate: ReleaseGate) -> Option<TransferCallback> {
        let tds: Vec<_> = s.pools.td.chain(first, last).collect();
        let mut cb = None;
        for td in tds {
            if let Some(c) = s.pools.td.meta_mut(td).completion.take() {
                cb = Some(c);
            }
            s.release_gated(DeferredItem::Td(td), gate);
        }
        cb
    }
}
