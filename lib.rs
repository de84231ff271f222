// "Tifflin" Kernel - EHCI USB driver
// - By John Hodge (Mutabah / thePowersGang)
//
// Modules/usb_ehci/lib.rs
//! Extensible Host Controller Interface (EHCI) driver - transfer scheduling core
#![cfg_attr(not(test), no_std)]
extern crate alloc;

use ::core::sync::atomic::{Ordering,AtomicBool,AtomicU32};
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use ::alloc::vec::Vec;
use ::spinning_top::Spinlock;

#[macro_use]
mod logging;

pub mod error;
pub mod config;
pub mod platform;
pub mod hw_regs;
mod hw_structs;
mod desc_pools;
pub mod status;

mod host_queuemgmt;
mod host_periodic;
mod host_interrupt;
mod host_isoch;
mod host_transfer;
mod host_irq;
mod host_completion;
mod host_monitor;
pub mod usb_host;

#[cfg(test)]
mod test_support;

pub use self::error::Error;
pub use self::config::{Config,Quirks};
pub use self::platform::{Platform,DmaRegion,DmaBuffer};
pub use self::hw_regs::IoBinding;
pub use self::status::{TransferError,TransferResult,IsochResult,IsochPacketResult};
pub use self::host_irq::FilterResult;
pub use self::host_transfer::TransferOptions;
pub use self::usb_host::UsbHost;

/// Number of entries in the periodic frame list
pub const PERIODIC_SIZE: usize = 1024;

/// Handle to an endpoint within a controller
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct EndpointId(u32);
impl EndpointId {
    fn idx(&self) -> usize {
        self.0 as usize
    }
}

pub(crate) enum Endpoint
{
    /// Control, bulk, or interrupt (queue head based)
    Queue(host_transfer::QueueEndpoint),
    Isoch(host_isoch::IsochEndpoint),
}

/// Endpoint slab, indexed by [EndpointId]
#[derive(Default)]
pub(crate) struct EndpointSlab(Vec<Option<Endpoint>>);
impl EndpointSlab
{
    fn insert(&mut self, ep: Endpoint) -> EndpointId {
        if let Some(i) = self.0.iter().position(|e| e.is_none()) {
            self.0[i] = Some(ep);
            EndpointId(i as u32)
        }
        else {
            self.0.push(Some(ep));
            EndpointId(self.0.len() as u32 - 1)
        }
    }
    fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        self.0.get_mut(id.idx()).and_then(|e| e.take())
    }
    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.0.get(id.idx()).and_then(|e| e.as_ref())
    }
    pub fn queue(&self, id: EndpointId) -> Result<&host_transfer::QueueEndpoint, Error> {
        match self.get(id)
        {
        Some(Endpoint::Queue(q)) => Ok(q),
        _ => Err(Error::UnknownEndpoint),
        }
    }
    pub fn queue_mut(&mut self, id: EndpointId) -> Result<&mut host_transfer::QueueEndpoint, Error> {
        match self.0.get_mut(id.idx()).and_then(|e| e.as_mut())
        {
        Some(Endpoint::Queue(q)) => Ok(q),
        _ => Err(Error::UnknownEndpoint),
        }
    }
    pub fn isoch(&self, id: EndpointId) -> Result<&host_isoch::IsochEndpoint, Error> {
        match self.get(id)
        {
        Some(Endpoint::Isoch(e)) => Ok(e),
        _ => Err(Error::UnknownEndpoint),
        }
    }
    pub fn isoch_mut(&mut self, id: EndpointId) -> Result<&mut host_isoch::IsochEndpoint, Error> {
        match self.0.get_mut(id.idx()).and_then(|e| e.as_mut())
        {
        Some(Endpoint::Isoch(e)) => Ok(e),
        _ => Err(Error::UnknownEndpoint),
        }
    }
    /// Ids of all live endpoints
    pub fn ids(&self) -> Vec<EndpointId> {
        self.0.iter().enumerate().filter(|(_,e)| e.is_some()).map(|(i,_)| EndpointId(i as u32)).collect()
    }
    pub fn isoch_ids(&self) -> Vec<EndpointId> {
        self.0.iter().enumerate().filter(|(_,e)| matches!(e, Some(Endpoint::Isoch(_)))).map(|(i,_)| EndpointId(i as u32)).collect()
    }
    pub fn queue_ids(&self) -> Vec<EndpointId> {
        self.0.iter().enumerate().filter(|(_,e)| matches!(e, Some(Endpoint::Queue(_)))).map(|(i,_)| EndpointId(i as u32)).collect()
    }
}

/// A descriptor waiting for the controller to stop referencing it
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub(crate) enum DeferredItem
{
    Qh(desc_pools::QhId),
    Td(desc_pools::TdId),
    Node(desc_pools::IsochNode),
}
/// Condition under which an unlinked descriptor can be released
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub(crate) enum ReleaseGate
{
    /// Controller can't be referencing it (schedule stopped, or the doorbell was answered)
    Now,
    /// After a doorbell rendezvous later than the given epoch completes (or the async schedule stops)
    Doorbell(u32),
    /// Once the frame cursor has moved past this frame
    Frame(u64),
}
impl ReleaseGate
{
    pub fn is_open(&self, frame: u64, doorbell_epoch: u32, async_idle: bool) -> bool {
        match *self
        {
        ReleaseGate::Now => true,
        ReleaseGate::Doorbell(e) => async_idle || (doorbell_epoch.wrapping_sub(e) as i32) > 0,
        ReleaseGate::Frame(f) => frame > f,
        }
    }
}
struct Deferred
{
    item: DeferredItem,
    gate: ReleaseGate,
}

/// Completion waiting to be delivered by the action stage
pub(crate) enum Delivery
{
    Transfer(status::TransferCallback, status::TransferResult),
    Isoch(status::IsochCallback, status::IsochResult),
    /// All completions from an isochronous abort have been delivered
    AbortDone(EndpointId),
}

/// All schedule state, behind one lock
pub(crate) struct Schedule
{
    pub pools: desc_pools::Pools,
    pub async_list: host_queuemgmt::AsyncList,
    pub periodic: host_periodic::PeriodicTable,
    pub endpoints: EndpointSlab,
    /// Async endpoints moved off the live schedule for being idle
    pub inactive: Vec<EndpointId>,
    deferred: Vec<Deferred>,
    pub deliveries: Vec<Delivery>,
    /// Frame number the periodic scan has processed up to
    pub last_scanned_frame: u64,
}
impl Schedule
{
    fn new(pages_per_block: usize, periodic: host_periodic::PeriodicTable) -> Self {
        Schedule {
            pools: desc_pools::Pools::new(pages_per_block),
            async_list: Default::default(),
            periodic,
            endpoints: Default::default(),
            inactive: Vec::new(),
            deferred: Vec::new(),
            deliveries: Vec::new(),
            last_scanned_frame: 0,
        }
    }

    fn release_item(&mut self, item: DeferredItem) {
        match item
        {
        DeferredItem::Qh(id) => self.pools.qh.release(id),
        DeferredItem::Td(id) => self.pools.td.release(id),
        DeferredItem::Node(n) => self.pools.release_node(n),
        }
    }
    /// Release now, or park until the gate opens
    pub fn release_gated(&mut self, item: DeferredItem, gate: ReleaseGate) {
        match gate
        {
        ReleaseGate::Now => self.release_item(item),
        _ => {
            log_trace!("release_gated: {:?} until {:?}", item, gate);
            self.deferred.push(Deferred { item, gate });
            },
        }
    }
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
    /// Something is held until the next doorbell rendezvous
    pub fn waiting_on_doorbell(&self) -> bool {
        self.deferred.iter().any(|d| match d.gate { ReleaseGate::Doorbell(_) => true, _ => false })
    }

    /// Release everything whose gate has opened
    pub fn process_deferred(&mut self, frame: u64, doorbell_epoch: u32, async_idle: bool) {
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].gate.is_open(frame, doorbell_epoch, async_idle) {
                let d = self.deferred.swap_remove(i);
                self.release_item(d.item);
            }
            else {
                i += 1;
            }
        }
    }

    /// UNSAFE: Controller must be halted
    unsafe fn destroy(&mut self, platform: &dyn Platform) {
        let deferred: Vec<_> = self.deferred.drain(..).collect();
        for d in deferred {
            self.release_item(d.item);
        }
        self.pools.destroy(platform);
        self.periodic.destroy(platform);
    }
}

pub struct HostInner
{
    regs: hw_regs::Regs,
    platform: Box<dyn Platform>,
    config: Config,
    is_64bit: bool,
    /// Effective keep-away window (frames)
    keep_away: u32,
    nports: u8,

    schedule: Spinlock<Schedule>,
    /// Isochronous descriptors retired by the filter stage
    done: host_irq::DoneStack,

    // - Filter/action handoff
    filter_active: AtomicBool,
    scan_pending: AtomicBool,
    rollovers: AtomicU32,
    doorbell_epoch: AtomicU32,
    port_update: AtomicU32,
    fatal: AtomicBool,
}
impl HostInner
{
    /// Interrupts handled by the filter stage (the doorbell is polled, so isn't enabled)
    const INTERRUPTS: u32 = hw_regs::USBINTR_IOC | hw_regs::USBINTR_Error | hw_regs::USBINTR_PortChange
        | hw_regs::USBINTR_FrameRollover | hw_regs::USBINTR_HostSystemError;

    /// Construct the driver state (the hardware isn't touched beyond reading the capability registers)
    pub fn new(io: Box<dyn IoBinding>, platform: Box<dyn Platform>, config: Config) -> Result<Arc<Self>, Error>
    {
        // SAFE: The caller passes an EHCI register window
        let regs = unsafe { hw_regs::Regs::new(io) };
        let revision = regs.hci_version();
        let nports = regs.n_ports();
        let is_64bit = regs.is_64bit();
        let keep_away = config.keep_away_frames.max(regs.ist_frames() + 1);
        log_notice!("EHCI version {:#x} w/ {} ports{}, keep-away {} frames",
            revision, nports, if is_64bit { " (64-bit)" } else { "" }, keep_away);

        let periodic = host_periodic::PeriodicTable::new(&*platform)?;
        let schedule = Schedule::new(config.pages_per_block, periodic);

        Ok(Arc::new(HostInner {
            regs,
            platform,
            config,
            is_64bit,
            keep_away,
            nports,
            schedule: Spinlock::new(schedule),
            done: Default::default(),
            filter_active: AtomicBool::new(false),
            scan_pending: AtomicBool::new(false),
            rollovers: AtomicU32::new(0),
            doorbell_epoch: AtomicU32::new(0),
            port_update: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            }))
    }

    pub fn nports(&self) -> u8 {
        self.nports
    }
    pub(crate) fn keep_away(&self) -> u32 {
        self.keep_away
    }

    fn wait_for(&self, max_polls: u32, cond: impl FnMut() -> bool) -> Result<(), platform::TimedOut> {
        platform::wait_for(&*self.platform, self.config.rendezvous_poll_us, max_polls, cond)
    }

    /// Bring the controller up: take ownership, reset, and start the periodic schedule
    pub fn initialize_hardware(&self) -> Result<(), Error>
    {
        use hw_regs::*;
        self.bios_handoff();

        // SAFE: Register accesses are correct
        unsafe {
            // Halt
            let cmd = self.regs.read_op(OpReg::UsbCmd);
            self.regs.write_op(OpReg::UsbCmd, cmd & !(USBCMD_Run|USBCMD_AsyncEnable|USBCMD_PeriodicEnable|USBCMD_IAAD));
            if self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & USBSTS_HcHalted != 0).is_err() {
                log_error!("Controller failed to halt");
                return Err(Error::Fatal("halt"));
            }
            // Reset the controller
            self.regs.write_op(OpReg::UsbCmd, USBCMD_HCReset);
            if self.wait_for(self.config.reset_max_polls(), || self.regs.read_op(OpReg::UsbCmd) & USBCMD_HCReset == 0).is_err() {
                log_error!("Controller failed to reset");
                return Err(Error::Fatal("reset"));
            }
            if self.is_64bit {
                self.regs.write_op(OpReg::CtrlDsSegment, 0);
            }
            // Set up interrupts
            self.regs.write_op(OpReg::UsbIntr, Self::INTERRUPTS);
            // Set addresses
            self.regs.write_op(OpReg::PeriodicListBase, self.schedule.lock().periodic.phys());
            // Enable controller (async schedule is started on demand)
            self.regs.write_op(OpReg::UsbCmd, /*interupt threshold*/ (0x08 << USBCMD_ITC_SHIFT) | USBCMD_PeriodicEnable | USBCMD_Run);
            if self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & USBSTS_HcHalted == 0).is_err() {
                log_error!("Controller failed to start");
                return Err(Error::Fatal("start"));
            }
            // Route all ports to the controller
            self.regs.write_op(OpReg::ConfigFlag, CONFIGFLAG_RouteToEhci);
        }
        self.rollovers.store(0, Ordering::SeqCst);
        self.schedule.lock().last_scanned_frame = 0;
        log_debug!("initialize_hardware: running");
        Ok( () )
    }

    /// Stop the controller and release all schedule memory
    ///
    /// Endpoints must have been deleted first.
    pub fn finalize_hardware(&self) -> Result<(), Error>
    {
        use hw_regs::*;
        // SAFE: Register accesses are correct
        unsafe {
            self.regs.write_op(OpReg::UsbIntr, 0);
            let cmd = self.regs.read_op(OpReg::UsbCmd);
            self.regs.write_op(OpReg::UsbCmd, cmd & !(USBCMD_AsyncEnable|USBCMD_PeriodicEnable));
            if self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & (USBSTS_AsyncEnabled|USBSTS_PeriodicEnabled) == 0).is_err() {
                log_warning!("finalize_hardware: schedules didn't stop");
            }
            self.regs.write_op(OpReg::UsbCmd, 0);
            if self.wait_for(self.config.rendezvous_max_polls, || self.regs.read_op(OpReg::UsbSts) & USBSTS_HcHalted != 0).is_err() {
                log_error!("Controller failed to halt");
                return Err(Error::Fatal("halt"));
            }
            self.regs.write_op(OpReg::UsbCmd, USBCMD_HCReset);
            if self.wait_for(self.config.reset_max_polls(), || self.regs.read_op(OpReg::UsbCmd) & USBCMD_HCReset == 0).is_err() {
                log_error!("Controller failed to reset");
                return Err(Error::Fatal("reset"));
            }
            self.regs.write_op(OpReg::ConfigFlag, 0);
        }
        let mut s = self.schedule.lock();
        let live = s.endpoints.ids().len();
        if live != 0 {
            log_warning!("finalize_hardware: {} endpoints still exist", live);
        }
        // SAFE: Controller is halted and reset
        unsafe { s.destroy(&*self.platform); }
        Ok( () )
    }

    /// Take ownership from the firmware (EHCI legacy support capability)
    fn bios_handoff(&self)
    {
        use hw_regs::*;
        let eecp = self.regs.eecp();
        if eecp < 0x40 {
            return ;
        }
        let legsup = match self.platform.read_pci_config(eecp)
            {
            Some(v) => v,
            None => return,
            };
        if legsup & 0xFF != USBLEGSUP_CapId {
            return ;
        }
        self.platform.write_pci_config(eecp, legsup | USBLEGSUP_OsOwned);
        if legsup & USBLEGSUP_BiosOwned != 0 {
            log_debug!("bios_handoff: firmware owns the controller, requesting");
            let released = self.wait_for(self.config.rendezvous_max_polls, || {
                self.platform.read_pci_config(eecp).map(|v| v & USBLEGSUP_BiosOwned == 0).unwrap_or(true)
                });
            if released.is_err() {
                log_warning!("bios_handoff: firmware didn't release the controller, taking it");
                self.platform.write_pci_config(eecp, (legsup & !USBLEGSUP_BiosOwned) | USBLEGSUP_OsOwned);
            }
        }
        // Disable legacy SMIs
        self.platform.write_pci_config(eecp + 4, 0);
    }

    /// Account for any frame list rollover that hasn't been counted yet
    fn latch_rollover(&self) {
        let f = self.regs.frame_index();
        let r = self.rollovers.load(Ordering::Acquire);
        if (f >> 10) & 1 != r & 1 {
            let _ = self.rollovers.compare_exchange(r, r.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Current frame number, extended to 64 bits
    pub fn frame_number_64(&self) -> u64 {
        let f = self.regs.frame_index() as u64;
        let r = self.rollovers.load(Ordering::Acquire) as u64;
        let mut v = r * PERIODIC_SIZE as u64 + (f & 0x3FF);
        // Bit 10 of the hardware frame tracks the rollover count, a mismatch means a rollover hasn't been counted yet
        if (f >> 10) & 1 != r & 1 {
            v += PERIODIC_SIZE as u64;
        }
        v
    }
    /// Current frame number (wraps)
    pub fn frame_number(&self) -> u32 {
        self.frame_number_64() as u32
    }

    /// Remaining high-speed periodic bandwidth (bytes) in the most loaded microframe
    pub fn available_isoch_bandwidth(&self) -> u32 {
        self.schedule.lock().periodic.bandwidth.available_hs()
    }

    /// Root hub ports that have changed since the last call (bitmask)
    pub fn take_port_changes(&self) -> u32 {
        self.port_update.swap(0, Ordering::SeqCst)
    }
    /// The controller reported a host system error (it will have halted)
    pub fn take_fatal(&self) -> bool {
        self.fatal.swap(false, Ordering::SeqCst)
    }

    fn async_idle(&self) -> bool {
        self.regs.read_op(hw_regs::OpReg::UsbSts) & hw_regs::USBSTS_AsyncEnabled == 0
    }
    fn gate_open(&self, gate: ReleaseGate) -> bool {
        gate.is_open(self.frame_number_64(), self.doorbell_epoch.load(Ordering::Acquire), self.async_idle())
    }
    /// Release deferred descriptors whose gates have opened
    fn run_deferred(&self, s: &mut Schedule) {
        let frame = self.frame_number_64();
        s.process_deferred(frame, self.doorbell_epoch.load(Ordering::Acquire), self.async_idle());
    }
}
