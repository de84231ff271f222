//! Simulated controller and host platform for the unit tests
use ::std::alloc::{alloc_zeroed,dealloc,Layout};
use ::std::collections::BTreeMap;
use ::std::ptr::NonNull;
use ::std::sync::Arc;
use ::spinning_top::Spinlock;
use crate::hw_regs::{self,OpReg,IoBinding};
use crate::platform::{Platform,DmaRegion,PAGE_SIZE};
use crate::{Config,HostInner};

const CAP_LENGTH: usize = 0x20;
const N_OPREGS: usize = OpReg::PortSc0 as usize + 16;

pub struct MockState
{
    pub hci_version: u16,
    pub hcsparams: u32,
    pub hccparams: u32,
    op: [u32; N_OPREGS],
    /// Controller never reports `HCHalted`
    pub halt_stuck: bool,
    /// `HCReset` never self-clears
    pub reset_stuck: bool,
    /// Controller answers the async advance doorbell
    pub doorbell_ack: bool,
    /// Number of upcoming `ASYNCLISTADDR` writes to drop
    pub drop_async_base_writes: u32,
    writes: Vec<(OpReg, u32)>,
}

/// Register-level model of an EHCI controller
///
/// Schedule status bits follow the command register immediately, and the doorbell is answered on write.
pub struct MockIo
{
    pub state: Spinlock<MockState>,
}
impl MockIo
{
    pub fn new(nports: u8) -> Arc<MockIo> {
        Arc::new(MockIo {
            state: Spinlock::new(MockState {
                hci_version: 0x100,
                hcsparams: nports as u32 & hw_regs::HCSPARAMS_NPorts_MASK,
                hccparams: 0,
                op: [0; N_OPREGS],
                halt_stuck: false,
                reset_stuck: false,
                doorbell_ack: true,
                drop_async_base_writes: 0,
                writes: Vec::new(),
                }),
            })
    }

    /// Current value of an operational register (as software would read it)
    pub fn op(&self, reg: OpReg) -> u32 {
        self.read_32(CAP_LENGTH + reg as usize * 4)
    }
    /// All operational register writes so far (port registers excluded)
    pub fn writes(&self) -> Vec<(OpReg, u32)> {
        self.state.lock().writes.clone()
    }
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
    pub fn set_frame(&self, frame: u32) {
        self.state.lock().op[OpReg::FrIndex as usize] = (frame & 0x7FF) << 3;
    }
    /// Latch status bits (as the controller would when an interrupt condition occurs)
    pub fn raise_status(&self, bits: u32) {
        self.state.lock().op[OpReg::UsbSts as usize] |= bits & hw_regs::USBSTS_ACK_MASK;
    }
    pub fn set_port(&self, index: u8, v: u32) {
        self.state.lock().op[OpReg::PortSc0 as usize + index as usize] = v;
    }
    pub fn port(&self, index: u8) -> u32 {
        self.state.lock().op[OpReg::PortSc0 as usize + index as usize]
    }
}
impl IoBinding for MockIo
{
    fn read_8(&self, ofs: usize) -> u8 {
        match ofs
        {
        0 => CAP_LENGTH as u8,
        _ => 0,
        }
    }
    fn read_16(&self, ofs: usize) -> u16 {
        match ofs
        {
        2 => self.state.lock().hci_version,
        _ => 0,
        }
    }
    fn read_32(&self, ofs: usize) -> u32 {
        let s = self.state.lock();
        if ofs < CAP_LENGTH {
            return match ofs
                {
                4 => s.hcsparams,
                8 => s.hccparams,
                _ => 0,
                };
        }
        let idx = (ofs - CAP_LENGTH) / 4;
        if idx == OpReg::UsbSts as usize {
            let cmd = s.op[OpReg::UsbCmd as usize];
            let mut v = s.op[idx] & hw_regs::USBSTS_ACK_MASK;
            if cmd & hw_regs::USBCMD_Run == 0 && !s.halt_stuck {
                v |= hw_regs::USBSTS_HcHalted;
            }
            if cmd & hw_regs::USBCMD_AsyncEnable != 0 {
                v |= hw_regs::USBSTS_AsyncEnabled;
            }
            if cmd & hw_regs::USBCMD_PeriodicEnable != 0 {
                v |= hw_regs::USBSTS_PeriodicEnabled;
            }
            v
        }
        else {
            s.op.get(idx).copied().unwrap_or(0)
        }
    }
    unsafe fn write_32(&self, ofs: usize, v: u32) {
        let mut s = self.state.lock();
        let idx = (ofs - CAP_LENGTH) / 4;
        if idx >= OpReg::PortSc0 as usize {
            let old = s.op[idx];
            s.op[idx] = (v & !hw_regs::PORTSC_CHANGE_MASK) | (old & hw_regs::PORTSC_CHANGE_MASK & !v);
            return ;
        }
        let reg = match idx
            {
            0 => OpReg::UsbCmd,
            1 => OpReg::UsbSts,
            2 => OpReg::UsbIntr,
            3 => OpReg::FrIndex,
            4 => OpReg::CtrlDsSegment,
            5 => OpReg::PeriodicListBase,
            6 => OpReg::AsyncListAddr,
            _ => OpReg::ConfigFlag,
            };
        s.writes.push( (reg, v) );
        match reg
        {
        OpReg::UsbCmd => {
            let mut v = v;
            if v & hw_regs::USBCMD_HCReset != 0 {
                let frindex = s.op[OpReg::FrIndex as usize];
                for r in s.op[.. OpReg::PortSc0 as usize].iter_mut() {
                    *r = 0;
                }
                s.op[OpReg::FrIndex as usize] = frindex;
                if !s.reset_stuck {
                    v &= !hw_regs::USBCMD_HCReset;
                }
            }
            if v & hw_regs::USBCMD_IAAD != 0 && s.doorbell_ack {
                v &= !hw_regs::USBCMD_IAAD;
                s.op[OpReg::UsbSts as usize] |= hw_regs::USBINTR_IntrAsyncAdvance;
            }
            s.op[idx] = v;
            },
        OpReg::UsbSts => {
            s.op[idx] &= !(v & hw_regs::USBSTS_ACK_MASK);
            },
        OpReg::AsyncListAddr if s.drop_async_base_writes > 0 => {
            s.drop_async_base_writes -= 1;
            },
        _ => {
            s.op[idx] = v;
            },
        }
    }
}

struct Allocation
{
    phys: u64,
    pages: usize,
    ptr: usize,
}
struct PlatformState
{
    next_phys: u64,
    live: Vec<Allocation>,
    /// Remaining allocations allowed (`None` = unlimited)
    dma_limit: Option<usize>,
    clock_us: u64,
    pci: BTreeMap<u8, u32>,
}

/// Host platform with a manual clock (advanced by `delay_us`) and fake physical addresses
pub struct MockPlatform
{
    state: Spinlock<PlatformState>,
}
impl MockPlatform
{
    pub fn new() -> Arc<MockPlatform> {
        Arc::new(MockPlatform {
            state: Spinlock::new(PlatformState {
                next_phys: 0x1000_0000,
                live: Vec::new(),
                dma_limit: None,
                clock_us: 0,
                pci: BTreeMap::new(),
                }),
            })
    }
    pub fn set_dma_limit(&self, limit: Option<usize>) {
        self.state.lock().dma_limit = limit;
    }
    pub fn live_pages(&self) -> usize {
        self.state.lock().live.iter().map(|a| a.pages).sum()
    }
    pub fn advance_us(&self, us: u64) {
        self.state.lock().clock_us += us;
    }
    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }
    pub fn set_legacy(&self, offset: u8, value: u32) {
        self.state.lock().pci.insert(offset, value);
    }
    pub fn pci_config(&self, offset: u8) -> u32 {
        self.state.lock().pci.get(&offset).copied().unwrap_or(0)
    }
}
impl Platform for MockPlatform
{
    fn alloc_dma(&self, pages: usize) -> Option<DmaRegion> {
        let mut s = self.state.lock();
        match s.dma_limit
        {
        Some(0) => return None,
        Some(ref mut n) => *n -= 1,
        None => {},
        }
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()?;
        // SAFE: Non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let virt = NonNull::new(ptr)?;
        let phys = s.next_phys;
        // Leave a gap so that overruns don't land in the next allocation
        s.next_phys += ((pages + 1) * PAGE_SIZE) as u64;
        s.live.push(Allocation { phys, pages, ptr: ptr as usize });
        Some(DmaRegion { virt, phys, pages })
    }
    unsafe fn free_dma(&self, region: DmaRegion) {
        let mut s = self.state.lock();
        let i = s.live.iter().position(|a| a.phys == region.phys).expect("free_dma of unknown region");
        let a = s.live.swap_remove(i);
        assert_eq!(a.pages, region.pages);
        assert_eq!(a.ptr, region.virt.as_ptr() as usize);
        dealloc(a.ptr as *mut u8, Layout::from_size_align(a.pages * PAGE_SIZE, PAGE_SIZE).unwrap());
    }
    fn monotonic_us(&self) -> u64 {
        self.state.lock().clock_us
    }
    fn delay_us(&self, us: u32) {
        self.state.lock().clock_us += us as u64;
    }
    fn read_pci_config(&self, offset: u8) -> Option<u32> {
        self.state.lock().pci.get(&offset).copied()
    }
    fn write_pci_config(&self, offset: u8, value: u32) {
        // Firmware lets go as soon as the OS asks
        let value = if value & hw_regs::USBLEGSUP_OsOwned != 0 { value & !hw_regs::USBLEGSUP_BiosOwned } else { value };
        self.state.lock().pci.insert(offset, value);
    }
}

/// A running controller with four ports
pub fn make_host(config: Config) -> (Arc<HostInner>, Arc<MockIo>, Arc<MockPlatform>)
{
    let io = MockIo::new(4);
    let platform = MockPlatform::new();
    let host = HostInner::new(Box::new(io.clone()), Box::new(platform.clone()), config).expect("HostInner::new");
    host.initialize_hardware().expect("initialize_hardware");
    (host, io, platform)
}
