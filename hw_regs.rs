//! Hardware definitions (register file and constants)
#![allow(non_upper_case_globals)]
#![allow(dead_code)]

/// Access to the controller's memory-mapped register window
pub trait IoBinding: Send + Sync
{
	fn read_8(&self, ofs: usize) -> u8;
	fn read_16(&self, ofs: usize) -> u16;
	fn read_32(&self, ofs: usize) -> u32;
	/// UNSAFE: Register writes can start DMA
	unsafe fn write_32(&self, ofs: usize, v: u32);
}
impl<T: IoBinding + ?Sized> IoBinding for ::alloc::sync::Arc<T>
{
	fn read_8(&self, ofs: usize) -> u8 { (**self).read_8(ofs) }
	fn read_16(&self, ofs: usize) -> u16 { (**self).read_16(ofs) }
	fn read_32(&self, ofs: usize) -> u32 { (**self).read_32(ofs) }
	unsafe fn write_32(&self, ofs: usize, v: u32) { (**self).write_32(ofs, v) }
}

pub struct Regs
{
	base: ::alloc::boxed::Box<dyn IoBinding>,
	cap_length: usize,
}
impl Regs
{
	/// UNSAFE: Caller must ensure that the IO binding is a EHCI IO binding
	pub unsafe fn new(h: ::alloc::boxed::Box<dyn IoBinding>) -> Self {
		let cap_length = h.read_8(0);
		Self {
			base: h,
			cap_length: cap_length as usize,
		}
	}
}
/// Capability registers, read-only
impl Regs
{
	pub fn hci_version(&self) -> u16 {
		self.base.read_16(2)
	}
	/// Structural Parameters
	pub fn hcs_params(&self) -> u32 {
		self.base.read_32(4)
	}
	/// Capability Parameters
	pub fn hcc_params(&self) -> u32 {
		self.base.read_32(8)
	}

	/// Number of root hub ports
	pub fn n_ports(&self) -> u8 {
		(self.hcs_params() & HCSPARAMS_NPorts_MASK) as u8
	}
	/// Controller can use 64-bit addresses in its data structures
	pub fn is_64bit(&self) -> bool {
		self.hcc_params() & HCCPARAMS_64Bit != 0
	}
	/// Isochronous Scheduling Threshold, in whole frames (rounded up)
	pub fn ist_frames(&self) -> u32 {
		let ist = (self.hcc_params() >> 4) & 0xF;
		if ist & 0x8 != 0 {
			// Frame-granularity: the controller caches a whole frame (plus the count)
			(ist & 0x7) + 1
		}
		else if ist != 0 {
			1
		}
		else {
			0
		}
	}
	/// EHCI Extended Capabilities Pointer (offset in PCI config space, zero if none)
	pub fn eecp(&self) -> u8 {
		((self.hcc_params() >> 8) & 0xFF) as u8
	}
}

#[repr(usize)]
#[derive(Copy,Clone,Debug,PartialEq,Eq)]
pub enum OpReg {
	/// USB Command Register
	/// 
	/// *  0    = Run/Stop (Stop, Run)
	/// *  1    = Host Controller Reset
	/// *  2: 3 = Frame List Size (1024 entries, 512, 256, Reserved)
	/// *  4    = Periodic Schedule Enable
	/// *  5    = Asynchronous Schedule Enable
	/// *  6    = Interrupt on Async Advance Doorbell
	/// *  7    = Light Host Controller Reset
	/// *  8: 9 = Asynchronous Schedule Park Mode Count
	/// * 10    = Reserved (ZERO)
	/// * 11    = Asynchronous Schedule Park Mode Enable
	/// * 12:15 = Reserved (ZERO)
	/// * 16:23 = Interrupt Threshold Control
	/// * 31:24 = Reserved (ZERO)
	UsbCmd,
	/// USB Status Register
	UsbSts,
	/// USB Interrupt Enable Register
	UsbIntr,
	/// Current microframe number (14 bits)
	FrIndex,
	/// Control Data Structure Segment Register
	/// 
	/// Most significant 32-bits of all addresses (only used if "64-bit addressing capability" is set)
	CtrlDsSegment,
	/// Periodic Frame List Base Address Register
	PeriodicListBase,
	/// Current Asynchronous List Address Register
	/// 
	/// - This is updated by the hardware when the list advances.
	/// - Should only be written by software when the list is disabled (see `UsbCmd` bit 5 and `USBSTS_AsyncEnabled`)
	AsyncListAddr,
	/// Configure Flag Register
	ConfigFlag = 0x40 / 4,
	/// Port Status and Control Register (one per port)
	/// NOTE: Use the [Regs::read_port_sc] and [Regs::write_port_sc] functions to access
	PortSc0,
}

/// Operational Registers
impl Regs
{
	pub fn op_offset(&self, reg: OpReg) -> usize {
		self.cap_length + reg as usize * 4
	}
	pub fn read_op(&self, reg: OpReg) -> u32 {
		self.base.read_32(self.op_offset(reg))
	}
	pub unsafe fn write_op(&self, reg: OpReg, v: u32) {
		#[cfg(debug_assertions)]
		match reg
		{
		OpReg::UsbCmd => assert!(v & 0xFF00_F400 == 0, "Reserved bits set in UsbCmd"),
		OpReg::UsbSts => {},
		OpReg::UsbIntr => {},
		OpReg::FrIndex => panic!("Writing to FrIndex"),
		OpReg::CtrlDsSegment => {},
		OpReg::PeriodicListBase => assert!(v & 0xFFF == 0, "Periodic list base not page aligned"),
		OpReg::AsyncListAddr => assert!(v & 0x1F == 0, "Async list address not 32-byte aligned"),
		OpReg::ConfigFlag => {},
		OpReg::PortSc0 => panic!("Attempted to directly write PortSc0"),
		}
		self.base.write_32(self.op_offset(reg), v)
	}

	/// Port Status and Control Register
	pub fn read_port_sc(&self, index: u8) -> u32 {
		assert!(index < 16);
		self.base.read_32(self.cap_length + (OpReg::PortSc0 as usize + index as usize) * 4)
	}
	/// (Write) Port Status and Control Register
	///
	/// The change bits are write-1-to-clear, callers must mask them out unless they intend to clear them.
	pub unsafe fn write_port_sc(&self, index: u8, v: u32) {
		assert!(index < 16);
		self.base.write_32(self.cap_length + (OpReg::PortSc0 as usize + index as usize) * 4, v)
	}

	/// Current frame number (11 bits, derived from the microframe index)
	pub fn frame_index(&self) -> u32 {
		(self.read_op(OpReg::FrIndex) >> 3) & 0x7FF
	}
}

pub const HCSPARAMS_NPorts_MASK : u32 = 0x000F;
pub const HCCPARAMS_64Bit       : u32 = 0x0001;

pub const USBCMD_Run            : u32 = 0x0001;
pub const USBCMD_HCReset        : u32 = 0x0002;
pub const USBCMD_PeriodicEnable : u32 = 0x0010;
pub const USBCMD_AsyncEnable    : u32 = 0x0020;
/// Interrupt on Async Advance Doorbell
/// 
/// Requests `USBINTR_IntrAsyncAdvance` for the next time the async queue advances
pub const USBCMD_IAAD           : u32 = 0x0040;
pub const USBCMD_ITC_SHIFT      : u32 = 16;

/// Interrupt on completion (also for USBSTS)
pub const USBINTR_IOC               : u32 = 0x0001;
/// A bus error has been detected
pub const USBINTR_Error             : u32 = 0x0002;
pub const USBINTR_PortChange        : u32 = 0x0004;
pub const USBINTR_FrameRollover     : u32 = 0x0008;
pub const USBINTR_HostSystemError   : u32 = 0x0010;
pub const USBINTR_IntrAsyncAdvance  : u32 = 0x0020;
/// All of the write-1-to-clear status bits
pub const USBSTS_ACK_MASK           : u32 = 0x003F;

/// The host controller is halted
pub const USBSTS_HcHalted        : u32 = 0x1000;
/// The async queue is empty
pub const USBSTS_Reclamation     : u32 = 0x2000;
/// Periodic schedule is actually running (lags `USBCMD_PeriodicEnable`)
pub const USBSTS_PeriodicEnabled : u32 = 0x4000;
/// Async schedule is actually running (lags `USBCMD_AsyncEnable`)
pub const USBSTS_AsyncEnabled    : u32 = 0x8000;

pub const CONFIGFLAG_RouteToEhci : u32 = 0x0001;

pub const PORTSC_CurrentConnectStatus: u32 = 0x0001;
pub const PORTSC_ConnectStatusChange : u32 = 0x0002;
pub const PORTSC_PortEnabled         : u32 = 0x0004;
pub const PORTSC_PortEnableChange    : u32 = 0x0008;
pub const PORTSC_OvercurrentActive   : u32 = 0x0010;
pub const PORTSC_OvercurrentChange   : u32 = 0x0020;
pub const PORTSC_ForcePortResume     : u32 = 0x0040;
pub const PORTSC_Suspend             : u32 = 0x0080;
pub const PORTSC_PortReset           : u32 = 0x0100;
pub const PORTSC_LineStatus_MASK     : u32 = 0x0C00;
pub const PORTSC_PortPower           : u32 = 0x1000;
pub const PORTSC_PortOwner           : u32 = 0x2000;
pub const PORTSC_PortIndicator_MASK  : u32 = 0xC000;
pub const PORTSC_PortIndicator_Green : u32 = 0x8000;
/// Change bits (write-1-to-clear)
pub const PORTSC_CHANGE_MASK         : u32 = PORTSC_ConnectStatusChange|PORTSC_PortEnableChange|PORTSC_OvercurrentChange;

/// Legacy support extended capability (in PCI config space)
pub const USBLEGSUP_CapId        : u32 = 0x01;
pub const USBLEGSUP_BiosOwned    : u32 = 1 << 16;
pub const USBLEGSUP_OsOwned      : u32 = 1 << 24;
