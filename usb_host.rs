//! Client-facing host interface: endpoint creation and root hub access
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use crate::error::Error;
use crate::hw_structs;
use crate::{Config,HostInner,IoBinding,Platform,FilterResult};

mod control_endpoint;
mod bulk_endpoint;
mod interrupt_endpoint;
mod isoch_endpoint;
pub use self::control_endpoint::ControlEndpoint;
pub use self::bulk_endpoint::BulkEndpoint;
pub use self::interrupt_endpoint::InterruptEndpoint;
pub use self::isoch_endpoint::IsochEndpoint;

/// Device and endpoint number (7 bit device and 4 bit endpoint, encoded together)
#[derive(Copy,Clone,PartialEq,Eq)]
pub struct EndpointAddr(u16);
impl EndpointAddr
{
    pub fn new(dev: u8, endpt: u8) -> EndpointAddr {
        assert!(dev < 128);
        assert!(endpt < 16);
        EndpointAddr(dev as u16 * 16 + endpt as u16)
    }
    pub fn dev_addr(&self) -> u8 {
        (self.0 >> 4) as u8
    }
    pub fn endpt(&self) -> u8 {
        (self.0 & 0xF) as u8
    }
}
impl ::core::fmt::Debug for EndpointAddr
{
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "{}:{}", self.dev_addr(), self.endpt())
    }
}

/// Information about USB1 handling of a device
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct Usb1 {
    /// Address of the high-speed hub with the transaction translator
    pub hub_addr: u8,
    pub hub_port: u8,
    pub is_fullspeed: bool,
}

/// Everything needed to address an endpoint
#[derive(Debug,Copy,Clone)]
pub struct EndpointSpec
{
    pub addr: EndpointAddr,
    pub max_packet_size: u16,
    /// Transaction translator details, `None` for high-speed devices
    pub usb1: Option<Usb1>,
}
impl EndpointSpec
{
    pub fn is_high_speed(&self) -> bool {
        self.usb1.is_none()
    }
}

/// Create values for the `endpoint` and `endpoint_ext` fields of a queue head
pub(crate) fn make_endpoint_spec(spec: &EndpointSpec, is_control: bool) -> (u32, u32)
{
    let mut endpoint_id = 0
        | (spec.max_packet_size as u32 & 0x7FF) << hw_structs::QH_ENDPT_MPS_SHIFT
        | (spec.addr.dev_addr() as u32)
        | (spec.addr.endpt() as u32) << hw_structs::QH_ENDPT_ENDPT_SHIFT
        | if is_control { hw_structs::QH_ENDPT_DTC } else { 0 }
        ;
    let mut endpoint_ext = 0
        | (0b01 << hw_structs::QH_EXT_MULT_SHIFT)  // Bandwidth multipler
        // Low 16 bits (S-mask/C-mask) are only used for interrupt endpoints
        ;
    set_usb1_state(&mut endpoint_id, &mut endpoint_ext, spec.usb1, is_control);
    (endpoint_id, endpoint_ext)
}
/// Update endpoint description for a QH with new `Usb1` state
fn set_usb1_state(endpoint_id: &mut u32, endpoint_ext: &mut u32, usb1: Option<Usb1>, is_control: bool) {
    *endpoint_id = (*endpoint_id & !0x0800_3000)
        | if is_control && usb1.is_some() { hw_structs::QH_ENDPT_C } else { 0 }
        | match usb1 {
            Some(Usb1 { is_fullspeed: true, .. }) => hw_structs::QH_ENDPT_EPS_FULL,
            Some(Usb1 { is_fullspeed: false, .. }) => hw_structs::QH_ENDPT_EPS_LOW,
            None => hw_structs::QH_ENDPT_EPS_HIGH,
            }
        ;
    *endpoint_ext = (*endpoint_ext & !0x3FFF_0000)
        | if let Some(Usb1 { hub_port, .. }) = usb1 { (hub_port as u32) << hw_structs::QH_EXT_PORT_SHIFT } else { 0 }
        | if let Some(Usb1 { hub_addr, .. }) = usb1 { (hub_addr as u32) << hw_structs::QH_EXT_HUBADDR_SHIFT } else { 0 }
        ;
}

/// Root hub port features
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum PortFeature
{
    Connection,
    Enable,
    Suspend,
    OverCurrent,
    Reset,
    Power,
    LowSpeed,
    CConnection,
    CEnable,
    CSuspend,
    COverCurrent,
    CReset,
    Test,
    Indicator,
}

#[derive(PartialOrd,PartialEq)]
enum FeatureOp {
    /// All features support get
    Get,
    /// Some can only be cleared
    Clear,
    /// And even fewer can be set
    Set,
}
fn feature_bit(feature: PortFeature, o: FeatureOp) -> Option<u32> {
    use crate::hw_regs::*;
    let only_get = |bit| if o > FeatureOp::Get { None } else { Some(bit) };
    let no_set = |bit| if o > FeatureOp::Clear { None } else { Some(bit) };
    Some(match feature
    {
    PortFeature::Connection  => only_get(PORTSC_CurrentConnectStatus)?,
    PortFeature::Enable      => PORTSC_PortEnabled,
    PortFeature::Suspend     => PORTSC_Suspend,
    PortFeature::OverCurrent => only_get(PORTSC_OvercurrentActive)?,
    PortFeature::Reset       => PORTSC_PortReset,
    PortFeature::Power       => PORTSC_PortPower,
    PortFeature::LowSpeed    => return None,
    PortFeature::CConnection => no_set(PORTSC_ConnectStatusChange)?,
    PortFeature::CEnable     => no_set(PORTSC_PortEnableChange)?,
    PortFeature::CSuspend    => return None,
    PortFeature::COverCurrent=> no_set(PORTSC_OvercurrentChange)?,
    PortFeature::CReset      => return None,
    PortFeature::Test        => return None,
    PortFeature::Indicator   => match o
        {
        FeatureOp::Get   => PORTSC_PortIndicator_MASK,
        FeatureOp::Clear => PORTSC_PortIndicator_MASK,
        FeatureOp::Set   => PORTSC_PortIndicator_Green,
        },
    })
}

pub struct UsbHost
{
    pub(crate) host: Arc<HostInner>,
}
impl UsbHost
{
    /// Create the driver state for a controller (call [UsbHost::initialize_hardware] to start it)
    pub fn new(io: Box<dyn IoBinding>, platform: Box<dyn Platform>, config: Config) -> Result<UsbHost, Error> {
        Ok(UsbHost {
            host: HostInner::new(io, platform, config)?,
            })
    }
    pub fn initialize_hardware(&self) -> Result<(), Error> {
        self.host.initialize_hardware()
    }
    pub fn finalize_hardware(&self) -> Result<(), Error> {
        self.host.finalize_hardware()
    }

    /// Interrupt handler (filter stage), run with the interrupt source masked
    pub fn handle_irq(&self) -> FilterResult {
        self.host.handle_filter()
    }
    /// Deferred interrupt work (action stage), run when [UsbHost::handle_irq] asks for it
    pub fn run_action(&self) {
        self.host.handle_action()
    }
    /// Periodic housekeeping (isochronous admission, timeouts), nominally every few milliseconds
    pub fn housekeeping_tick(&self) {
        self.host.housekeeping_tick()
    }

    pub fn frame_number(&self) -> u32 {
        self.host.frame_number()
    }
    pub fn frame_number_64(&self) -> u64 {
        self.host.frame_number_64()
    }
    pub fn available_isoch_bandwidth(&self) -> u32 {
        self.host.available_isoch_bandwidth()
    }
    /// Host system error seen (the controller has stopped and must be re-initialised)
    pub fn take_fatal(&self) -> bool {
        self.host.take_fatal()
    }

    pub fn init_control(&self, spec: EndpointSpec) -> Result<ControlEndpoint, Error> {
        ControlEndpoint::new(self.host.clone(), spec)
    }
    pub fn init_bulk_out(&self, spec: EndpointSpec) -> Result<BulkEndpoint, Error> {
        BulkEndpoint::new(self.host.clone(), spec, false)
    }
    pub fn init_bulk_in(&self, spec: EndpointSpec) -> Result<BulkEndpoint, Error> {
        BulkEndpoint::new(self.host.clone(), spec, true)
    }
    /// Interrupt endpoint, `interval` in microframes for high-speed devices and frames otherwise
    pub fn init_interrupt(&self, spec: EndpointSpec, dir_in: bool, interval: u32) -> Result<InterruptEndpoint, Error> {
        InterruptEndpoint::new(self.host.clone(), spec, dir_in, interval)
    }
    /// Isochronous endpoint, `interval` as for [UsbHost::init_interrupt], `mult` is the high-bandwidth transaction count (1-3)
    pub fn init_isoch(&self, spec: EndpointSpec, dir_in: bool, interval: u32, mult: u8) -> Result<IsochEndpoint, Error> {
        IsochEndpoint::new(self.host.clone(), spec, dir_in, interval, mult)
    }

    // Root hub maintainence
    pub fn port_count(&self) -> u8 {
        self.host.nports()
    }
    fn check_port(&self, port: usize) -> Result<u8, Error> {
        if port < self.host.nports() as usize {
            Ok(port as u8)
        }
        else {
            Err(Error::BadPort(port as u8))
        }
    }
    /// Raw port status and control register
    pub fn get_port_status(&self, port: usize) -> Result<u32, Error> {
        let port = self.check_port(port)?;
        Ok(self.host.regs.read_port_sc(port))
    }
    pub fn set_port_feature(&self, port: usize, feature: PortFeature) -> Result<(), Error> {
        let port = self.check_port(port)?;
        if let Some(bit) = feature_bit(feature, FeatureOp::Set)  {
            log_debug!("set_port_feature({} {:?}): {:#x}", port, feature, bit);
            // Don't clear pending change bits by writing them back
            let v = self.host.regs.read_port_sc(port) & !crate::hw_regs::PORTSC_CHANGE_MASK;
            // SAFE: Correct bits written
            unsafe { self.host.regs.write_port_sc(port, v | bit); }
        }
        Ok( () )
    }
    pub fn clear_port_feature(&self, port: usize, feature: PortFeature) -> Result<(), Error> {
        let port = self.check_port(port)?;
        if let Some(bit) = feature_bit(feature, FeatureOp::Clear)  {
            log_debug!("clear_port_feature({} {:?}): {:#x}", port, feature, bit);
            let v = self.host.regs.read_port_sc(port);
            let v = if bit & crate::hw_regs::PORTSC_CHANGE_MASK != 0 {
                    // Change bits are write-1-to-clear
                    (v & !crate::hw_regs::PORTSC_CHANGE_MASK) | bit
                }
                else {
                    v & !crate::hw_regs::PORTSC_CHANGE_MASK & !bit
                };
            // SAFE: Correct bits written
            unsafe { self.host.regs.write_port_sc(port, v); }
        }
        Ok( () )
    }
    pub fn get_port_feature(&self, port: usize, feature: PortFeature) -> Result<bool, Error> {
        let port = self.check_port(port)?;
        Ok(if let Some(bit) = feature_bit(feature, FeatureOp::Get)  {
            let rv = self.host.regs.read_port_sc(port) & bit != 0;
            log_trace!("get_port_feature({} {:?}): {:#x} = {}", port, feature, bit, rv);
            rv
        }
        else {
            false
        })
    }
    /// Next root hub port with a pending change (change bits are latched by the interrupt handler)
    pub fn poll_root(&self) -> Option<usize> {
        let v = self.host.take_port_changes();
        if v == 0 {
            return None;
        }
        let i = v.trailing_zeros();
        // Put back the others
        self.host.note_port_changes(v & !(1 << i));
        Some(i as usize)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::hw_regs;
    use crate::test_support::*;

    fn make() -> (UsbHost, ::alloc::sync::Arc<MockIo>) {
        let (host, io, _platform) = make_host(Config::default());
        (UsbHost { host }, io)
    }

    #[test]
    fn endpoint_words()
    {
        let spec = EndpointSpec { addr: EndpointAddr::new(5, 0), max_packet_size: 8, usb1: Some(Usb1 { hub_addr: 2, hub_port: 3, is_fullspeed: false }) };
        let (ep, ext) = make_endpoint_spec(&spec, true);
        assert_eq!(ep, 8 << 16 | 5 | hw_structs::QH_ENDPT_DTC | hw_structs::QH_ENDPT_C | hw_structs::QH_ENDPT_EPS_LOW);
        assert_eq!(ext, 1 << 30 | 3 << 23 | 2 << 16);
        let spec = EndpointSpec { addr: EndpointAddr::new(7, 2), max_packet_size: 512, usb1: None };
        let (ep, ext) = make_endpoint_spec(&spec, false);
        assert_eq!(ep, 512 << 16 | 2 << 8 | 7 | hw_structs::QH_ENDPT_EPS_HIGH);
        assert_eq!(ext, 1 << 30);
    }

    #[test]
    fn port_range_checked()
    {
        let (h, _io) = make();
        assert_eq!(h.port_count(), 4);
        assert_eq!(h.get_port_status(4), Err(Error::BadPort(4)));
        assert_eq!(h.set_port_feature(9, PortFeature::Reset), Err(Error::BadPort(9)));
        assert!(h.get_port_status(3).is_ok());
    }

    #[test]
    fn port_features()
    {
        let (h, io) = make();
        io.set_port(1, hw_regs::PORTSC_CurrentConnectStatus | hw_regs::PORTSC_ConnectStatusChange | hw_regs::PORTSC_PortPower);
        assert_eq!(h.get_port_feature(1, PortFeature::Connection), Ok(true));
        // Setting a feature mustn't acknowledge the pending change
        h.set_port_feature(1, PortFeature::Reset).unwrap();
        assert!(io.port(1) & hw_regs::PORTSC_PortReset != 0);
        assert!(io.port(1) & hw_regs::PORTSC_ConnectStatusChange != 0);
        h.clear_port_feature(1, PortFeature::CConnection).unwrap();
        assert!(io.port(1) & hw_regs::PORTSC_ConnectStatusChange == 0);
        assert!(io.port(1) & hw_regs::PORTSC_PortPower != 0);
        h.clear_port_feature(1, PortFeature::Reset).unwrap();
        assert!(io.port(1) & hw_regs::PORTSC_PortReset == 0);
        // Unsupported
        assert_eq!(h.get_port_feature(1, PortFeature::LowSpeed), Ok(false));
    }

    #[test]
    fn port_change_via_irq()
    {
        let (h, io) = make();
        io.set_port(2, hw_regs::PORTSC_ConnectStatusChange);
        io.raise_status(hw_regs::USBINTR_PortChange);
        assert_eq!(h.poll_root(), None);
        let r = h.handle_irq();
        assert!(r.run_action);
        assert_eq!(h.poll_root(), Some(2));
        assert_eq!(h.poll_root(), None);
    }
}
