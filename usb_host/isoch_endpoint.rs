//! Isochronous endpoint handle
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use crate::{HostInner,EndpointId,Error,DmaBuffer,IsochResult};
use super::{EndpointSpec,EndpointAddr};

pub struct IsochEndpoint
{
    host: Arc<HostInner>,
    endpoint: EndpointAddr,
    id: EndpointId,
}

impl IsochEndpoint
{
    pub(super) fn new(host: Arc<HostInner>, spec: EndpointSpec, dir_in: bool, interval: u32, mult: u8) -> Result<Self, Error> {
        let id = host.create_isoch(spec, dir_in, interval, mult)?;
        Ok(Self {
            host,
            endpoint: spec.addr,
            id,
        })
    }
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Queue a run of packets, one per service interval, packed back-to-back in `buffer`
    ///
    /// `start_frame` of `None` continues from the end of the previous submission (or starts as soon as possible).
    /// Returns the frame the first packet is scheduled for.
    pub fn submit(&self, start_frame: Option<u64>, buffer: DmaBuffer, lengths: &[u16], complete: impl FnOnce(IsochResult) + Send + 'static) -> Result<u64, Error> {
        log_trace!("IsochEndpoint::submit({:?}): {} packets @ {:?}", self.endpoint, lengths.len(), start_frame);
        self.host.submit_isoch(self.id, start_frame, buffer, lengths, Box::new(complete))
    }

    /// Cancel everything queued, rejected with `Busy` while a previous abort is still being delivered
    pub fn abort(&self) -> Result<(), Error> {
        self.host.abort_endpoint(self.id)
    }
}

impl ::core::ops::Drop for IsochEndpoint
{
    fn drop(&mut self) {
        if let Err(e) = self.host.delete_endpoint(self.id) {
            log_error!("IsochEndpoint({:?}) delete failed: {}", self.endpoint, e);
        }
    }
}
