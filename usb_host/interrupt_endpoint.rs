//!
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use crate::{HostInner,EndpointId,Error,DmaBuffer,TransferOptions,TransferResult};
use super::{EndpointSpec,EndpointAddr};

pub struct InterruptEndpoint
{
    host: Arc<HostInner>,
    endpoint: EndpointAddr,
    id: EndpointId,
}

impl InterruptEndpoint
{
    pub(super) fn new(host: Arc<HostInner>, spec: EndpointSpec, dir_in: bool, interval: u32) -> Result<Self, Error> {
        let id = host.create_interrupt(spec, dir_in, interval)?;
        log_debug!("InterruptEndpoint::new: {:?} interval {} mps {} - {:?}", spec.addr, interval, spec.max_packet_size, id);
        Ok(Self {
            host,
            endpoint: spec.addr,
            id,
        })
    }
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Queue a buffer to be filled (IN) or sent (OUT) on the next polls
    pub fn submit(&self, buffer: DmaBuffer, complete: impl FnOnce(TransferResult) + Send + 'static) -> Result<(), Error> {
        log_trace!("InterruptEndpoint::submit({:?}): {} bytes", self.endpoint, buffer.len);
        self.host.submit_data(self.id, buffer, TransferOptions::default(), Box::new(complete))
    }

    pub fn abort(&self) -> Result<(), Error> {
        self.host.abort_endpoint(self.id)
    }
}

impl ::core::ops::Drop for InterruptEndpoint
{
    fn drop(&mut self) {
        if let Err(e) = self.host.delete_endpoint(self.id) {
            log_error!("InterruptEndpoint({:?}) delete failed: {}", self.endpoint, e);
        }
    }
}
