//!
//!
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use crate::{HostInner,EndpointId,Error,DmaBuffer,TransferOptions,TransferResult};
use super::{EndpointSpec,EndpointAddr};

pub struct ControlEndpoint
{
    host: Arc<HostInner>,
    endpoint: EndpointAddr,
    id: EndpointId,
}
impl ControlEndpoint
{
    pub(super) fn new(host: Arc<HostInner>, spec: EndpointSpec) -> Result<Self, Error> {
        let id = host.create_control(spec)?;
        Ok(Self {
            host,
            endpoint: spec.addr,
            id,
        })
    }

    pub fn get_dev_addr(&self) -> u8 {
        self.endpoint.dev_addr()
    }
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Control request with an OUT (or no) data stage
    ///
    /// `setup` must be the 8-byte setup packet. Both buffers must stay valid until `complete` is called.
    pub fn out_only(&self, setup: DmaBuffer, out_data: DmaBuffer, opts: TransferOptions, complete: impl FnOnce(TransferResult) + Send + 'static) -> Result<(), Error> {
        log_debug!("ControlEndpoint::out_only({:?}): {} bytes", self.endpoint, out_data.len);
        self.host.submit_control(self.id, setup, out_data, false, opts, Box::new(complete))
    }
    /// Control request with an IN data stage
    pub fn in_only(&self, setup: DmaBuffer, in_buf: DmaBuffer, opts: TransferOptions, complete: impl FnOnce(TransferResult) + Send + 'static) -> Result<(), Error> {
        log_debug!("ControlEndpoint::in_only({:?}): {} bytes", self.endpoint, in_buf.len);
        self.host.submit_control(self.id, setup, in_buf, true, opts, Box::new(complete))
    }

    /// Cancel all queued requests (completions are delivered as `Cancelled`)
    pub fn abort(&self) -> Result<(), Error> {
        self.host.abort_endpoint(self.id)
    }
}

impl ::core::ops::Drop for ControlEndpoint
{
    fn drop(&mut self) {
        if let Err(e) = self.host.delete_endpoint(self.id) {
            log_error!("ControlEndpoint({:?}) delete failed: {}", self.endpoint, e);
        }
    }
}
