
use ::alloc::boxed::Box;
use ::alloc::sync::Arc;
use crate::{HostInner,EndpointId,Error,DmaBuffer,TransferOptions,TransferResult};
use super::{EndpointSpec,EndpointAddr};

pub struct BulkEndpoint
{
    host: Arc<HostInner>,
    endpoint: EndpointAddr,
    id: EndpointId,
    dir_in: bool,
}

impl BulkEndpoint
{
    pub(super) fn new(host: Arc<HostInner>, spec: EndpointSpec, dir_in: bool) -> Result<Self, Error> {
        let id = host.create_bulk(spec, dir_in)?;
        Ok(Self {
            host,
            endpoint: spec.addr,
            id,
            dir_in,
        })
    }
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Queue a transfer in the endpoint's direction
    ///
    /// The buffer must stay valid until `complete` is called.
    pub fn submit(&self, buffer: DmaBuffer, opts: TransferOptions, complete: impl FnOnce(TransferResult) + Send + 'static) -> Result<(), Error> {
        log_debug!("BulkEndpoint::submit({:?} {}): {} bytes", self.endpoint, if self.dir_in { "IN" } else { "OUT" }, buffer.len);
        self.host.submit_data(self.id, buffer, opts, Box::new(complete))
    }

    pub fn abort(&self) -> Result<(), Error> {
        self.host.abort_endpoint(self.id)
    }
}

impl ::core::ops::Drop for BulkEndpoint
{
    fn drop(&mut self) {
        if let Err(e) = self.host.delete_endpoint(self.id) {
            log_error!("BulkEndpoint({:?}) delete failed: {}", self.endpoint, e);
        }
    }
}
