//! Queue head pool helpers
use crate::hw_structs::{self,QueueHead};
use crate::host_periodic::PeriodicLink;
use super::{QhPool,QhId};

/// Software state for a queue head
#[derive(Default)]
pub struct QhMeta
{
    /// Owning endpoint
    pub endpoint: Option<crate::EndpointId>,
    /// Next queue head on the async ring (`None` when not on the ring)
    pub async_next: Option<QhId>,
    /// Next entry in the periodic tree (interrupt queue heads only)
    pub periodic_next: PeriodicLink,
    /// Polling period in frames (interrupt queue heads only, zero otherwise)
    pub period: u32,
}

/// Snapshot of a queue head's overlay, used to detect a stalled transfer
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct QhProgress
{
    pub current_td: u32,
    pub bytes_remaining: u32,
}

impl QhPool
{
    /// Prepare a newly allocated queue head for an endpoint, with the overlay pointing at `dummy_phys`
    ///
    /// The queue head isn't linked anywhere yet.
    pub fn init_endpoint(&self, id: QhId, endpoint: u32, endpoint_ext: u32, dummy_phys: u32) {
        let d: &QueueHead = self.get(id);
        d.hlink.set(hw_structs::LINK_TERMINATE);
        d.endpoint.set(endpoint);
        d.endpoint_ext.set(endpoint_ext);
        d.current_td.set(0);
        d.overlay_link.set(dummy_phys);
        d.overlay_link2.set(hw_structs::LINK_TERMINATE);
        // Not active, not halted: the controller follows `overlay_link` to find work
        d.overlay_token.set(0);
    }

    pub fn set_hlink(&self, id: QhId, v: u32) {
        self.get(id).hlink.set(v);
    }
    pub fn link_value(&self, id: QhId) -> u32 {
        self.phys(id) | hw_structs::LINK_TY_QH
    }

    /// Set/clear the "head of reclamation list" flag
    pub fn set_head_flag(&self, id: QhId, is_head: bool) {
        let d = self.get(id);
        if is_head {
            d.endpoint.set_bits(hw_structs::QH_ENDPT_H);
        }
        else {
            d.endpoint.clear_bits(hw_structs::QH_ENDPT_H);
        }
    }
    pub fn is_head(&self, id: QhId) -> bool {
        self.get(id).endpoint.get() & hw_structs::QH_ENDPT_H != 0
    }

    /// Force the overlay into the halted state so the controller stops executing it
    pub fn halt(&self, id: QhId) {
        let d = self.get(id);
        let tok = d.overlay_token.get();
        d.overlay_token.set( (tok & !hw_structs::QTD_TOKEN_STS_ACTIVE) | hw_structs::QTD_TOKEN_STS_HALT );
    }
    pub fn is_halted(&self, id: QhId) -> bool {
        self.get(id).overlay_token.get() & hw_structs::QTD_TOKEN_STS_HALT != 0
    }

    /// Point the overlay at a new qTD, clearing any halt
    ///
    /// Must only be called when the controller isn't executing this queue head (halted or unlinked).
    pub fn reset_overlay(&self, id: QhId, next_phys: u32, keep_toggle: bool) {
        let d = self.get(id);
        let toggle = d.overlay_token.get() & hw_structs::QTD_TOKEN_DATATGL;
        d.overlay_link.set(next_phys);
        d.overlay_link2.set(hw_structs::LINK_TERMINATE);
        hw_structs::publish_barrier();
        d.overlay_token.set(if keep_toggle { toggle } else { 0 });
    }

    /// Re-activate a queue head that halted on a transaction error, resuming where it stopped
    pub fn rearm_overlay(&self, id: QhId) {
        let d = self.get(id);
        let tok = d.overlay_token.get() & !(hw_structs::QTD_TOKEN_STS_MASK | hw_structs::QTD_TOKEN_CERR_MASK);
        d.overlay_token.set( tok | hw_structs::QTD_TOKEN_STS_ACTIVE | 3 << hw_structs::QTD_TOKEN_CERR_SHIFT );
    }

    pub fn progress(&self, id: QhId) -> QhProgress {
        let d = self.get(id);
        QhProgress {
            current_td: d.current_td.get() & !0x1F,
            bytes_remaining: (d.overlay_token.get() >> hw_structs::QTD_TOKEN_LEN_SHIFT) & 0x7FFF,
        }
    }
}
