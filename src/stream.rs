//! Buffered, pipelined byte streams over bulk endpoints.
//!
//! Both directions keep a fixed pool of transfers. Every transfer of a pool is, at any moment,
//! either in flight, waiting in the stream's queue, or the stream's "current" transfer.

use crate::backend::EndpointInfo;
use crate::error::{Error, UsbResult};

mod input;
mod output;

pub use input::EndpointReader;
pub use output::EndpointWriter;

/// Snapshot of where a stream's transfers currently are.
#[cfg(test)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PoolState {
    pub(crate) in_flight: usize,
    pub(crate) queued: usize,
    pub(crate) current: usize,
    pub(crate) total: usize,
}

#[cfg(test)]
impl PoolState {
    pub(crate) fn is_conserved(&self) -> bool {
        self.in_flight + self.queued + self.current == self.total
    }
}

/// Streams need a real packet size to size their buffers.
fn packet_size(endpoint: &EndpointInfo) -> UsbResult<usize> {
    match endpoint.packet_size {
        0 => Err(Error::InvalidEndpoint(format!(
            "endpoint number {} reports a maximum packet size of zero",
            endpoint.number
        ))),
        size => Ok(size as usize),
    }
}
