//! RFCOMM socket setup for QC35 communication.
//!
//! The QC35 control protocol rides a plain RFCOMM byte stream. This module
//! opens the stream with a bounded timeout and hands back split halves so
//! the reader and writer workers each own exactly one direction.

use std::time::Duration;

use bluer::{
   Address,
   rfcomm::{SocketAddr, Stream},
};
use log::debug;
use tokio::{io, time};

use crate::error::{Qc35Error, Result};

/// Read half of the RFCOMM stream, owned by the reader worker.
pub type Reader = io::ReadHalf<Stream>;
/// Write half of the RFCOMM stream, owned by the writer worker.
pub type Writer = io::WriteHalf<Stream>;

/// Opens an RFCOMM connection to `address` on `channel`.
pub async fn connect(
   address: Address,
   channel: u8,
   timeout: Duration,
) -> Result<(Reader, Writer)> {
   debug!("Opening RFCOMM channel {channel} to {address}");

   let addr = SocketAddr::new(address, channel);
   let stream = time::timeout(timeout, Stream::connect(addr))
      .await
      .map_err(|_| Qc35Error::RequestTimeout)??;

   debug!("RFCOMM stream to {address} established");
   Ok(io::split(stream))
}
