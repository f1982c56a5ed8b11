//! Byte transports to the camera hardware.
//!
//! A [`Transport`] is a plain ordered byte channel: the command queue writes
//! a complete command, then pulls response chunks until it has the declared
//! length. Transports know nothing about the protocol; framing and length
//! checking live in the queue.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod sim;

#[cfg(feature = "transport_serial")]
pub mod serial;

/// An ordered byte channel to one camera.
///
/// Implementations must preserve write order and deliver response bytes in
/// the order the device produced them. A failed call leaves the channel in
/// an unknown state; callers drop the transport rather than retrying.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable identity for log lines.
    fn name(&self) -> &str;

    /// Open the channel.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the channel. Safe to call more than once.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write all of `bytes`, or fail with [`TransportError::ShortWrite`].
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `len` response bytes.
    ///
    /// Returns one chunk, possibly shorter than `len`. An empty chunk means
    /// the device has no more data for the current command; the caller
    /// decides whether that is an underrun or an error.
    async fn read_chunk(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;
}
