//! Serial transport and the timeout-bounded request / response exchange

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Collector, Step};
use crate::Error;

/// Size of the chunk buffer used for each read
pub const READ_CHUNK: usize = 64;

/// Upper bound on chunks discarded before a request
const MAX_DRAIN: usize = 64;

/// Byte-stream connection to the target bootloader.
///
/// The connection must be configured for 8 data bits, even parity and one
/// stop bit.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Open the connection, called on entry into bootloader mode
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read whatever is available into `buff`, returning `WouldBlock` when
    /// nothing has arrived
    fn read(&mut self, buff: &mut [u8]) -> nb::Result<usize, Self::Error>;

    /// Time an empty `read` blocks before returning `WouldBlock`, counted
    /// toward response deadlines
    fn read_wait_ms(&self) -> u32 {
        0
    }

    /// Close the connection, closing an already closed transport is not an
    /// error
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Transport wrapper providing [`Framed::await_response`]
pub struct Framed<T, D> {
    transport: T,
    delay: D,
    poll_delay_ms: u32,
}

impl<T, D> Framed<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn new(transport: T, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            transport,
            delay,
            poll_delay_ms: poll_delay_ms.max(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms)
    }

    /// Write `request` (nothing if empty), then feed inbound chunks to
    /// `collector` until it completes or `timeout_ms` elapses.
    ///
    /// The result is produced exactly once, no reads happen after the
    /// collector completes or fails. Bytes pending before the request are
    /// discarded so a late reply to an earlier exchange is never collected.
    pub fn await_response<C, P>(
        &mut self,
        context: &'static str,
        request: &[u8],
        mut collector: C,
        timeout_ms: u32,
    ) -> Result<C::Output, Error<T::Error, P>>
    where
        C: Collector,
    {
        self.drain().map_err(Error::Transport)?;

        if !request.is_empty() {
            debug!("{}: sending {:02x?}", context, request);
            self.transport.write(request).map_err(Error::Transport)?;
        }

        let mut buff = [0u8; READ_CHUNK];
        let mut elapsed: u32 = 0;

        loop {
            match self.transport.read(&mut buff) {
                Ok(0) | Err(nb::Error::WouldBlock) => {
                    elapsed = elapsed.saturating_add(self.transport.read_wait_ms());
                }
                Ok(n) => {
                    trace!("{}: received {:02x?}", context, &buff[..n]);
                    match collector.collect(&buff[..n]).map_err(Error::Mismatch)? {
                        Step::Pending => (),
                        Step::Send(data) => {
                            debug!("{}: sending {:02x?}", context, data);
                            self.transport.write(data).map_err(Error::Transport)?;
                        }
                        Step::Done(v) => return Ok(v),
                    }
                }
                Err(nb::Error::Other(e)) => return Err(Error::Transport(e)),
            }

            if elapsed >= timeout_ms {
                error!("{}: timeout after {} ms", context, timeout_ms);
                return Err(Error::Timeout {
                    context,
                    timeout_ms,
                });
            }

            let wait = self.poll_delay_ms.min(timeout_ms - elapsed);
            self.delay.delay_ms(wait);
            elapsed = elapsed.saturating_add(wait);
        }
    }

    /// Discard any inbound bytes not claimed by a previous exchange
    fn drain(&mut self) -> Result<(), T::Error> {
        let mut buff = [0u8; READ_CHUNK];
        let mut cruft = 0;

        for _ in 0..MAX_DRAIN {
            match self.transport.read(&mut buff) {
                Ok(0) | Err(nb::Error::WouldBlock) => break,
                Ok(n) => cruft += n,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }

        if cruft > 0 {
            warn!("Discarded {} stale bytes", cruft);
        }

        Ok(())
    }
}
