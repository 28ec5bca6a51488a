//! Byte plumbing between the card engine and the SPI peripheral.
//!
//! Nothing in here interprets what goes over the wire; retries, framing and
//! checksums all live in [`crate::probe`].

use embedded_hal::{digital::OutputPin, spi::SpiBus};

/// Exclusive-access, full-duplex byte transport with chip select.
pub trait SdBus {
    type Error;

    /// Clocks one byte out and returns the byte clocked in.
    fn transceive(&mut self, byte: u8) -> Result<u8, Self::Error>;

    /// Full-duplex exchange, replacing `buf` with what the card sent.
    fn transceive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write-only transfer; bytes clocked in are discarded.
    fn send_block(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error>;

    /// Drives chip select low.
    fn select(&mut self) -> Result<(), Self::Error>;

    /// Releases chip select.
    fn deselect(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug)]
pub enum HalBusError<S, P> {
    Spi(S),
    ChipSelect(P),
}

/// [`SdBus`] over any embedded-hal 1.0 `SpiBus` plus a chip-select pin.
///
/// embedded-hal has no notion of a bus clock, so rate switching goes
/// through `set_rate`, which receives the bus and the requested frequency.
pub struct HalBus<SPI, CS, F> {
    spi: SPI,
    cs: CS,
    set_rate: F,
}

impl<SPI, CS, F> HalBus<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(&mut SPI, u32) -> Result<(), SPI::Error>,
{
    /// Takes over the bus with chip select released.
    pub fn new(
        spi: SPI,
        mut cs: CS,
        set_rate: F,
    ) -> Result<Self, HalBusError<SPI::Error, CS::Error>> {
        cs.set_high().map_err(HalBusError::ChipSelect)?;
        Ok(Self { spi, cs, set_rate })
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS, F> SdBus for HalBus<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(&mut SPI, u32) -> Result<(), SPI::Error>,
{
    type Error = HalBusError<SPI::Error, CS::Error>;

    fn transceive(&mut self, byte: u8) -> Result<u8, Self::Error> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(HalBusError::Spi)?;
        Ok(frame[0])
    }

    fn transceive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.transfer_in_place(buf).map_err(HalBusError::Spi)
    }

    fn send_block(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(buf).map_err(HalBusError::Spi)
    }

    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error> {
        self.spi.flush().map_err(HalBusError::Spi)?;
        (self.set_rate)(&mut self.spi, hz).map_err(HalBusError::Spi)
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.cs.set_low().map_err(HalBusError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.spi.flush().map_err(HalBusError::Spi)?;
        self.cs.set_high().map_err(HalBusError::ChipSelect)
    }
}
