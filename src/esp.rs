//! ESP32 wiring: SPI master in blocking mode plus a GPIO chip select.

use embedded_hal::spi::SpiBus as _;
use esp_hal::{
    gpio::Output,
    spi::{
        master::{Config as SpiConfig, ConfigError as SpiConfigError, Spi},
        Error as SpiError,
        Mode as SpiMode,
    },
    time::Rate,
    Blocking,
};

use crate::bus::SdBus;

#[derive(Debug)]
pub enum EspBusError {
    Spi(SpiError),
    SpiConfig(SpiConfigError),
}

impl From<SpiError> for EspBusError {
    fn from(value: SpiError) -> Self {
        Self::Spi(value)
    }
}

impl From<SpiConfigError> for EspBusError {
    fn from(value: SpiConfigError) -> Self {
        Self::SpiConfig(value)
    }
}

pub struct EspSdBus<'d> {
    spi: Spi<'d, Blocking>,
    cs: Output<'d>,
}

impl<'d> EspSdBus<'d> {
    pub fn new(spi: Spi<'d, Blocking>, mut cs: Output<'d>) -> Self {
        cs.set_high();
        Self { spi, cs }
    }
}

impl SdBus for EspSdBus<'_> {
    type Error = EspBusError;

    fn transceive(&mut self, byte: u8) -> Result<u8, Self::Error> {
        let mut frame = [byte];
        self.spi.transfer_in_place(&mut frame)?;
        Ok(frame[0])
    }

    fn transceive_block(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.transfer_in_place(buf)?;
        Ok(())
    }

    fn send_block(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(buf)?;
        Ok(())
    }

    fn set_clock(&mut self, hz: u32) -> Result<(), Self::Error> {
        let config = SpiConfig::default()
            .with_mode(SpiMode::_0)
            .with_frequency(Rate::from_hz(hz));
        self.spi.apply_config(&config)?;
        Ok(())
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.cs.set_low();
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.spi.flush()?;
        self.cs.set_high();
        Ok(())
    }
}

/// Routes `log` output to the UART through esp-println.
pub fn init_logger(level: log::LevelFilter) {
    esp_println::logger::init_logger(level);
}
