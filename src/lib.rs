#![cfg_attr(not(test), no_std)]

pub mod api;
pub mod bus;
pub mod config;
pub mod crc;
pub mod diag;
#[cfg(feature = "esp32")]
pub mod esp;
pub mod probe;

#[cfg(test)]
mod fake_card;

pub use api::{RwVerifyResult, SdCard};
pub use bus::{HalBus, HalBusError, SdBus};
pub use config::SdConfig;
pub use diag::{DiagnosticSink, DiagnosticSummary, ErrorLog, ErrorRecord, NoDiagnostics};
pub use probe::{
    CapacityClass, CardGeneration, ClockMode, SdError, SdErrorKind, SessionInfo, SessionState,
    SD_SECTOR_SIZE,
};
