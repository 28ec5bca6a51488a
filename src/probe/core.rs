use crate::{bus::SdBus, config::SdConfig, diag::DiagnosticSink};

pub(super) const SD_CMD0: u8 = 0;
pub(super) const SD_CMD1: u8 = 1;
pub(super) const SD_CMD8: u8 = 8;
pub(super) const SD_CMD16: u8 = 16;
pub(super) const SD_CMD17: u8 = 17;
pub(super) const SD_CMD18: u8 = 18;
pub(super) const SD_CMD24: u8 = 24;
pub(super) const SD_CMD55: u8 = 55;
pub(super) const SD_CMD58: u8 = 58;
pub(super) const SD_CMD59: u8 = 59;
pub(super) const SD_ACMD41: u8 = 41;

pub(super) const R1_IDLE: u8 = 0x01;
pub(super) const R1_ILLEGAL_COMMAND: u8 = 0x04;
pub(super) const R1_ERROR_MASK: u8 = 0x7E;
pub(super) const R1_START_BIT: u8 = 0x80;

pub(super) const IDLE_BYTE: u8 = 0xFF;
pub(super) const DATA_START_TOKEN: u8 = 0xFE;
pub(super) const DATA_RESPONSE_MASK: u8 = 0x1F;
pub(super) const DATA_ACCEPTED: u8 = 0x05;
pub(super) const DATA_CRC_REJECTED: u8 = 0x0B;

// 2.7-3.6V supply range plus the 0xAA check pattern.
pub(super) const IF_COND_ARG: u32 = 0x0000_01AA;
pub(super) const ACMD41_HCS: u32 = 1 << 30;
pub(super) const OCR_CCS: u8 = 0x40;
pub(super) const OCR_VOLTAGE_MASK: u8 = 0xC0;

pub const SD_SECTOR_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardGeneration {
    Mmc,
    SdV1,
    SdV2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityClass {
    /// SDSC/MMC, byte addressed.
    Standard,
    /// SDHC/SDXC, block addressed.
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    Probe,
    Operational,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Probing,
    VoltageCheck,
    IdleWait,
    CapacityCheck,
    Configuring,
    Ready,
    Faulted(SdErrorKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub state: SessionState,
    pub generation: CardGeneration,
    pub capacity: CapacityClass,
    pub clock: ClockMode,
    pub ocr: [u8; 4],
}

impl SessionInfo {
    pub(super) const fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            generation: CardGeneration::SdV2,
            capacity: CapacityClass::Standard,
            clock: ClockMode::Probe,
            ocr: [0; 4],
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }
}

/// Bus-free projection of [`SdError`], small enough to park in
/// [`SessionState::Faulted`] and in diagnostic records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdErrorKind {
    Bus,
    NotReady,
    InvalidRange,
    BusNotIdle,
    TransmissionInterrupted,
    NoResponse,
    Rejected,
    DataTokenTimeout,
    DataTokenUnexpected,
    ChecksumFailed,
    WriteRejected,
    WriteBusyTimeout,
    ResetTimeout,
    IdleWaitTimeout,
    UnsupportedVoltage,
    VoltageNotSupported,
    Generic,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SdError<E> {
    Bus(E),
    /// Sector I/O outside `Ready`; the bus was not touched.
    NotReady,
    /// Buffer shorter than the requested sector count, or a sector number
    /// that does not fit the card's address space.
    InvalidRange,
    BusNotIdle,
    /// A command byte did not echo back as idle.
    TransmissionInterrupted,
    NoResponse(u8),
    Rejected { cmd: u8, r1: u8 },
    DataTokenTimeout(u8),
    DataTokenUnexpected(u8, u8),
    ChecksumFailed,
    WriteRejected(u8),
    WriteBusyTimeout,
    ResetTimeout,
    IdleWaitTimeout,
    /// CMD8 echo did not match the requested voltage pattern.
    UnsupportedVoltage([u8; 4]),
    /// OCR advertises none of the supply voltages.
    VoltageNotSupported,
    Generic,
}

impl<E> SdError<E> {
    pub fn kind(&self) -> SdErrorKind {
        match self {
            Self::Bus(_) => SdErrorKind::Bus,
            Self::NotReady => SdErrorKind::NotReady,
            Self::InvalidRange => SdErrorKind::InvalidRange,
            Self::BusNotIdle => SdErrorKind::BusNotIdle,
            Self::TransmissionInterrupted => SdErrorKind::TransmissionInterrupted,
            Self::NoResponse(_) => SdErrorKind::NoResponse,
            Self::Rejected { .. } => SdErrorKind::Rejected,
            Self::DataTokenTimeout(_) => SdErrorKind::DataTokenTimeout,
            Self::DataTokenUnexpected(_, _) => SdErrorKind::DataTokenUnexpected,
            Self::ChecksumFailed => SdErrorKind::ChecksumFailed,
            Self::WriteRejected(_) => SdErrorKind::WriteRejected,
            Self::WriteBusyTimeout => SdErrorKind::WriteBusyTimeout,
            Self::ResetTimeout => SdErrorKind::ResetTimeout,
            Self::IdleWaitTimeout => SdErrorKind::IdleWaitTimeout,
            Self::UnsupportedVoltage(_) => SdErrorKind::UnsupportedVoltage,
            Self::VoltageNotSupported => SdErrorKind::VoltageNotSupported,
            Self::Generic => SdErrorKind::Generic,
        }
    }

    /// Card byte that caused the failure, if there was one.
    pub fn status(&self) -> Option<u8> {
        match self {
            Self::Rejected { r1, .. } => Some(*r1),
            Self::DataTokenUnexpected(_, token) => Some(*token),
            Self::WriteRejected(token) => Some(*token),
            _ => None,
        }
    }
}

/// Protocol engine for one card on one bus.
///
/// Not synchronised on its own; [`crate::api::SdCard`] owns it behind the
/// bus lock.
pub struct SdEngine<B, D> {
    pub(super) bus: B,
    pub(super) config: SdConfig,
    pub(super) session: SessionInfo,
    pub(super) diagnostics: D,
}

impl<B: SdBus, D: DiagnosticSink> SdEngine<B, D> {
    pub fn new(bus: B, config: SdConfig, diagnostics: D) -> Self {
        Self {
            bus,
            config,
            session: SessionInfo::new(),
            diagnostics,
        }
    }

    pub fn session(&self) -> SessionInfo {
        self.session
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    pub fn config(&self) -> &SdConfig {
        &self.config
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn diagnostics(&self) -> &D {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut D {
        &mut self.diagnostics
    }

    pub fn release(self) -> B {
        self.bus
    }

    /// Drops the session and parks the bus at the probe rate with the card
    /// deselected.
    pub fn initialize(&mut self) -> Result<(), SdError<B::Error>> {
        self.session = SessionInfo::new();
        self.bus
            .set_clock(self.config.probe_clock_hz)
            .map_err(SdError::Bus)?;
        self.bus.deselect().map_err(SdError::Bus)
    }
}
