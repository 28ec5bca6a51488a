use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::{
    bus::SdBus,
    config::SdConfig,
    diag::{self, DiagnosticSink, DiagnosticSummary, NoDiagnostics},
    probe::{SdEngine, SdError, SessionInfo, SD_SECTOR_SIZE},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RwVerifyResult {
    pub sector: u32,
    pub bytes: usize,
    pub mismatch_index: Option<usize>,
    pub before: u8,
    pub after: u8,
}

/// Shared handle to one SD card.
///
/// Every operation holds the bus lock for one complete transaction, busy
/// waits included. With `CriticalSectionRawMutex` that means interrupts stay
/// masked for the whole transfer. [`SdCard::startup`] polls the card at the
/// probe clock and can hold the lock for seconds; callers that cannot keep
/// interrupts masked that long should pick a thread-mode or RTOS-backed
/// `RawMutex` (`ThreadModeRawMutex` on Cortex-M).
pub struct SdCard<R: RawMutex, B: SdBus, D: DiagnosticSink = NoDiagnostics> {
    engine: Mutex<R, RefCell<SdEngine<B, D>>>,
}

impl<R: RawMutex, B: SdBus, D: DiagnosticSink> SdCard<R, B, D> {
    pub fn new(bus: B, config: SdConfig, diagnostics: D) -> Self {
        Self {
            engine: Mutex::new(RefCell::new(SdEngine::new(bus, config, diagnostics))),
        }
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut SdEngine<B, D>) -> T) -> T {
        self.engine.lock(|engine| f(&mut engine.borrow_mut()))
    }

    pub fn initialize(&self) -> Result<(), SdError<B::Error>> {
        self.with_engine(|engine| engine.initialize())
    }

    /// Runs the full negotiation under one lock. At the probe clock this
    /// may take seconds; see the type docs before using a critical-section
    /// mutex.
    pub fn startup(&self) -> Result<SessionInfo, SdError<B::Error>> {
        self.with_engine(|engine| engine.startup())
    }

    pub fn is_ready(&self) -> bool {
        self.with_engine(|engine| engine.is_ready())
    }

    /// Snapshot taken under the lock; it may be stale by the time it is read.
    pub fn session(&self) -> SessionInfo {
        self.with_engine(|engine| engine.session())
    }

    pub fn read_sector(
        &self,
        out: &mut [u8; SD_SECTOR_SIZE],
        sector: u32,
    ) -> Result<(), SdError<B::Error>> {
        self.with_engine(|engine| engine.read_sector(sector, out))
    }

    /// Reads `count` sectors one CMD17 at a time. Stops at the first failure;
    /// sectors already read stay in `out`.
    pub fn read_range(
        &self,
        out: &mut [u8],
        start: u32,
        count: u32,
    ) -> Result<(), SdError<B::Error>> {
        let needed = range_len(start, count)?;
        let out = out.get_mut(..needed).ok_or(SdError::InvalidRange)?;
        for (offset, chunk) in (0u32..).zip(out.chunks_exact_mut(SD_SECTOR_SIZE)) {
            let chunk: &mut [u8; SD_SECTOR_SIZE] =
                chunk.try_into().map_err(|_| SdError::InvalidRange)?;
            self.read_sector(chunk, start + offset)?;
        }
        Ok(())
    }

    pub fn write_sector_once(
        &self,
        data: &[u8; SD_SECTOR_SIZE],
        sector: u32,
    ) -> Result<(), SdError<B::Error>> {
        self.with_engine(|engine| engine.write_sector_once(sector, data))
    }

    pub fn write_sector(
        &self,
        data: &[u8; SD_SECTOR_SIZE],
        sector: u32,
    ) -> Result<(), SdError<B::Error>> {
        self.with_engine(|engine| engine.write_sector(sector, data))
    }

    /// Writes `count` sectors one CMD24 at a time, stopping at the first
    /// failure.
    pub fn write_range(
        &self,
        data: &[u8],
        start: u32,
        count: u32,
    ) -> Result<(), SdError<B::Error>> {
        let needed = range_len(start, count)?;
        let data = data.get(..needed).ok_or(SdError::InvalidRange)?;
        for (offset, chunk) in (0u32..).zip(data.chunks_exact(SD_SECTOR_SIZE)) {
            let chunk: &[u8; SD_SECTOR_SIZE] =
                chunk.try_into().map_err(|_| SdError::InvalidRange)?;
            self.write_sector(chunk, start + offset)?;
        }
        Ok(())
    }

    /// Reads a sector, writes the same bytes back and reads it again.
    pub fn rw_verify(&self, sector: u32) -> Result<RwVerifyResult, SdError<B::Error>> {
        self.with_engine(|engine| {
            let mut before = [0u8; SD_SECTOR_SIZE];
            engine.read_sector(sector, &mut before)?;
            engine.write_sector(sector, &before)?;
            let mut after = [0u8; SD_SECTOR_SIZE];
            engine.read_sector(sector, &mut after)?;
            let mismatch = before.iter().zip(after.iter()).position(|(a, b)| a != b);
            let result = match mismatch {
                Some(idx) => RwVerifyResult {
                    sector,
                    bytes: SD_SECTOR_SIZE,
                    mismatch_index: Some(idx),
                    before: before[idx],
                    after: after[idx],
                },
                None => RwVerifyResult {
                    sector,
                    bytes: SD_SECTOR_SIZE,
                    mismatch_index: None,
                    before: 0,
                    after: 0,
                },
            };
            log::info!(
                "sdcard: rw_verify sector={} mismatch={:?}",
                sector,
                result.mismatch_index
            );
            Ok(result)
        })
    }

    /// Logs every retained error record, then clears the log.
    pub fn dump_diagnostics(&self) -> DiagnosticSummary {
        self.with_engine(|engine| diag::dump(engine.diagnostics_mut()))
    }

    pub fn clear_diagnostics(&self) {
        self.with_engine(|engine| engine.diagnostics_mut().clear())
    }

    pub fn diagnostics_summary(&self) -> DiagnosticSummary {
        self.with_engine(|engine| engine.diagnostics().summary())
    }

    pub fn bus_mut(&mut self) -> &mut B {
        self.engine.get_mut().get_mut().bus_mut()
    }

    pub fn release(self) -> B {
        self.engine.into_inner().into_inner().release()
    }
}

fn range_len<E>(start: u32, count: u32) -> Result<usize, SdError<E>> {
    if count > 0 {
        start.checked_add(count - 1).ok_or(SdError::InvalidRange)?;
    }
    (count as usize)
        .checked_mul(SD_SECTOR_SIZE)
        .ok_or(SdError::InvalidRange)
}
