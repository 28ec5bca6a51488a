//! Error side channel for the card engine.
//!
//! Records are best-effort: the `Result` returned by each operation is the
//! authoritative error report, and nothing in the protocol reads this log.

use embassy_time::Instant;

use crate::probe::SdErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub command: u8,
    pub kind: SdErrorKind,
    /// Raw R1 or data token behind the failure, 0xFF when there was none.
    pub status: u8,
    pub argument: u32,
    /// CRC-16 carried on the wire: sent by the card on reads, by the host
    /// on writes.
    pub crc_expected: u16,
    /// CRC-16 computed over the received payload, 0 for writes.
    pub crc_actual: u16,
    pub tick: u64,
}

impl ErrorRecord {
    pub const fn new(command: u8, kind: SdErrorKind, status: u8, argument: u32) -> Self {
        Self {
            command,
            kind,
            status,
            argument,
            crc_expected: 0,
            crc_actual: 0,
            tick: 0,
        }
    }

    pub const fn with_crc(mut self, expected: u16, actual: u16) -> Self {
        self.crc_expected = expected;
        self.crc_actual = actual;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticSummary {
    pub total: u32,
    pub retained: usize,
    pub dropped: u32,
}

pub trait DiagnosticSink {
    fn record(&mut self, record: ErrorRecord);

    fn records(&self) -> &[ErrorRecord];

    /// Errors seen since the last clear, including dropped ones.
    fn total(&self) -> u32;

    fn clear(&mut self);

    fn summary(&self) -> DiagnosticSummary {
        let retained = self.records().len();
        DiagnosticSummary {
            total: self.total(),
            retained,
            dropped: self.total().saturating_sub(retained as u32),
        }
    }
}

/// Sink for builds that do not keep an error log.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDiagnostics;

impl DiagnosticSink for NoDiagnostics {
    fn record(&mut self, _record: ErrorRecord) {}

    fn records(&self) -> &[ErrorRecord] {
        &[]
    }

    fn total(&self) -> u32 {
        0
    }

    fn clear(&mut self) {}
}

/// Keeps the first `N` records after a clear; later ones only bump the
/// counter.
#[derive(Debug, Default)]
pub struct ErrorLog<const N: usize> {
    records: heapless::Vec<ErrorRecord, N>,
    total: u32,
}

impl<const N: usize> ErrorLog<N> {
    pub const fn new() -> Self {
        Self {
            records: heapless::Vec::new(),
            total: 0,
        }
    }
}

impl<const N: usize> DiagnosticSink for ErrorLog<N> {
    fn record(&mut self, mut record: ErrorRecord) {
        record.tick = Instant::now().as_ticks();
        let _ = self.records.push(record);
        self.total = self.total.saturating_add(1);
    }

    fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    fn total(&self) -> u32 {
        self.total
    }

    fn clear(&mut self) {
        self.records.clear();
        self.total = 0;
    }
}

/// Writes the log out through `log::error!` and clears it.
pub(crate) fn dump<D: DiagnosticSink>(sink: &mut D) -> DiagnosticSummary {
    let summary = sink.summary();
    if summary.total > 0 {
        log::error!("sdcard: errors total={}", summary.total);
        if summary.dropped > 0 {
            log::error!("sdcard: errors overflowed={}", summary.dropped);
        }
        for record in sink.records() {
            log::error!(
                "sdcard: cmd{} kind={:?} status=0x{:02x} arg={} crc=0x{:04x}/0x{:04x} tick={}",
                record.command,
                record.kind,
                record.status,
                record.argument,
                record.crc_expected,
                record.crc_actual,
                record.tick
            );
        }
    }
    sink.clear();
    summary
}
