use super::{
    core::{
        SdEngine, SdError, DATA_ACCEPTED, DATA_CRC_REJECTED, DATA_RESPONSE_MASK, DATA_START_TOKEN,
        IDLE_BYTE, R1_ERROR_MASK, R1_START_BIT, SD_CMD17, SD_CMD18, SD_CMD24, SD_CMD55,
        SD_SECTOR_SIZE,
    },
    helpers::{frame_command, sector_address},
};
use crate::{
    bus::SdBus,
    crc::crc16,
    diag::{DiagnosticSink, ErrorRecord},
};

impl<B: SdBus, D: DiagnosticSink> SdEngine<B, D> {
    pub fn read_sector(
        &mut self,
        sector: u32,
        out: &mut [u8; SD_SECTOR_SIZE],
    ) -> Result<(), SdError<B::Error>> {
        self.ensure_ready()?;
        let (err, received, computed) = match self.read_data_sector_into(sector, out) {
            Ok((received, computed)) if received == computed => return Ok(()),
            Ok((received, computed)) => (SdError::ChecksumFailed, received, computed),
            Err(err) => (err, 0, 0),
        };
        self.record_error(SD_CMD17, &err, sector, received, computed);
        Err(err)
    }

    /// One CMD24 transaction with no retry.
    pub fn write_sector_once(
        &mut self,
        sector: u32,
        data: &[u8; SD_SECTOR_SIZE],
    ) -> Result<(), SdError<B::Error>> {
        self.ensure_ready()?;
        let crc = crc16(data);
        let result = self.write_data_sector(sector, data, crc);
        if let Err(err) = &result {
            self.record_error(SD_CMD24, err, sector, crc, 0);
        }
        result
    }

    /// CMD24 retried on CRC rejection. Every attempt spends one unit of
    /// `write_checksum_retries`, whatever its outcome.
    pub fn write_sector(
        &mut self,
        sector: u32,
        data: &[u8; SD_SECTOR_SIZE],
    ) -> Result<(), SdError<B::Error>> {
        let mut budget = self.config.write_checksum_retries.max(1);
        loop {
            let result = self.write_sector_once(sector, data);
            budget -= 1;
            match result {
                Err(SdError::ChecksumFailed) if budget > 0 => {
                    log::warn!(
                        "sdcard: write crc_rejected sector={} retries_left={}",
                        sector,
                        budget
                    );
                }
                other => return other,
            }
        }
    }

    pub(super) fn ensure_ready(&self) -> Result<(), SdError<B::Error>> {
        if self.session.is_ready() {
            Ok(())
        } else {
            Err(SdError::NotReady)
        }
    }

    fn record_error(
        &mut self,
        cmd: u8,
        err: &SdError<B::Error>,
        sector: u32,
        crc_expected: u16,
        crc_actual: u16,
    ) {
        let record = ErrorRecord::new(cmd, err.kind(), err.status().unwrap_or(IDLE_BYTE), sector)
            .with_crc(crc_expected, crc_actual);
        self.diagnostics.record(record);
    }

    /// Returns the CRC-16 sent by the card and the one computed over `out`.
    fn read_data_sector_into(
        &mut self,
        sector: u32,
        out: &mut [u8; SD_SECTOR_SIZE],
    ) -> Result<(u16, u16), SdError<B::Error>> {
        let arg = sector_address(self.session.capacity, sector)?;
        self.send_command_hold_cs(SD_CMD17, arg, &mut [])?;
        let result = self.read_data_block(SD_CMD17, out);
        self.close_transaction(result)
    }

    fn write_data_sector(
        &mut self,
        sector: u32,
        data: &[u8; SD_SECTOR_SIZE],
        crc: u16,
    ) -> Result<(), SdError<B::Error>> {
        let arg = sector_address(self.session.capacity, sector)?;
        let r1 = self.send_command_hold_cs(SD_CMD24, arg, &mut [])?;
        if r1 != 0x00 {
            return self.close_transaction(Err(SdError::Rejected { cmd: SD_CMD24, r1 }));
        }
        let result = self.send_data_block(data, crc);
        self.close_transaction(result)
    }

    fn send_data_block(
        &mut self,
        data: &[u8; SD_SECTOR_SIZE],
        crc: u16,
    ) -> Result<(), SdError<B::Error>> {
        let _ = self.transfer_byte(IDLE_BYTE)?;
        let _ = self.transfer_byte(DATA_START_TOKEN)?;
        self.bus.send_block(data).map_err(SdError::Bus)?;
        let [crc_hi, crc_lo] = crc.to_be_bytes();
        let _ = self.transfer_byte(crc_hi)?;
        let _ = self.transfer_byte(crc_lo)?;

        let response = self.transfer_byte(IDLE_BYTE)? & DATA_RESPONSE_MASK;
        // Busy is signalled even after a rejected block.
        let released = self.wait_not_busy()?;
        match response {
            DATA_ACCEPTED if released => Ok(()),
            DATA_ACCEPTED => Err(SdError::WriteBusyTimeout),
            DATA_CRC_REJECTED => Err(SdError::ChecksumFailed),
            other => Err(SdError::WriteRejected(other)),
        }
    }

    fn wait_not_busy(&mut self) -> Result<bool, SdError<B::Error>> {
        for _ in 0..self.config.write_busy_polls {
            if self.transfer_byte(IDLE_BYTE)? == IDLE_BYTE {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Data phase of a block read: start token, payload, CRC-16. The CRC
    /// is handed back unchecked as `(received, computed)`.
    pub(super) fn read_data_block(
        &mut self,
        cmd: u8,
        out: &mut [u8],
    ) -> Result<(u16, u16), SdError<B::Error>> {
        let mut token = IDLE_BYTE;
        for _ in 0..self.config.data_token_polls {
            token = self.transfer_byte(IDLE_BYTE)?;
            if token != IDLE_BYTE {
                break;
            }
        }
        if token == IDLE_BYTE {
            return Err(SdError::DataTokenTimeout(cmd));
        }
        if token != DATA_START_TOKEN {
            return Err(SdError::DataTokenUnexpected(cmd, token));
        }

        out.fill(IDLE_BYTE);
        self.bus.transceive_block(out).map_err(SdError::Bus)?;
        let crc_hi = self.transfer_byte(IDLE_BYTE)?;
        let crc_lo = self.transfer_byte(IDLE_BYTE)?;
        Ok((u16::from_be_bytes([crc_hi, crc_lo]), crc16(out)))
    }

    /// CMD55 followed by `cmd`. A CMD55 status carrying an error bit
    /// (illegal command included) is returned as is and `cmd` is never sent.
    pub(super) fn send_app_command(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError<B::Error>> {
        let r1 = self.send_command(SD_CMD55, 0, &mut [])?;
        if (r1 & R1_ERROR_MASK) != 0 {
            return Ok(r1);
        }
        self.send_command(cmd, arg, extra_response)
    }

    pub(super) fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError<B::Error>> {
        self.send_command_inner(cmd, arg, extra_response, true)
    }

    pub(super) fn send_command_hold_cs(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError<B::Error>> {
        self.send_command_inner(cmd, arg, extra_response, false)
    }

    fn send_command_inner(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
        release_cs_after: bool,
    ) -> Result<u8, SdError<B::Error>> {
        self.bus.select().map_err(SdError::Bus)?;
        let result = self.exchange_command(cmd, arg, extra_response);
        if release_cs_after || result.is_err() {
            return self.close_transaction(result);
        }
        result
    }

    fn exchange_command(
        &mut self,
        cmd: u8,
        arg: u32,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError<B::Error>> {
        self.wait_bus_idle()?;

        let mut frame = frame_command(cmd, arg);
        self.bus
            .transceive_block(&mut frame)
            .map_err(SdError::Bus)?;
        if frame.iter().any(|&echo| echo != IDLE_BYTE) {
            return Err(SdError::TransmissionInterrupted);
        }

        let mut r1 = IDLE_BYTE;
        for _ in 0..self.config.response_polls {
            r1 = self.transfer_byte(IDLE_BYTE)?;
            if (r1 & R1_START_BIT) == 0 {
                break;
            }
        }
        if (r1 & R1_START_BIT) != 0 {
            return Err(SdError::NoResponse(cmd));
        }

        if matches!(cmd, SD_CMD17 | SD_CMD18) && r1 != 0x00 {
            return Err(SdError::Rejected { cmd, r1 });
        }

        if !extra_response.is_empty() {
            extra_response.fill(IDLE_BYTE);
            self.bus
                .transceive_block(extra_response)
                .map_err(SdError::Bus)?;
        }
        Ok(r1)
    }

    fn wait_bus_idle(&mut self) -> Result<(), SdError<B::Error>> {
        for _ in 0..self.config.bus_idle_polls.max(1) {
            if self.transfer_byte(IDLE_BYTE)? == IDLE_BYTE {
                return Ok(());
            }
        }
        Err(SdError::BusNotIdle)
    }

    pub(super) fn send_idle_clocks(&mut self, bytes: usize) -> Result<(), SdError<B::Error>> {
        for _ in 0..bytes {
            let _ = self.transfer_byte(IDLE_BYTE)?;
        }
        Ok(())
    }

    pub(super) fn transfer_byte(&mut self, byte: u8) -> Result<u8, SdError<B::Error>> {
        self.bus.transceive(byte).map_err(SdError::Bus)
    }

    /// Releases chip select after `result`. The first error wins: a failed
    /// release only surfaces when the transaction itself succeeded.
    fn close_transaction<T>(
        &mut self,
        result: Result<T, SdError<B::Error>>,
    ) -> Result<T, SdError<B::Error>> {
        let released = self.end_transaction();
        let value = result?;
        released?;
        Ok(value)
    }

    fn end_transaction(&mut self) -> Result<(), SdError<B::Error>> {
        self.bus.deselect().map_err(SdError::Bus)?;
        self.transfer_byte(IDLE_BYTE).map(|_| ())
    }
}
