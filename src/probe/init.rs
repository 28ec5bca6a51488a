use super::{
    core::{
        CardGeneration, CapacityClass, ClockMode, SdEngine, SdError, SessionInfo, SessionState,
        ACMD41_HCS, IF_COND_ARG, R1_ERROR_MASK, R1_IDLE, R1_ILLEGAL_COMMAND, SD_ACMD41, SD_CMD0,
        SD_CMD1, SD_CMD16, SD_CMD58, SD_CMD59, SD_CMD8, SD_SECTOR_SIZE,
    },
    helpers::{ocr_capacity, ocr_supports_voltage},
};
use crate::{bus::SdBus, diag::DiagnosticSink};

impl<B: SdBus, D: DiagnosticSink> SdEngine<B, D> {
    /// Runs the full negotiation and leaves the session `Ready`, or
    /// `Faulted` with the failing error kind.
    ///
    /// A faulted session stays faulted until [`SdEngine::initialize`] runs
    /// again.
    pub fn startup(&mut self) -> Result<SessionInfo, SdError<B::Error>> {
        if let SessionState::Faulted(_) = self.session.state {
            return Err(SdError::NotReady);
        }
        match self.negotiate() {
            Ok(()) => {
                log::info!(
                    "sdcard: startup version={} capacity={}",
                    generation_label(self.session.generation),
                    capacity_label(self.session.capacity)
                );
                Ok(self.session)
            }
            Err(err) => {
                log::error!(
                    "sdcard: startup failed phase={:?} err={:?}",
                    self.session.state,
                    err.kind()
                );
                self.session.state = SessionState::Faulted(err.kind());
                Err(err)
            }
        }
    }

    fn negotiate(&mut self) -> Result<(), SdError<B::Error>> {
        self.session = SessionInfo::new();
        self.reset_card()?;
        let generation = self.check_voltage()?;
        let generation = self.wait_idle_exit(generation)?;
        self.session.generation = generation;
        self.check_capacity()?;
        self.configure()?;

        self.bus
            .set_clock(self.config.operational_clock_hz)
            .map_err(SdError::Bus)?;
        self.session.clock = ClockMode::Operational;
        self.session.state = SessionState::Ready;
        Ok(())
    }

    fn reset_card(&mut self) -> Result<(), SdError<B::Error>> {
        self.session.state = SessionState::Probing;
        self.bus
            .set_clock(self.config.probe_clock_hz)
            .map_err(SdError::Bus)?;
        self.session.clock = ClockMode::Probe;
        self.bus.deselect().map_err(SdError::Bus)?;
        log::debug!(
            "sdcard: power_up clocks={}",
            self.config.power_up_idle_bytes * 8
        );
        self.send_idle_clocks(self.config.power_up_idle_bytes)?;

        let mut attempts = self.config.reset_attempts.max(1);
        loop {
            match self.send_command(SD_CMD0, 0, &mut []) {
                Ok(R1_IDLE) => return Ok(()),
                Ok(r1) => log::debug!("sdcard: cmd0_r1=0x{:02x}", r1),
                Err(SdError::TransmissionInterrupted) => {
                    log::debug!("sdcard: cmd0 transmission_interrupted");
                }
                // Cards often stay silent on the first CMD0 after power-up.
                Err(SdError::NoResponse(_)) => log::debug!("sdcard: cmd0 no_response"),
                Err(err) => return Err(err),
            }
            attempts -= 1;
            if attempts == 0 {
                return Err(SdError::ResetTimeout);
            }
        }
    }

    fn check_voltage(&mut self) -> Result<CardGeneration, SdError<B::Error>> {
        self.session.state = SessionState::VoltageCheck;
        let mut r7 = [0u8; 4];
        let r1 = self.send_command(SD_CMD8, IF_COND_ARG, &mut r7)?;
        if (r1 & R1_ILLEGAL_COMMAND) != 0 {
            log::debug!("sdcard: cmd8 illegal, assuming v1");
            return Ok(CardGeneration::SdV1);
        }
        if (r1 & R1_ERROR_MASK) != 0 {
            return Err(SdError::Rejected { cmd: SD_CMD8, r1 });
        }
        let [_, _, voltage, pattern] = IF_COND_ARG.to_be_bytes();
        if r7[2] != voltage || r7[3] != pattern {
            log::error!(
                "sdcard: cmd8_echo={:02x}{:02x}{:02x}{:02x} no 2.7-3.6V support",
                r7[0],
                r7[1],
                r7[2],
                r7[3]
            );
            return Err(SdError::UnsupportedVoltage(r7));
        }
        Ok(CardGeneration::SdV2)
    }

    fn wait_idle_exit(
        &mut self,
        mut generation: CardGeneration,
    ) -> Result<CardGeneration, SdError<B::Error>> {
        self.session.state = SessionState::IdleWait;
        for _ in 0..self.config.idle_wait_iterations {
            let r1 = match generation {
                CardGeneration::SdV2 => self.send_app_command(SD_ACMD41, ACMD41_HCS, &mut [])?,
                CardGeneration::SdV1 => self.send_app_command(SD_ACMD41, 0, &mut [])?,
                CardGeneration::Mmc => self.send_command(SD_CMD1, 0, &mut [])?,
            };
            if generation != CardGeneration::Mmc && (r1 & R1_ILLEGAL_COMMAND) != 0 {
                log::debug!("sdcard: acmd41 illegal, assuming mmc");
                generation = CardGeneration::Mmc;
                continue;
            }
            if r1 == 0x00 {
                return Ok(generation);
            }
        }
        Err(SdError::IdleWaitTimeout)
    }

    fn check_capacity(&mut self) -> Result<(), SdError<B::Error>> {
        self.session.state = SessionState::CapacityCheck;
        let mut ocr = [0u8; 4];
        let r1 = self.send_command(SD_CMD58, 0, &mut ocr)?;
        if (r1 & R1_ERROR_MASK) != 0 {
            return Err(SdError::Rejected { cmd: SD_CMD58, r1 });
        }
        self.session.ocr = ocr;
        if !ocr_supports_voltage(&ocr) {
            return Err(SdError::VoltageNotSupported);
        }
        self.session.capacity = match self.session.generation {
            CardGeneration::Mmc => CapacityClass::Standard,
            CardGeneration::SdV1 | CardGeneration::SdV2 => ocr_capacity(&ocr),
        };
        Ok(())
    }

    fn configure(&mut self) -> Result<(), SdError<B::Error>> {
        self.session.state = SessionState::Configuring;
        let r1 = self.send_command(SD_CMD16, SD_SECTOR_SIZE as u32, &mut [])?;
        if r1 != 0x00 {
            return Err(SdError::Rejected { cmd: SD_CMD16, r1 });
        }
        let r1 = self.send_command(SD_CMD59, 1, &mut [])?;
        if r1 != 0x00 {
            return Err(SdError::Rejected { cmd: SD_CMD59, r1 });
        }
        Ok(())
    }
}

fn generation_label(generation: CardGeneration) -> &'static str {
    match generation {
        CardGeneration::Mmc => "mmc",
        CardGeneration::SdV1 => "v1.x",
        CardGeneration::SdV2 => "v2+",
    }
}

fn capacity_label(capacity: CapacityClass) -> &'static str {
    match capacity {
        CapacityClass::Standard => "sdsc",
        CapacityClass::High => "sdhc_or_sdxc",
    }
}
