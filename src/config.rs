pub const SD_PROBE_CLOCK_HZ: u32 = 100_000;
pub const SD_OPERATIONAL_CLOCK_HZ: u32 = 10_000_000;
// 80 clocks, above the 74 the card needs after power-up.
pub const SD_POWER_UP_IDLE_BYTES: usize = 10;
pub const SD_RESET_ATTEMPTS: u32 = 16;
// Slow SDHC cards have been seen taking ~200 ms to leave idle.
pub const SD_IDLE_WAIT_ITERATIONS: u32 = 10_000;
pub const SD_BUS_IDLE_POLLS: u32 = 64;
pub const SD_RESPONSE_POLLS: u32 = 16;
pub const SD_DATA_TOKEN_POLLS: u32 = 50_000;
pub const SD_WRITE_BUSY_POLLS: u32 = 200_000;
pub const SD_WRITE_CHECKSUM_RETRIES: u32 = 3;

/// Clock rates and polling bounds for one card session.
///
/// Every wait in the driver is counted in bus bytes or command attempts
/// against one of these limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdConfig {
    pub probe_clock_hz: u32,
    pub operational_clock_hz: u32,
    pub power_up_idle_bytes: usize,
    pub reset_attempts: u32,
    pub idle_wait_iterations: u32,
    pub bus_idle_polls: u32,
    pub response_polls: u32,
    pub data_token_polls: u32,
    pub write_busy_polls: u32,
    pub write_checksum_retries: u32,
}

impl SdConfig {
    pub const fn new() -> Self {
        Self {
            probe_clock_hz: SD_PROBE_CLOCK_HZ,
            operational_clock_hz: SD_OPERATIONAL_CLOCK_HZ,
            power_up_idle_bytes: SD_POWER_UP_IDLE_BYTES,
            reset_attempts: SD_RESET_ATTEMPTS,
            idle_wait_iterations: SD_IDLE_WAIT_ITERATIONS,
            bus_idle_polls: SD_BUS_IDLE_POLLS,
            response_polls: SD_RESPONSE_POLLS,
            data_token_polls: SD_DATA_TOKEN_POLLS,
            write_busy_polls: SD_WRITE_BUSY_POLLS,
            write_checksum_retries: SD_WRITE_CHECKSUM_RETRIES,
        }
    }

    pub const fn with_clocks(mut self, probe_hz: u32, operational_hz: u32) -> Self {
        self.probe_clock_hz = probe_hz;
        self.operational_clock_hz = operational_hz;
        self
    }

    pub const fn with_reset_attempts(mut self, attempts: u32) -> Self {
        self.reset_attempts = attempts;
        self
    }

    pub const fn with_idle_wait_iterations(mut self, iterations: u32) -> Self {
        self.idle_wait_iterations = iterations;
        self
    }

    pub const fn with_response_polls(mut self, polls: u32) -> Self {
        self.response_polls = polls;
        self
    }

    pub const fn with_data_token_polls(mut self, polls: u32) -> Self {
        self.data_token_polls = polls;
        self
    }

    pub const fn with_write_busy_polls(mut self, polls: u32) -> Self {
        self.write_busy_polls = polls;
        self
    }

    pub const fn with_write_checksum_retries(mut self, retries: u32) -> Self {
        self.write_checksum_retries = retries;
        self
    }
}

impl Default for SdConfig {
    fn default() -> Self {
        Self::new()
    }
}
