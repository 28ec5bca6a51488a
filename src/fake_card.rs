//! Byte-level SD card model speaking the SPI-mode protocol, for tests.

use std::{
    collections::{HashMap, VecDeque},
    vec::Vec,
};

use crate::{
    bus::SdBus,
    crc::{crc16, crc7},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeKind {
    Mmc,
    SdV1,
    SdV2 { high_capacity: bool },
}

enum Phase {
    Command,
    WriteToken { addr: u32 },
    WriteData { addr: u32, buf: Vec<u8> },
}

/// Chip select refused to go high.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChipSelectStuck;

pub struct FakeCard {
    kind: FakeKind,
    selected: bool,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    frame_garbled: bool,
    phase: Phase,
    crc_enabled: bool,
    app_pending: bool,
    ready: bool,
    init_polls: u32,

    /// ACMD41/CMD1 polls answered "busy" before the card reports ready.
    pub busy_polls_before_ready: u32,
    pub always_busy: bool,
    pub app_cmd_illegal: bool,
    pub bad_voltage_echo: bool,
    pub no_voltage_window: bool,
    /// Number of upcoming frames whose echo gets garbled.
    pub garble_frames: u32,
    /// Number of upcoming writes answered with a CRC rejection.
    pub reject_write_crc: u32,
    pub corrupt_read_crc: bool,
    pub fail_read_addrs: Vec<u32>,
    pub fail_write_addrs: Vec<u32>,
    pub busy_bytes_after_write: usize,
    /// Number of upcoming CMD0 frames that get no reply at all.
    pub mute_cmd0_frames: u32,
    /// Commands that never get a reply.
    pub mute_commands: Vec<u8>,
    /// Commands answered with a parameter error.
    pub reject_commands: Vec<u8>,
    /// Card drives the line low whenever it is selected.
    pub hold_line_low: bool,
    /// CMD17 is acknowledged but no data token ever follows.
    pub withhold_read_token: bool,
    /// CMD17 is answered with this data error token instead of a block.
    pub read_error_token: Option<u8>,
    /// Data response sent for every write instead of the real outcome.
    pub write_response: Option<u8>,
    pub stuck_chip_select: bool,

    pub commands: Vec<(u8, u32)>,
    pub frames_seen: usize,
    pub idle_clocks_deselected: usize,
    pub clock_changes: Vec<u32>,
    pub storage: HashMap<u32, [u8; 512]>,
}

impl FakeCard {
    pub fn new(kind: FakeKind) -> Self {
        Self {
            kind,
            selected: false,
            out: VecDeque::new(),
            frame: Vec::new(),
            frame_garbled: false,
            phase: Phase::Command,
            crc_enabled: false,
            app_pending: false,
            ready: false,
            init_polls: 0,
            busy_polls_before_ready: 2,
            always_busy: false,
            app_cmd_illegal: false,
            bad_voltage_echo: false,
            no_voltage_window: false,
            garble_frames: 0,
            reject_write_crc: 0,
            corrupt_read_crc: false,
            fail_read_addrs: Vec::new(),
            fail_write_addrs: Vec::new(),
            busy_bytes_after_write: 3,
            mute_cmd0_frames: 0,
            mute_commands: Vec::new(),
            reject_commands: Vec::new(),
            hold_line_low: false,
            withhold_read_token: false,
            read_error_token: None,
            write_response: None,
            stuck_chip_select: false,
            commands: Vec::new(),
            frames_seen: 0,
            idle_clocks_deselected: 0,
            clock_changes: Vec::new(),
            storage: HashMap::new(),
        }
    }

    pub fn count(&self, cmd: u8) -> usize {
        self.commands.iter().filter(|(c, _)| *c == cmd).count()
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn args(&self, cmd: u8) -> Vec<u32> {
        self.commands
            .iter()
            .filter(|(c, _)| *c == cmd)
            .map(|(_, arg)| *arg)
            .collect()
    }

    fn respond(&mut self, r1: u8, extra: &[u8]) {
        // One byte of NCR before the status.
        self.out.push_back(0xFF);
        self.out.push_back(r1);
        self.out.extend(extra.iter().copied());
    }

    fn idle_bit(&self) -> u8 {
        if self.ready {
            0x00
        } else {
            0x01
        }
    }

    fn consume(&mut self, byte: u8) {
        match &mut self.phase {
            Phase::Command => {
                if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
                    return;
                }
                if self.frame.is_empty() && self.garble_frames > 0 {
                    self.garble_frames -= 1;
                    self.frame_garbled = true;
                    self.out.push_back(0x00);
                }
                self.frame.push(byte);
                if self.frame.len() == 6 {
                    let frame = core::mem::take(&mut self.frame);
                    self.frames_seen += 1;
                    if !core::mem::take(&mut self.frame_garbled) {
                        self.execute(&frame);
                    }
                }
            }
            Phase::WriteToken { addr } => {
                if byte == 0xFE {
                    let addr = *addr;
                    self.phase = Phase::WriteData {
                        addr,
                        buf: Vec::with_capacity(514),
                    };
                }
            }
            Phase::WriteData { addr, buf } => {
                buf.push(byte);
                if buf.len() == 514 {
                    let addr = *addr;
                    let buf = core::mem::take(buf);
                    self.phase = Phase::Command;
                    self.finish_write(addr, &buf);
                }
            }
        }
    }

    fn finish_write(&mut self, addr: u32, buf: &[u8]) {
        let received_crc = u16::from_be_bytes([buf[512], buf[513]]);
        let token = if let Some(token) = self.write_response {
            token
        } else if self.reject_write_crc > 0 {
            self.reject_write_crc -= 1;
            0x0B
        } else if crc16(&buf[..512]) != received_crc {
            0x0B
        } else {
            let mut sector = [0u8; 512];
            sector.copy_from_slice(&buf[..512]);
            self.storage.insert(addr, sector);
            0x05
        };
        // Upper bits of the data response are undefined.
        self.out.push_back(0xE0 | token);
        for _ in 0..self.busy_bytes_after_write {
            self.out.push_back(0x00);
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push((cmd, arg));

        if cmd == 0 && self.mute_cmd0_frames > 0 {
            self.mute_cmd0_frames -= 1;
            return;
        }
        if self.mute_commands.contains(&cmd) {
            return;
        }
        if (self.crc_enabled || cmd == 0 || cmd == 8) && crc7(&frame[..5]) != frame[5] {
            let r1 = self.idle_bit() | 0x08;
            self.respond(r1, &[]);
            return;
        }

        let app = core::mem::take(&mut self.app_pending);
        let idle = self.idle_bit();
        if self.reject_commands.contains(&cmd) {
            self.respond(idle | 0x40, &[]);
            return;
        }
        match cmd {
            0 => {
                self.ready = false;
                self.crc_enabled = false;
                self.init_polls = 0;
                self.respond(0x01, &[]);
            }
            8 => match self.kind {
                FakeKind::SdV2 { .. } => {
                    let check = if self.bad_voltage_echo {
                        0x55
                    } else {
                        arg as u8
                    };
                    self.respond(idle, &[0x00, 0x00, ((arg >> 8) & 0x0F) as u8, check]);
                }
                FakeKind::SdV1 | FakeKind::Mmc => self.respond(idle | 0x04, &[]),
            },
            55 => {
                if self.app_cmd_illegal || self.kind == FakeKind::Mmc {
                    self.respond(idle | 0x04, &[]);
                } else {
                    self.app_pending = true;
                    self.respond(idle, &[]);
                }
            }
            41 if app => self.poll_init(),
            1 => self.poll_init(),
            58 => {
                let ccs = match self.kind {
                    FakeKind::SdV2 {
                        high_capacity: true,
                    } => 0x40,
                    _ => 0x00,
                };
                let window = if self.no_voltage_window { 0x00 } else { 0xFF };
                self.respond(idle, &[0x80 | ccs, window, 0x80, 0x00]);
            }
            16 => {
                let r1 = if arg == 512 { idle } else { idle | 0x40 };
                self.respond(r1, &[]);
            }
            59 => {
                self.crc_enabled = (arg & 1) != 0;
                self.respond(idle, &[]);
            }
            17 if self.ready => {
                if self.fail_read_addrs.contains(&arg) {
                    self.respond(0x20, &[]);
                    return;
                }
                if self.withhold_read_token {
                    self.respond(0x00, &[]);
                    return;
                }
                if let Some(token) = self.read_error_token {
                    self.respond(0x00, &[0xFF, token]);
                    return;
                }
                let data = self.storage.get(&arg).copied().unwrap_or([0u8; 512]);
                let mut crc = crc16(&data);
                if self.corrupt_read_crc {
                    crc ^= 0x0001;
                }
                self.respond(0x00, &[0xFF, 0xFE]);
                self.out.extend(data.iter().copied());
                self.out.extend(crc.to_be_bytes());
            }
            24 if self.ready => {
                if self.fail_write_addrs.contains(&arg) {
                    self.respond(0x20, &[]);
                    return;
                }
                self.respond(0x00, &[]);
                self.phase = Phase::WriteToken { addr: arg };
            }
            _ => self.respond(idle | 0x04, &[]),
        }
    }

    fn poll_init(&mut self) {
        self.init_polls += 1;
        if !self.always_busy && self.init_polls > self.busy_polls_before_ready {
            self.ready = true;
            self.respond(0x00, &[]);
        } else {
            self.respond(0x01, &[]);
        }
    }
}

impl SdBus for FakeCard {
    type Error = ChipSelectStuck;

    fn transceive(&mut self, byte: u8) -> Result<u8, ChipSelectStuck> {
        if !self.selected {
            self.idle_clocks_deselected += 1;
            return Ok(0xFF);
        }
        if self.hold_line_low {
            return Ok(0x00);
        }
        let reply = self.out.pop_front().unwrap_or(0xFF);
        self.consume(byte);
        Ok(reply)
    }

    fn transceive_block(&mut self, buf: &mut [u8]) -> Result<(), ChipSelectStuck> {
        for slot in buf {
            *slot = self.transceive(*slot)?;
        }
        Ok(())
    }

    fn send_block(&mut self, buf: &[u8]) -> Result<(), ChipSelectStuck> {
        for &byte in buf {
            let _ = self.transceive(byte)?;
        }
        Ok(())
    }

    fn set_clock(&mut self, hz: u32) -> Result<(), ChipSelectStuck> {
        self.clock_changes.push(hz);
        Ok(())
    }

    fn select(&mut self) -> Result<(), ChipSelectStuck> {
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), ChipSelectStuck> {
        if self.stuck_chip_select {
            return Err(ChipSelectStuck);
        }
        self.selected = false;
        self.out.clear();
        self.frame.clear();
        self.frame_garbled = false;
        self.phase = Phase::Command;
        Ok(())
    }
}
