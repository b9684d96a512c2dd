//! Busy-wait delays on PIT channel 2.
//!
//! Only the bootstrap processor uses this, before the local APIC timer is
//! calibrated and while starting the other CPUs.

use irq::PortIo;

use super::Ports;

const PIT_FREQUENCY: u64 = 1_193_182;
const CHANNEL2_DATA: u16 = 0x42;
const COMMAND: u16 = 0x43;
const SPEAKER_CONTROL: u16 = 0x61;

const GATE: u8 = 1 << 0;
const SPEAKER: u8 = 1 << 1;
const OUTPUT: u8 = 1 << 5;

/// Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count), binary.
const ONE_SHOT: u8 = 0b1011_0000;

/// Longest wait one countdown can express.
const MAX_CHUNK_US: u64 = 50_000;

pub fn delay_us(micros: u64) {
    let mut remaining = micros;
    while remaining > 0 {
        let chunk = remaining.min(MAX_CHUNK_US);
        countdown((PIT_FREQUENCY * chunk / 1_000_000).max(1) as u16);
        remaining -= chunk;
    }
}

fn countdown(ticks: u16) {
    let ports = Ports;
    let control = ports.read_u8(SPEAKER_CONTROL) & !SPEAKER;
    ports.write_u8(SPEAKER_CONTROL, control & !GATE);

    ports.write_u8(COMMAND, ONE_SHOT);
    ports.write_u8(CHANNEL2_DATA, ticks as u8);
    ports.write_u8(CHANNEL2_DATA, (ticks >> 8) as u8);

    // A rising edge on the gate starts the count.
    ports.write_u8(SPEAKER_CONTROL, control | GATE);
    while ports.read_u8(SPEAKER_CONTROL) & OUTPUT == 0 {
        core::hint::spin_loop();
    }
    ports.write_u8(SPEAKER_CONTROL, control & !GATE);
}
