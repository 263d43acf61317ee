//! Programmable interval timer, channel 0.

use x86_64::instructions::port::Port;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Input clock of the PIT.
const PIT_FREQ: u32 = 1_193_182;

/// Divisor that makes channel 0 fire at `hz`, clamped to what the 16-bit
/// reload register can hold.
pub fn divisor(hz: u32) -> u16 {
    let raw = PIT_FREQ / hz.max(1);
    raw.clamp(1, u32::from(u16::MAX)) as u16
}

/// Programs channel 0 as a rate generator firing IRQ 0 at `hz`.
pub fn init(hz: u32) {
    let divisor = divisor(hz);
    let mut command = Port::<u8>::new(PIT_COMMAND);
    let mut channel0 = Port::<u8>::new(PIT_CHANNEL0);
    // SAFETY: 0x40 and 0x43 are the PIT's ports; mode 2 with lobyte/hibyte
    // access only changes the timer rate.
    unsafe {
        command.write(0x34);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::info!("pit: {} Hz (divisor {})", hz, divisor);
}
