//! Simulated I/O board.
//!
//! The `SimulatedBoard` models:
//! - A physical input image with per-bit contact control
//! - Meter coils that count a pulse on each raise/lower cycle
//! - Fault injection for handshake, communication and self-test failures

use egm_common::consts::{MAX_PHYSICAL_BITS, width_mask};
use tracing::{debug, trace};

/// In-memory board state.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    /// Current input contacts
    inputs: u64,
    /// Meaningful input bits
    input_mask: u64,
    /// Configured meter bits
    meter_mask: u64,
    /// Energized meter coils
    outputs: u64,
    /// Status bits reported set regardless of coil state
    stuck_status: u64,
    /// Completed pulses per physical meter bit
    pulses: [u64; MAX_PHYSICAL_BITS],
    /// Total raise requests seen
    raises: u64,
    /// Raise request number that will fail to energize
    fail_raise_at: Option<u64>,
    /// Communication failure on every access
    offline: bool,
    /// Self test result
    self_test_ok: bool,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new(MAX_PHYSICAL_BITS as u8, 0)
    }
}

impl SimulatedBoard {
    /// Create a board with `width` input bits and the given meter bits.
    pub fn new(width: u8, meter_mask: u64) -> Self {
        debug!(
            "SimulatedBoard: {} input bits, meter mask {:#x}",
            width, meter_mask
        );
        Self {
            inputs: 0,
            input_mask: width_mask(width),
            meter_mask,
            outputs: 0,
            stuck_status: 0,
            pulses: [0; MAX_PHYSICAL_BITS],
            raises: 0,
            fail_raise_at: None,
            offline: false,
            self_test_ok: true,
        }
    }

    /// Current input image.
    pub fn inputs(&self) -> u64 {
        self.inputs & self.input_mask
    }

    /// Set one input contact.
    pub fn set_input(&mut self, bit: u8, on: bool) {
        let mask = 1u64 << bit;
        if on {
            self.inputs |= mask;
        } else {
            self.inputs &= !mask;
        }
        trace!("input {} -> {}", bit, on);
    }

    /// Replace the whole input image.
    pub fn set_inputs(&mut self, bits: u64) {
        self.inputs = bits;
    }

    /// Raise meter coils. Bits outside the meter mask are ignored.
    pub fn raise(&mut self, mask: u64) {
        self.raises += 1;
        if self.fail_raise_at == Some(self.raises) {
            self.fail_raise_at = None;
            debug!("injected fault: raise #{} does not energize", self.raises);
            return;
        }
        self.outputs |= mask & self.meter_mask;
    }

    /// Lower meter coils, counting a pulse for each coil that was raised.
    pub fn lower(&mut self, mask: u64) {
        let completed = self.outputs & mask;
        for bit in 0..MAX_PHYSICAL_BITS {
            if completed & (1u64 << bit) != 0 {
                self.pulses[bit] += 1;
            }
        }
        self.outputs &= !mask;
    }

    /// Status restricted to `mask`.
    pub fn status(&self, mask: u64) -> u64 {
        (self.outputs | self.stuck_status) & mask
    }

    /// Completed pulses on one meter bit.
    pub fn pulses(&self, bit: u8) -> u64 {
        self.pulses[bit as usize]
    }

    /// Make the `nth` raise from now (1 = next) fail to energize.
    pub fn fail_raise(&mut self, nth: u64) {
        self.fail_raise_at = Some(self.raises + nth);
    }

    /// Report `mask` as set in every status read.
    pub fn set_stuck_status(&mut self, mask: u64) {
        self.stuck_status = mask;
    }

    /// Toggle communication failure.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Whether the board is unreachable.
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Toggle self test outcome.
    pub fn set_self_test_ok(&mut self, ok: bool) {
        self.self_test_ok = ok;
    }

    /// Self test outcome.
    pub fn self_test_ok(&self) -> bool {
        self.self_test_ok
    }
}
