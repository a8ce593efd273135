//! 16-bit truth-table synthesis.
//!
//! Every cell output is a LUT over the four input pins; index bit weights
//! follow pin order, `idx = n | e<<1 | s<<2 | w<<3`. A function that ignores
//! a pin produces a table independent of that pin, so unused pins need no
//! wiring.

use crate::program::Dir;

/// Build a LUT from a boolean function of the four pins (N, E, S, W).
pub fn lut_from_fn(f: impl Fn(bool, bool, bool, bool) -> bool) -> u16 {
    let mut lut = 0u16;
    for idx in 0..16u16 {
        let n = idx & 1 != 0;
        let e = idx & 2 != 0;
        let s = idx & 4 != 0;
        let w = idx & 8 != 0;
        if f(n, e, s, w) {
            lut |= 1 << idx;
        }
    }
    lut
}

/// Table with a 1 wherever the given pin is 1 in the index. This is also the
/// forwarding table of a pass-through cell reading that pin.
pub fn pin_mask(pin: Dir) -> u16 {
    match pin {
        Dir::N => 0xAAAA,
        Dir::E => 0xCCCC,
        Dir::S => 0xF0F0,
        Dir::W => 0xFF00,
    }
}

/// The four output tables of a pure pass-through forwarding `in_pin` to
/// `out_dir`; all other outputs stay zero.
pub fn route_luts(out_dir: Dir, in_pin: Dir) -> [u16; 4] {
    let mut luts = [0u16; 4];
    luts[out_dir.index()] = pin_mask(in_pin);
    luts
}
