use bitflags::bitflags;

bitflags! {
    /// Host-facing button mask. Bit positions follow the hardware shift
    /// order, A first (bit 0) through Right (bit 7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Button: u8 {
        const A = 0x01;
        const B = 0x02;
        const SELECT = 0x04;
        const START = 0x08;
        const UP = 0x10;
        const DOWN = 0x20;
        const LEFT = 0x40;
        const RIGHT = 0x80;
    }
}

/// Standard controller: eight buttons latched into a shift register by the
/// strobe at $4016.
#[derive(Debug, Clone, Default)]
pub struct Controller {
    state: Button,
    shift: u8,
    strobe: bool,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.state.set(button, pressed);
    }

    /// Strobe write ($4016). While the strobe is high the shift register
    /// continuously reloads from the current button state.
    pub fn write(&mut self, data: u8) {
        self.strobe = (data & 0x01) != 0;
        if self.strobe {
            self.shift = self.state.bits();
        }
    }

    /// Serial read ($4016). With the strobe high every read reports the A
    /// button; otherwise button bits shift out LSB-first.
    pub fn read(&mut self) -> u8 {
        if self.strobe {
            return self.state.bits() & 0x01;
        }
        let value = self.shift & 0x01;
        self.shift >>= 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strobe_high_repeats_a_button() {
        let mut ctl = Controller::new();
        ctl.set_button(Button::A, true);
        ctl.write(1);
        for _ in 0..5 {
            assert_eq!(ctl.read(), 1);
        }
        ctl.set_button(Button::A, false);
        assert_eq!(ctl.read(), 0);
    }

    #[test]
    fn strobe_release_shifts_buttons_lsb_first() {
        let mut ctl = Controller::new();
        ctl.set_button(Button::A, true);
        ctl.set_button(Button::START, true);
        ctl.set_button(Button::RIGHT, true);
        ctl.write(1);
        ctl.write(0);
        let bits: Vec<u8> = (0..8).map(|_| ctl.read()).collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 1]);
        // Shift register is exhausted after eight reads.
        assert_eq!(ctl.read(), 0);
    }

    #[test]
    fn latch_ignores_presses_after_strobe_release() {
        let mut ctl = Controller::new();
        ctl.set_button(Button::B, true);
        ctl.write(1);
        ctl.write(0);
        ctl.set_button(Button::SELECT, true);
        assert_eq!(ctl.read(), 0); // A
        assert_eq!(ctl.read(), 1); // B
        assert_eq!(ctl.read(), 0); // Select was not latched
    }
}
