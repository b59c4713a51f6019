//! Logical on/off model over the active-low relay channels, including the
//! aggregated main-power relay.
//!
//! The relay board energises on a LOW pin, so logical ON = physical low.
//! State is always read back from the pin itself rather than cached — the
//! hardware and the model cannot drift apart.

use std::collections::HashMap;

use crate::gpio::PinBank;

pub(crate) struct ActuatorState {
    bank: PinBank,
    /// Every claimed output channel, main power included.
    channels: Vec<u8>,
    main_power: u8,
}

impl ActuatorState {
    pub(crate) fn new(bank: PinBank, channels: Vec<u8>, main_power: u8) -> Self {
        Self {
            bank,
            channels,
            main_power,
        }
    }

    /// Logical state of a channel: physical low = ON.
    pub(crate) fn get_logical(&self, channel: u8) -> bool {
        !self.bank.read_level(channel)
    }

    /// Drive a channel to the desired logical state. Returns `true` only on
    /// an actual change; an already-matching channel performs no hardware
    /// write and no main-power reconciliation.
    pub(crate) fn set_logical(&mut self, channel: u8, desired: bool) -> bool {
        if self.get_logical(channel) == desired {
            return false;
        }
        tracing::info!(
            channel,
            state = if desired { "ON" } else { "OFF" },
            "switching channel"
        );
        self.bank.write_level(channel, !desired);
        self.reconcile_main_power();
        true
    }

    /// Main power must equal the OR of every other output channel.
    fn reconcile_main_power(&mut self) {
        let target = self
            .channels
            .iter()
            .filter(|&&ch| ch != self.main_power)
            .any(|&ch| self.get_logical(ch));
        if self.get_logical(self.main_power) != target {
            tracing::info!(
                channel = self.main_power,
                state = if target { "ON" } else { "OFF" },
                "main power follows"
            );
            self.bank.write_level(self.main_power, !target);
        }
    }

    /// Fail-safe sweep: everything logically OFF, main power included.
    pub(crate) fn all_off(&mut self) {
        for ch in self.channels.clone() {
            self.set_logical(ch, false);
        }
    }

    /// An input pin with a pull-up shorts to ground when active, so logical
    /// "detected" = physical low.
    pub(crate) fn read_input_active(&self, pin: u8) -> bool {
        !self.bank.read_input_level(pin)
    }

    pub(crate) fn all_statuses(&self, zones: &[(String, u8)]) -> HashMap<String, &'static str> {
        zones
            .iter()
            .map(|(name, ch)| {
                (
                    name.clone(),
                    if self.get_logical(*ch) { "ON" } else { "OFF" },
                )
            })
            .collect()
    }

    pub(crate) fn channels(&self) -> &[u8] {
        &self.channels
    }

    #[cfg(all(test, not(feature = "gpio")))]
    pub(crate) fn bank_mut(&mut self) -> &mut PinBank {
        &mut self.bank
    }

    #[cfg(all(test, not(feature = "gpio")))]
    pub(crate) fn bank(&self) -> &PinBank {
        &self.bank
    }
}

// ===========================================================================
// Tests
// ===========================================================================
