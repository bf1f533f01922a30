//! Operator-facing odds and ends: indicator LED and reboot button.
//!
//! Purely informational; nothing in the protocol depends on it. The engines
//! drive an [`Indicator`] on state transitions — lit while the advertiser is
//! on air, lit while a scanner holds a confirmed slot. The reboot button has
//! no trait of its own: wire its falling edge to
//! [`Controls::soft_reboot`](crate::advertiser::Controls::soft_reboot),
//! which is safe to call from interrupt context.

/// Something that can show a single on/off state, typically an LED.
pub trait Indicator: Send + Sync {
    /// Sets the indicator state.
    fn set(&self, lit: bool);
}

/// Indicator that goes nowhere; the default.
pub struct NullIndicator;

impl Indicator for NullIndicator {
    fn set(&self, _lit: bool) {}
}

/// Indicator that logs transitions, for headless setups.
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&self, lit: bool) {
        log::info!("indicator {}", if lit { "on" } else { "off" });
    }
}
