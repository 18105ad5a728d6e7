/// What the local media stack supports.
///
/// Detected once at startup and handed to the negotiation engine; nothing
/// downstream inspects the platform on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// SDP uses one m-line per track
    pub unified_plan: bool,
    /// Receive-only offers need explicit recv-only transceivers rather than
    /// offer options
    pub explicit_receive_transceivers: bool,
}

impl PlatformCapabilities {
    /// Capabilities of the built-in webrtc-rs stack
    pub fn detect() -> Self {
        let capabilities = Self {
            unified_plan: true,
            explicit_receive_transceivers: true,
        };
        tracing::debug!("Platform capabilities: {:?}", capabilities);
        capabilities
    }

    /// Value of the `planb` flag sent with `join`
    pub fn plan_b(&self) -> bool {
        !self.unified_plan
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}
