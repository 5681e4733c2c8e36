//! Link configuration.

use std::time::Duration;

use orbpack::ReaderLimits;
use orbpack::StrCodec;

use crate::hello::CopyleftInfo;

/// Keep-alive negotiation and enforcement.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepAliveConfig {
    /// Period we ask the peer to send at. `None` leaves the peer silent.
    pub request: Option<Duration>,
    /// Expiry is `period * expire_factor` after the last received message.
    pub expire_factor: f64,
    /// The link closes if the median keep-alive interval falls below
    /// `period * spam_factor`.
    pub spam_factor: f64,
    /// Floor for any period the peer asks us to send at.
    pub min_send: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            request: None,
            expire_factor: 1.5,
            spam_factor: 0.5,
            min_send: Duration::from_secs(300),
        }
    }
}

impl KeepAliveConfig {
    pub fn with_request(mut self, period: Duration) -> Self {
        self.request = Some(period);
        self
    }

    pub fn with_min_send(mut self, min: Duration) -> Self {
        self.min_send = min;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Keep a strong reference to the peer gateway after handing it out.
    pub hold_peer: bool,
    /// Force a close if the handshake has not finished by then.
    pub handshake_timeout: Option<Duration>,
    /// Escalate a graceful shutdown to a forced one after this long.
    pub force_timeout: Option<Duration>,
    /// Clear both reference tables when the link finalizes.
    pub purge: bool,
    /// Default string codec; `None` names the codec in every string.
    pub str_codec: Option<StrCodec>,
    /// License terms announced in the protocol hello.
    pub copyleft: CopyleftInfo,
    pub reader_limits: ReaderLimits,
    pub keep_alive: KeepAliveConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hold_peer: true,
            handshake_timeout: None,
            force_timeout: None,
            purge: false,
            str_codec: Some(StrCodec::Utf8),
            copyleft: CopyleftInfo::default(),
            reader_limits: ReaderLimits::default(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}
