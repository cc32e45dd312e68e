use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// Outcome of feeding one transport event into a [`LinkTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTransition {
    /// First connection, or a reconnect that did not follow a recorded loss.
    Connected,
    Recovered { downtime_ms: u64 },
    LossDetected { loss_count: u64 },
    Lost,
    Ended,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub state: ConnectionState,
    #[serde(rename = "firstAttempt")]
    pub first_attempt: bool,
    pub reconnecting: bool,
    #[serde(rename = "connectionLossCount")]
    pub connection_loss_count: u64,
    #[serde(rename = "lastLossMs")]
    pub last_loss_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LinkTracker {
    state: ConnectionState,
    first_attempt: bool,
    reconnecting: bool,
    connection_loss_count: u64,
    last_loss_ms: Option<u64>,
}

impl Default for LinkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            first_attempt: true,
            reconnecting: false,
            connection_loss_count: 0,
            last_loss_ms: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_first_attempt(&self) -> bool {
        self.first_attempt
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn connection_loss_count(&self) -> u64 {
        self.connection_loss_count
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.state,
            first_attempt: self.first_attempt,
            reconnecting: self.reconnecting,
            connection_loss_count: self.connection_loss_count,
            last_loss_ms: self.last_loss_ms,
        }
    }

    pub fn on_connect(&mut self, now_ms: u64) -> LinkTransition {
        self.state = ConnectionState::Connected;
        self.first_attempt = false;

        if !self.reconnecting {
            return LinkTransition::Connected;
        }

        self.reconnecting = false;
        let downtime_ms = self
            .last_loss_ms
            .map(|lost_at| now_ms.saturating_sub(lost_at))
            .unwrap_or(0);
        LinkTransition::Recovered { downtime_ms }
    }

    /// The transport fires this before every retry, including repeatedly
    /// during one outage. Only the first one after a live connection counts.
    pub fn on_reconnect_attempt(&mut self, now_ms: u64) -> LinkTransition {
        if self.first_attempt || self.reconnecting {
            return LinkTransition::Unchanged;
        }

        // Loss transitions advance the counter by two.
        self.connection_loss_count += 2;
        self.reconnecting = true;
        self.last_loss_ms = Some(now_ms);
        LinkTransition::LossDetected {
            loss_count: self.connection_loss_count,
        }
    }

    pub fn on_error(&mut self) -> LinkTransition {
        if self.first_attempt {
            self.state = ConnectionState::Disconnected;
        }

        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            return LinkTransition::Lost;
        }

        LinkTransition::Unchanged
    }

    /// A closed connection is not retried, so any outage in progress is over.
    pub fn on_end(&mut self) -> LinkTransition {
        self.state = ConnectionState::Disconnected;
        self.reconnecting = false;
        LinkTransition::Ended
    }

    /// Local teardown; not a loss.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}
