//! Per-connection lifecycle state machine
//!
//! Pure bookkeeping: the machine consumes lifecycle events and returns the
//! [`Action`]s the connection driver must perform. It never touches the
//! socket itself, which keeps every transition testable without I/O.

use crate::error::WebSocketError;
use crate::types::{CloseCode, CloseFrame, ConnectionState, WebSocketMessage};
use tracing::debug;

/// Work the connection driver must carry out after an event
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hand a data message to the gateway dispatcher
    Deliver(WebSocketMessage),
    /// Write a message to the peer (pong replies, keepalive pings, app data)
    Send(WebSocketMessage),
    /// Write a Close frame and arm the closing grace timer
    SendClose(CloseFrame),
    /// Both Close frames have been exchanged; flush and shut the socket down
    Finish,
    /// Drop the socket without any further writes
    Terminate,
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    auto_pong: bool,
    close_sent: bool,
    close_received: bool,
}

impl ConnectionStateMachine {
    pub fn new(auto_pong: bool) -> Self {
        Self {
            state: ConnectionState::Connecting,
            auto_pong,
            close_sent: false,
            close_received: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    pub fn handshake_succeeded(&mut self) {
        self.transition(ConnectionState::Open);
    }

    pub fn handshake_failed(&mut self) {
        self.transition(ConnectionState::Closed);
    }

    /// React to a message decoded from the peer
    pub fn on_message(&mut self, message: WebSocketMessage) -> Vec<Action> {
        match message {
            WebSocketMessage::Ping(payload) => {
                if self.state == ConnectionState::Open && self.auto_pong {
                    vec![Action::Send(WebSocketMessage::Pong(payload))]
                } else {
                    Vec::new()
                }
            }
            WebSocketMessage::Pong(_) => Vec::new(),
            WebSocketMessage::Close(frame) => self.on_close_received(frame),
            data => {
                if self.state == ConnectionState::Open {
                    vec![Action::Deliver(data)]
                } else {
                    debug!("Discarding data message received in state {}", self.state);
                    Vec::new()
                }
            }
        }
    }

    /// React to a decode or protocol failure
    pub fn on_error(&mut self, error: &WebSocketError) -> Vec<Action> {
        match error.close_code() {
            Some(code) => self.fail(CloseFrame::new(code, error.to_string())),
            None => self.terminate(),
        }
    }

    /// Application-initiated close
    pub fn close(&mut self, frame: CloseFrame) -> Vec<Action> {
        if self.state != ConnectionState::Open || self.close_sent {
            return Vec::new();
        }
        self.close_sent = true;
        self.transition(ConnectionState::Closing);
        vec![Action::SendClose(frame)]
    }

    /// The closing grace period elapsed without the peer finishing the handshake
    pub fn on_close_timeout(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Closing {
            self.terminate()
        } else {
            Vec::new()
        }
    }

    /// The socket reached EOF or was released after `Finish`
    pub fn on_socket_end(&mut self) {
        self.transition(ConnectionState::Closed);
    }

    /// Force the connection closed with no further writes
    pub fn terminate(&mut self) -> Vec<Action> {
        if self.state.is_closed() {
            return Vec::new();
        }
        self.transition(ConnectionState::Closed);
        vec![Action::Terminate]
    }

    fn on_close_received(&mut self, frame: Option<CloseFrame>) -> Vec<Action> {
        if self.close_received || self.state.is_closed() {
            return Vec::new();
        }
        self.close_received = true;
        self.transition(ConnectionState::Closing);

        let mut actions = Vec::new();
        if !self.close_sent {
            self.close_sent = true;
            let echo = match frame {
                Some(frame) => CloseFrame::new(frame.code, ""),
                None => CloseFrame::new(CloseCode::Normal, ""),
            };
            actions.push(Action::SendClose(echo));
        }
        actions.push(Action::Finish);
        actions
    }

    fn fail(&mut self, frame: CloseFrame) -> Vec<Action> {
        if self.close_sent || self.state.is_closed() {
            return self.terminate();
        }
        self.close_sent = true;
        self.transition(ConnectionState::Closing);
        vec![Action::SendClose(frame)]
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            debug!("Connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
