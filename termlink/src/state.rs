use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::helpers::timestamp;

/// An ongoing lifecycle operation biasing the state transitions until it
/// completes or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    TurnOn,
    TurnOff,
    Restart,
    Connect,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Request::TurnOn => "turn_on",
            Request::TurnOff => "turn_off",
            Request::Restart => "restart",
            Request::Connect => "connect",
        };
        f.write_str(name)
    }
}

/// Seconds until a pending request is considered expired.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestTimeouts {
    pub turn_on: f64,
    pub turn_off: f64,
    pub restart: f64,
    pub connect: f64,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            turn_on: 60.0,
            turn_off: 30.0,
            restart: 30.0,
            connect: 30.0,
        }
    }
}

impl RequestTimeouts {
    fn timeout(&self, request: Request) -> f64 {
        match request {
            Request::TurnOn => self.turn_on,
            Request::TurnOff => self.turn_off,
            Request::Restart => self.restart,
            Request::Connect => self.connect,
        }
    }
}

/// Copyable view of the state fields, also the `on_change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub online: bool,
    pub connected: bool,
    pub request: Option<Request>,
    pub error: bool,
}

/// Finite-state view over `(online, connected, request, error)`.
///
/// Every assignment that actually changes a field logs it and notifies
/// `on_change`, in assignment order.
#[derive(Debug)]
pub struct State {
    name: String,
    online: bool,
    connected: bool,
    request: Option<Request>,
    error: bool,
    request_timeouts: RequestTimeouts,
    request_timestamp: f64,
    pub on_change: Event<StateSnapshot>,
}

impl State {
    pub fn new(name: &str, request_timeouts: RequestTimeouts) -> Self {
        Self {
            name: name.to_string(),
            online: false,
            connected: false,
            request: None,
            error: false,
            request_timeouts,
            request_timestamp: timestamp(),
            on_change: Event::new(),
        }
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn request(&self) -> Option<Request> {
        self.request
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            online: self.online,
            connected: self.connected,
            request: self.request,
            error: self.error,
        }
    }

    pub fn starting_up(&self) -> bool {
        matches!(self.request, Some(Request::TurnOn) | Some(Request::Connect))
    }

    pub fn shutting_down(&self) -> bool {
        matches!(self.request, Some(Request::TurnOff) | Some(Request::Restart))
    }

    pub fn request_expired(&self) -> bool {
        match self.request {
            Some(request) => {
                timestamp() - self.request_timestamp > self.request_timeouts.timeout(request)
            }
            None => false,
        }
    }

    fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        debug!("{}: state.online => {}", self.name, online);
        self.on_change.notify(&self.snapshot());
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        debug!("{}: state.connected => {}", self.name, connected);
        self.on_change.notify(&self.snapshot());
    }

    fn set_error(&mut self, error: bool) {
        if self.error == error {
            return;
        }
        self.error = error;
        debug!("{}: state.error => {}", self.name, error);
        self.on_change.notify(&self.snapshot());
    }

    fn set_request(&mut self, request: Option<Request>) {
        if self.request == request {
            return;
        }
        self.request = request;
        self.request_timestamp = timestamp();
        match request {
            Some(request) => debug!("{}: state.request => {}", self.name, request),
            None => debug!("{}: state.request => none", self.name),
        }
        self.on_change.notify(&self.snapshot());
    }

    /// Clear the error flag and drop an expired request.
    pub fn update(&mut self) {
        if self.error {
            self.set_error(false);
        }
        if self.request_expired() {
            self.set_request(None);
        }
    }

    pub fn handle_ping_error(&mut self) {
        if self.request == Some(Request::TurnOff) {
            self.set_request(None);
        }
        if self.request == Some(Request::Restart) {
            self.set_request(Some(Request::TurnOn));
        }
        self.set_online(false);
    }

    pub fn handle_ping_success(&mut self) {
        if self.request == Some(Request::TurnOn) {
            self.set_request(Some(Request::Connect));
        }
        self.set_online(true);
    }

    pub fn handle_connect_error(&mut self) {
        self.set_error(true);
    }

    pub fn handle_connect_success(&mut self) {
        if self.request == Some(Request::Connect) {
            self.set_request(None);
        }
        self.set_connected(true);
    }

    pub fn handle_execute_error(&mut self) {
        self.set_error(true);
    }

    pub fn handle_disconnect(&mut self) {
        self.set_connected(false);
    }

    pub fn handle_turn_on(&mut self) {
        self.set_request(Some(Request::TurnOn));
    }

    pub fn handle_turn_off(&mut self) {
        self.set_request(Some(Request::TurnOff));
    }

    pub fn handle_restart(&mut self) {
        self.set_request(Some(Request::Restart));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn state() -> State {
        State::new("test", RequestTimeouts::default())
    }

    #[test]
    fn test_ping_success_promotes_turn_on() {
        let mut state = state();
        state.handle_turn_on();

        state.handle_ping_success();

        assert!(state.online());
        assert_eq!(state.request(), Some(Request::Connect));
        assert!(state.starting_up());
    }

    #[test]
    fn test_ping_error_transitions() {
        let mut state = state();

        state.handle_turn_off();
        state.handle_ping_error();
        assert_eq!(state.request(), None);
        assert!(!state.online());

        state.handle_restart();
        state.handle_ping_error();
        assert_eq!(state.request(), Some(Request::TurnOn));
    }

    #[test]
    fn test_connect_success_clears_connect_request() {
        let mut state = state();
        state.handle_turn_on();
        state.handle_ping_success();

        state.handle_connect_success();

        assert!(state.connected());
        assert_eq!(state.request(), None);
    }

    #[test]
    fn test_update_clears_error() {
        let mut state = state();
        state.handle_execute_error();
        assert!(state.error());

        state.update();
        assert!(!state.error());
    }

    #[test]
    fn test_request_expiry() {
        let mut state = State::new(
            "test",
            RequestTimeouts {
                restart: 0.0,
                ..RequestTimeouts::default()
            },
        );

        state.handle_restart();
        assert!(state.shutting_down());
        assert!(state.request_expired());

        state.update();
        assert_eq!(state.request(), None);
    }

    #[test]
    fn test_on_change_fires_once_per_actual_change() {
        let mut state = state();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        state.on_change.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        state.handle_ping_success();
        state.handle_ping_success();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_change_order_matches_assignments() {
        let mut state = state();
        let seen: Arc<Mutex<Vec<StateSnapshot>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        state.on_change.subscribe(move |snapshot| {
            seen_clone.lock().unwrap().push(*snapshot);
        });

        state.handle_turn_on();
        state.handle_ping_success();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].request, Some(Request::TurnOn));
        assert_eq!(seen[1].request, Some(Request::Connect));
        assert!(seen[2].online);
    }
}
