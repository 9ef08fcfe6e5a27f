//! Monitor and control remote hosts by running shell commands over a
//! pluggable terminal transport.
//!
//! A [`Manager`] owns a catalog ([`Collection`]) of action commands
//! (one-shot effects) and sensor commands (commands whose stdout is
//! parsed into typed [`Sensor`] values), plus a [`Terminal`]
//! implementation supplied by the caller. Command strings are templates:
//! `@{name}` placeholders take caller variables, `&{name}` placeholders
//! take the current value of another sensor, which is polled first.

pub mod collection;
pub mod command;
pub mod default_collections;
pub mod error;
pub mod event;
pub mod manager;
pub mod renderer;
pub mod sensor;
pub mod state;
pub mod template;
pub mod terminal;
pub mod value;

mod helpers;

pub use collection::Collection;
pub use command::{ActionCommand, Command, SensorCommand};
pub use error::{ManagerError, Result};
pub use event::{Event, Subscription};
pub use manager::{Manager, ManagerConfig, UpdateOptions, Variables};
pub use renderer::Renderer;
pub use sensor::{
    BinaryConfig, DynamicRow, NumberConfig, Sensor, SensorKind, TextConfig, VersionConfig,
    PLACEHOLDER_KEY,
};
pub use state::{Request, RequestTimeouts, StateSnapshot};
pub use terminal::{CommandOutput, Terminal};
pub use value::Value;
