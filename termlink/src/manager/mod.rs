use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collection::Collection;
use crate::command::{Command, SensorCommand, TEST_COMMAND};
use crate::default_collections::keys;
use crate::error::{ManagerError, Result};
use crate::event::Subscription;
use crate::helpers::timestamp;
use crate::renderer::Renderer;
use crate::sensor::Sensor;
use crate::state::{RequestTimeouts, State, StateSnapshot};
use crate::template::{self, Namespace};
use crate::terminal::{CommandOutput, Terminal};
use crate::value::Value;

pub const DEFAULT_NAME: &str = "Manager";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Variables substituted into `@{name}` placeholders.
pub type Variables = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Label used in log lines.
    pub name: String,
    /// Default timeout for command execution; per-command timeouts win.
    pub command_timeout: Duration,
    pub allow_turn_off: bool,
    /// Connect per execute and schedule a disconnect afterwards.
    pub disconnect_mode: bool,
    pub disconnect_mode_delay: Duration,
    pub request_timeouts: RequestTimeouts,
    /// Static override for the MAC address sensor reading.
    pub mac_address: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            allow_turn_off: false,
            disconnect_mode: false,
            disconnect_mode_delay: Duration::ZERO,
            request_timeouts: RequestTimeouts::default(),
            mac_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Run every sensor command regardless of intervals.
    pub force: bool,
    /// Skip commands that already produced output.
    pub once: bool,
    /// Run a no-op command when nothing else is due, to probe the session.
    pub test: bool,
}

enum BatchItem {
    Sensor(usize),
    Test,
}

struct RenderSpec {
    string: String,
    timeout: Option<Duration>,
    renderer: Option<Renderer>,
    sub_sensors: Vec<String>,
}

impl RenderSpec {
    fn from_command(command: &Command) -> Self {
        Self {
            string: command.string.clone(),
            timeout: command.timeout,
            renderer: command.renderer.clone(),
            sub_sensors: command.sub_sensors(),
        }
    }
}

/// Orchestrates one host: catalog + transport + state machine.
///
/// The manager is a cloneable handle; every public operation locks the
/// shared inner state for its whole duration, so operations against one
/// host are strictly serial while any number of tasks may call in
/// concurrently.
#[derive(Clone)]
pub struct Manager {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl Manager {
    pub fn new(
        terminal: Box<dyn Terminal>,
        config: ManagerConfig,
        collection: Option<&Collection>,
    ) -> Self {
        let name = config.name.clone();

        let mut catalog = Collection::new(&name);
        if let Some(source) = collection {
            for command in &source.action_commands {
                catalog.add_action_command(command.clone());
            }
            for command in &source.sensor_commands {
                catalog.add_sensor_command(command.clone());
            }
        }

        let state = State::new(&name, config.request_timeouts);
        let inner = Arc::new_cyclic(|weak| {
            Mutex::new(Inner {
                config,
                terminal,
                collection: catalog,
                state,
                disconnector: None,
                weak: weak.clone(),
            })
        });

        Self { name, inner }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Update the state and run every due sensor command.
    ///
    /// When already connected the batch runs directly; otherwise (or after
    /// an execution error that tripped the state machine) a full
    /// ping/connect/execute cycle is attempted.
    pub async fn update(&self) -> Result<()> {
        self.inner.lock().await.update(UpdateOptions::default()).await
    }

    pub async fn update_with(&self, options: UpdateOptions) -> Result<()> {
        self.inner.lock().await.update(options).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.inner.lock().await.ping().await
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.lock().await.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.lock().await.disconnect().await
    }

    /// Disconnect and clear every command's output, error and sensor
    /// values (`last_known_value` survives).
    pub async fn reset(&self) -> Result<()> {
        self.inner.lock().await.reset().await
    }

    /// Execute a raw command string on the host.
    pub async fn execute(&self, string: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.inner.lock().await.execute_string(string, timeout).await
    }

    /// Render and execute a caller-owned command; its `last_output` and
    /// `last_error` are written back.
    pub async fn execute_command(
        &self,
        command: &mut Command,
        variables: Option<&Variables>,
    ) -> Result<CommandOutput> {
        self.inner
            .lock()
            .await
            .execute_detached(command, variables)
            .await
    }

    pub async fn run_action(
        &self,
        key: &str,
        variables: Option<&Variables>,
    ) -> Result<CommandOutput> {
        self.inner.lock().await.run_action(key, variables).await
    }

    pub async fn poll_sensor(&self, key: &str) -> Result<Sensor> {
        let keys = [key.to_string()];
        let (mut sensors, _) = self.inner.lock().await.poll_sensors(&keys, true).await?;
        Ok(sensors.remove(0))
    }

    /// Poll multiple sensors; owning commands are de-duplicated and each
    /// runs once. Returns sensors and per-key errors in input order.
    pub async fn poll_sensors(
        &self,
        keys: &[&str],
        raise_errors: bool,
    ) -> Result<(Vec<Sensor>, Vec<Option<ManagerError>>)> {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        self.inner.lock().await.poll_sensors(&keys, raise_errors).await
    }

    pub async fn set_sensor_value(&self, key: &str, value: Value) -> Result<Sensor> {
        let keys = [key.to_string()];
        let (mut sensors, _) = self
            .inner
            .lock()
            .await
            .set_sensor_values(&keys, &[value], true)
            .await?;
        Ok(sensors.remove(0))
    }

    /// Set multiple controllable sensors: poll, run the control commands,
    /// poll again and verify the readings match the intent.
    pub async fn set_sensor_values(
        &self,
        keys: &[&str],
        values: &[Value],
        raise_errors: bool,
    ) -> Result<(Vec<Sensor>, Vec<Option<ManagerError>>)> {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        self.inner
            .lock()
            .await
            .set_sensor_values(&keys, values, raise_errors)
            .await
    }

    /// Run the `turn_off` action, disconnect and record the request.
    pub async fn turn_off(&self) -> Result<CommandOutput> {
        self.inner.lock().await.turn_off().await
    }

    /// Run the `restart` action, disconnect and record the request.
    pub async fn restart(&self) -> Result<CommandOutput> {
        self.inner.lock().await.restart().await
    }

    /// Record a turn-on request. Powering the host on (e.g. wake-on-lan)
    /// is the caller's job; the request biases state transitions until the
    /// host answers pings.
    pub async fn turn_on(&self) {
        self.inner.lock().await.state.handle_turn_on();
    }

    /// Periodic update loop, with exponential backoff after failures.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        info!("{}: starting monitor loop", self.name);

        let mut backoff = ExponentialBackoff::default();
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("{}: monitor loop cancelled", self.name);
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    match self.update().await {
                        Ok(()) => {
                            backoff.reset();
                            delay = interval;
                        }
                        Err(error) => {
                            warn!("{}: update failed: {}", self.name, error);
                            delay = backoff.next_backoff().unwrap_or(interval);
                        }
                    }
                }
            }
        }

        self.disconnect().await?;
        info!("{}: monitor loop stopped", self.name);
        Ok(())
    }

    pub async fn state(&self) -> StateSnapshot {
        self.inner.lock().await.state.snapshot()
    }

    pub async fn can_connect(&self) -> bool {
        self.inner.lock().await.can_connect()
    }

    pub async fn can_execute(&self) -> bool {
        self.inner.lock().await.can_execute()
    }

    pub async fn can_turn_off(&self) -> bool {
        self.inner.lock().await.can_turn_off()
    }

    pub async fn can_restart(&self) -> bool {
        self.inner.lock().await.can_restart()
    }

    /// Snapshot of a sensor by key.
    pub async fn sensor(&self, key: &str) -> Option<Sensor> {
        self.inner.lock().await.collection.sensor(key).cloned()
    }

    pub async fn sensor_value(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .collection
            .sensor(key)
            .and_then(|sensor| sensor.value.clone())
    }

    pub async fn last_known_sensor_value(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .collection
            .sensor(key)
            .and_then(|sensor| sensor.last_known_value.clone())
    }

    pub async fn hostname(&self) -> Option<Value> {
        self.last_known_sensor_value(keys::sensor::HOSTNAME).await
    }

    pub async fn os_name(&self) -> Option<Value> {
        self.last_known_sensor_value(keys::sensor::OS_NAME).await
    }

    pub async fn machine_type(&self) -> Option<Value> {
        self.last_known_sensor_value(keys::sensor::MACHINE_TYPE).await
    }

    pub async fn network_interface(&self) -> Option<Value> {
        self.last_known_sensor_value(keys::sensor::NETWORK_INTERFACE)
            .await
    }

    pub async fn wake_on_lan(&self) -> Option<Value> {
        self.last_known_sensor_value(keys::sensor::WAKE_ON_LAN).await
    }

    /// Configured MAC address override, falling back to the sensor.
    pub async fn mac_address(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        if let Some(mac_address) = &inner.config.mac_address {
            return Some(mac_address.clone());
        }
        inner
            .collection
            .sensor(keys::sensor::MAC_ADDRESS)
            .and_then(|sensor| sensor.last_known_value.clone())
            .map(|value| value.to_string())
    }

    pub async fn add_action_command(&self, command: crate::command::ActionCommand) {
        self.inner.lock().await.collection.add_action_command(command);
    }

    pub async fn add_sensor_command(&self, command: SensorCommand) {
        self.inner.lock().await.collection.add_sensor_command(command);
    }

    pub async fn remove_action_command(&self, key: &str) -> Result<()> {
        self.inner.lock().await.collection.remove_action_command(key)
    }

    pub async fn remove_sensor(&self, key: &str) -> Result<()> {
        self.inner.lock().await.collection.remove_sensor(key)
    }

    /// Validate the catalog (see [`Collection::check`]).
    pub async fn check(&self) -> Result<()> {
        self.inner.lock().await.collection.check()
    }

    pub async fn on_state_change(
        &self,
        callback: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) -> Subscription<StateSnapshot> {
        self.inner.lock().await.state.on_change.subscribe(callback)
    }

    pub async fn on_sensor_update(
        &self,
        key: &str,
        callback: impl Fn(&Sensor) + Send + Sync + 'static,
    ) -> Result<Subscription<Sensor>> {
        let inner = self.inner.lock().await;
        inner
            .collection
            .sensor(key)
            .map(|sensor| sensor.on_update.subscribe(callback))
            .ok_or_else(|| ManagerError::UnknownKey(key.to_string()))
    }

    pub async fn on_sensor_child_added(
        &self,
        key: &str,
        callback: impl Fn(&Sensor) + Send + Sync + 'static,
    ) -> Result<Subscription<Sensor>> {
        let inner = self.inner.lock().await;
        inner
            .collection
            .sensor(key)
            .map(|sensor| sensor.on_child_added.subscribe(callback))
            .ok_or_else(|| ManagerError::UnknownKey(key.to_string()))
    }

    pub async fn on_sensor_child_removed(
        &self,
        key: &str,
        callback: impl Fn(&Sensor) + Send + Sync + 'static,
    ) -> Result<Subscription<Sensor>> {
        let inner = self.inner.lock().await;
        inner
            .collection
            .sensor(key)
            .map(|sensor| sensor.on_child_removed.subscribe(callback))
            .ok_or_else(|| ManagerError::UnknownKey(key.to_string()))
    }
}

struct Inner {
    config: ManagerConfig,
    terminal: Box<dyn Terminal>,
    collection: Collection,
    state: State,
    disconnector: Option<JoinHandle<()>>,
    weak: Weak<Mutex<Inner>>,
}

impl Inner {
    async fn update(&mut self, options: UpdateOptions) -> Result<()> {
        self.state.update();

        if !self.config.disconnect_mode && self.state.connected() {
            let batch = self.due_commands(&options);
            match self.execute_batch(batch, true).await {
                Ok(_) => return Ok(()),
                Err(error) if error.is_execution() && self.state.error() => {
                    self.state.update();
                }
                Err(error) => return Err(error),
            }
        }

        self.ping().await?;

        if !self.config.disconnect_mode {
            self.connect().await?;
        }

        let batch = self.due_commands(&options);
        self.execute_batch(batch, true).await?;
        Ok(())
    }

    fn due_commands(&self, options: &UpdateOptions) -> Vec<BatchItem> {
        let now = timestamp();
        let mut items: Vec<BatchItem> = self
            .collection
            .sensor_commands
            .iter()
            .enumerate()
            .filter(|(_, command)| {
                options.force
                    || (command.should_update(now)
                        && !(options.once && command.command.last_output.is_some()))
            })
            .map(|(index, _)| BatchItem::Sensor(index))
            .collect();

        if options.test && !self.config.disconnect_mode && items.is_empty() {
            items.push(BatchItem::Test);
        }

        items
    }

    /// Run every item, collecting transport-level failures per item.
    /// Configuration errors abort immediately; with `raise_errors` the
    /// first collected error is raised once the batch is done.
    async fn execute_batch(
        &mut self,
        items: Vec<BatchItem>,
        raise_errors: bool,
    ) -> Result<Vec<Option<ManagerError>>> {
        let mut errors = Vec::with_capacity(items.len());

        for item in items {
            let result = match item {
                BatchItem::Sensor(index) => {
                    self.execute_sensor_command(index).await.map(|_| ())
                }
                BatchItem::Test => {
                    let mut test = TEST_COMMAND.clone();
                    self.execute_detached(&mut test, None).await.map(|_| ())
                }
            };

            match result {
                Ok(()) => errors.push(None),
                Err(error) if error.is_connect() || error.is_execution() => {
                    errors.push(Some(error));
                }
                Err(error) => return Err(error),
            }
        }

        if raise_errors {
            if let Some(error) = errors.iter().flatten().next() {
                return Err(error.clone());
            }
        }

        Ok(errors)
    }

    async fn ping(&mut self) -> Result<()> {
        match self.terminal.ping().await {
            Ok(()) => {
                self.state.handle_ping_success();
                Ok(())
            }
            Err(error) => {
                self.reset().await?;
                self.state.handle_ping_error();
                Err(error)
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.state.connected() {
            return Ok(());
        }
        if !self.state.online() {
            return Err(ManagerError::Connect("host is offline".into()));
        }
        if self.state.shutting_down() {
            return Err(ManagerError::Connect("host is shutting down".into()));
        }
        if self.state.error() {
            return Err(ManagerError::Connect("waiting for update after error".into()));
        }

        match self.terminal.connect().await {
            Ok(()) => {
                self.state.handle_connect_success();
                Ok(())
            }
            Err(error) => {
                self.reset().await?;
                self.state.handle_connect_error();
                Err(error)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.state.connected() {
            return Ok(());
        }
        self.terminal.disconnect().await?;
        self.state.handle_disconnect();
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.disconnect().await?;

        for command in &mut self.collection.action_commands {
            command.command.reset();
        }
        for command in &mut self.collection.sensor_commands {
            command.reset();
        }

        Ok(())
    }

    async fn execute_string(
        &mut self,
        string: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        if self.config.disconnect_mode {
            self.connect().await?;
        }

        if !self.state.connected() {
            return Err(ManagerError::Execution("not connected".into()));
        }

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let result = match self.terminal.execute(string, timeout).await {
            Err(ManagerError::Timeout) => {
                Err(ManagerError::Execution("timeout during command".into()))
            }
            Err(error @ ManagerError::Execution(_)) => {
                self.reset().await?;
                self.state.handle_execute_error();
                Err(error)
            }
            other => other,
        };

        if self.config.disconnect_mode && self.state.connected() {
            self.schedule_disconnect();
        }

        result
    }

    fn schedule_disconnect(&mut self) {
        if let Some(task) = self.disconnector.take() {
            task.abort();
        }

        let weak = self.weak.clone();
        let delay = self.config.disconnect_mode_delay;
        let name = self.config.name.clone();

        self.disconnector = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().await;
                if let Err(error) = inner.disconnect().await {
                    warn!("{}: scheduled disconnect failed: {}", name, error);
                }
                inner.disconnector = None;
            }
        }));
    }

    async fn render(
        &mut self,
        spec: &RenderSpec,
        variables: Option<&Variables>,
        origin: Option<usize>,
    ) -> Result<String> {
        match origin {
            Some(index) => self.collection.check_command_loop(index)?,
            None => self.collection.check_detached_loop(&spec.sub_sensors)?,
        }

        let empty = Variables::new();
        let string =
            template::substitute(&spec.string, Namespace::Variable, variables.unwrap_or(&empty))?;

        let keys = template::identifiers(&spec.string, Namespace::Sensor);
        let mut sensor_values: HashMap<String, String> = HashMap::new();

        if !keys.is_empty() {
            let mut indices = Vec::new();
            for key in &keys {
                match self.collection.sensor_command_index_for(key) {
                    Some(index) if !indices.contains(&index) => indices.push(index),
                    _ => {}
                }
            }

            let results = self.poll_sensor_commands(indices).await?;
            if let Some(error) = results.into_iter().find_map(|(_, error)| error) {
                return Err(error);
            }

            for key in &keys {
                if let Some(sensor) = self.collection.sensor(key) {
                    match &sensor.value {
                        Some(value) => {
                            sensor_values.insert(key.clone(), value.to_string());
                        }
                        None => {
                            return Err(ManagerError::Command(format!(
                                "value of required sensor {} is None",
                                key
                            )))
                        }
                    }
                }
            }
        }

        let string = template::substitute(&string, Namespace::Sensor, &sensor_values)?;

        match &spec.renderer {
            Some(renderer) => renderer.render(&string).map_err(|error| {
                ManagerError::Command(format!("failed to render string ({})", error))
            }),
            None => Ok(string),
        }
    }

    /// Execute each owning command once; the boxing here breaks the
    /// render -> poll -> execute recursion.
    fn poll_sensor_commands(
        &mut self,
        indices: Vec<usize>,
    ) -> BoxFuture<'_, Result<Vec<(usize, Option<ManagerError>)>>> {
        async move {
            let mut results = Vec::with_capacity(indices.len());

            for index in indices {
                match self.execute_sensor_command(index).await {
                    Ok(_) => results.push((index, None)),
                    Err(error) if error.is_connect() || error.is_execution() => {
                        results.push((index, Some(error)));
                    }
                    Err(error) => return Err(error),
                }
            }

            Ok(results)
        }
        .boxed()
    }

    async fn execute_sensor_command(&mut self, index: usize) -> Result<CommandOutput> {
        let spec = RenderSpec::from_command(&self.collection.sensor_commands[index].command);

        let rendered = match self.render(&spec, None, Some(index)).await {
            Ok(rendered) => rendered,
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, spec.string, error);
                self.collection.sensor_commands[index].handle_error(error.clone());
                return Err(error);
            }
        };

        match self.execute_string(&rendered, spec.timeout).await {
            Ok(output) => {
                debug!(
                    "{}: {} => {:?}, {:?}, {}",
                    self.config.name, rendered, output.stdout, output.stderr, output.code
                );
                let linked = {
                    let command = &mut self.collection.sensor_commands[index];
                    command.handle_success(output.clone());
                    command.linked_sensor_keys()
                };
                self.poll_linked(&linked).await?;
                Ok(output)
            }
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, rendered, error);
                self.collection.sensor_commands[index].handle_error(error.clone());
                Err(error)
            }
        }
    }

    async fn execute_action_command(
        &mut self,
        index: usize,
        variables: Option<&Variables>,
    ) -> Result<CommandOutput> {
        let spec = RenderSpec::from_command(&self.collection.action_commands[index].command);

        let rendered = match self.render(&spec, variables, None).await {
            Ok(rendered) => rendered,
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, spec.string, error);
                self.collection.action_commands[index]
                    .command
                    .handle_error(error.clone());
                return Err(error);
            }
        };

        match self.execute_string(&rendered, spec.timeout).await {
            Ok(output) => {
                debug!(
                    "{}: {} => {:?}, {:?}, {}",
                    self.config.name, rendered, output.stdout, output.stderr, output.code
                );
                let command = &mut self.collection.action_commands[index].command;
                command.handle_success(output.clone());
                let linked = command.linked_sensors.clone();
                self.poll_linked(&linked).await?;
                Ok(output)
            }
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, rendered, error);
                self.collection.action_commands[index]
                    .command
                    .handle_error(error.clone());
                Err(error)
            }
        }
    }

    /// Execute a command that lives outside the catalog.
    async fn execute_detached(
        &mut self,
        command: &mut Command,
        variables: Option<&Variables>,
    ) -> Result<CommandOutput> {
        let spec = RenderSpec::from_command(command);

        let rendered = match self.render(&spec, variables, None).await {
            Ok(rendered) => rendered,
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, spec.string, error);
                command.handle_error(error.clone());
                return Err(error);
            }
        };

        match self.execute_string(&rendered, spec.timeout).await {
            Ok(output) => {
                debug!(
                    "{}: {} => {:?}, {:?}, {}",
                    self.config.name, rendered, output.stdout, output.stderr, output.code
                );
                command.handle_success(output.clone());
                let linked = command.linked_sensors.clone();
                self.poll_linked(&linked).await?;
                Ok(output)
            }
            Err(error) => {
                debug!("{}: {} => {}", self.config.name, rendered, error);
                command.handle_error(error.clone());
                Err(error)
            }
        }
    }

    /// Poll linked sensors after a run. Keys without an owner in the
    /// catalog are skipped: dynamic children of a linked reference may
    /// not exist until their command ran.
    async fn poll_linked(&mut self, keys: &[String]) -> Result<()> {
        let mut indices = Vec::new();
        for key in keys {
            match self.collection.sensor_command_index_for(key) {
                Some(index) if !indices.contains(&index) => indices.push(index),
                Some(_) => {}
                None => debug!(
                    "{}: linked sensor '{}' not in collection",
                    self.config.name, key
                ),
            }
        }

        if indices.is_empty() {
            return Ok(());
        }

        let results = self.poll_sensor_commands(indices).await?;
        if let Some(error) = results.into_iter().find_map(|(_, error)| error) {
            return Err(error);
        }
        Ok(())
    }

    async fn run_action(
        &mut self,
        key: &str,
        variables: Option<&Variables>,
    ) -> Result<CommandOutput> {
        let index = self
            .collection
            .action_command_index(key)
            .ok_or_else(|| ManagerError::UnknownKey(key.to_string()))?;
        self.execute_action_command(index, variables).await
    }

    async fn poll_sensors(
        &mut self,
        keys: &[String],
        raise_errors: bool,
    ) -> Result<(Vec<Sensor>, Vec<Option<ManagerError>>)> {
        let mut command_indices = Vec::with_capacity(keys.len());
        let mut before = Vec::with_capacity(keys.len());

        for key in keys {
            let sensor = self
                .collection
                .sensor(key)
                .ok_or_else(|| ManagerError::UnknownKey(key.clone()))?;
            before.push(sensor.clone());
            let index = self
                .collection
                .sensor_command_index_for(key)
                .ok_or_else(|| ManagerError::UnknownKey(key.clone()))?;
            command_indices.push(index);
        }

        let mut unique = Vec::new();
        for &index in &command_indices {
            if !unique.contains(&index) {
                unique.push(index);
            }
        }

        let results = self.poll_sensor_commands(unique).await?;

        let errors: Vec<Option<ManagerError>> = command_indices
            .iter()
            .map(|index| {
                results
                    .iter()
                    .find(|(known, _)| known == index)
                    .and_then(|(_, error)| error.clone())
            })
            .collect();

        // A dynamic child may disappear during the poll; fall back to the
        // snapshot taken before.
        let sensors: Vec<Sensor> = keys
            .iter()
            .zip(before)
            .map(|(key, before)| self.collection.sensor(key).cloned().unwrap_or(before))
            .collect();

        if raise_errors {
            if let Some(error) = errors.iter().flatten().next() {
                return Err(error.clone());
            }
        }

        Ok((sensors, errors))
    }

    async fn set_sensor_values(
        &mut self,
        keys: &[String],
        values: &[Value],
        raise_errors: bool,
    ) -> Result<(Vec<Sensor>, Vec<Option<ManagerError>>)> {
        if keys.len() != values.len() {
            return Err(ManagerError::Command(
                "keys and values differ in length".into(),
            ));
        }

        let (_, mut errors) = self.poll_sensors(keys, false).await?;

        for (index, key) in keys.iter().enumerate() {
            if errors[index].is_some() {
                continue;
            }
            let value = values[index].clone();

            let prepared = match self.collection.sensor(key) {
                Some(sensor) => sensor
                    .prepare_set(&value)
                    .map(|command| command.map(|command| (command, sensor.id.clone()))),
                None => Err(ManagerError::UnknownKey(key.clone())),
            };

            match prepared {
                Ok(None) => {}
                Ok(Some((mut command, id))) => {
                    let mut variables = Variables::new();
                    variables.insert("value".to_string(), value.to_string());
                    if let Some(id) = id {
                        variables.insert("id".to_string(), id);
                    }
                    if let Err(error) = self.execute_detached(&mut command, Some(&variables)).await
                    {
                        if error.is_connect()
                            || error.is_execution()
                            || matches!(error, ManagerError::Sensor { .. })
                        {
                            errors[index] = Some(error);
                        } else {
                            return Err(error);
                        }
                    }
                }
                Err(error @ ManagerError::Sensor { .. }) => errors[index] = Some(error),
                Err(error) => return Err(error),
            }
        }

        let (_, second_errors) = self.poll_sensors(keys, false).await?;

        for index in 0..keys.len() {
            if errors[index].is_some() {
                continue;
            }
            if let Some(error) = &second_errors[index] {
                errors[index] = Some(error.clone());
                continue;
            }
            let observed = self
                .collection
                .sensor(&keys[index])
                .and_then(|sensor| sensor.value.clone());
            if observed.as_ref() != Some(&values[index]) {
                errors[index] = Some(ManagerError::sensor(&keys[index], "value not set correctly"));
            }
        }

        let sensors: Vec<Sensor> = keys
            .iter()
            .map(|key| {
                self.collection
                    .sensor(key)
                    .cloned()
                    .unwrap_or_else(Sensor::placeholder)
            })
            .collect();

        if raise_errors {
            if let Some(error) = errors.iter().flatten().next() {
                return Err(error.clone());
            }
        }

        Ok((sensors, errors))
    }

    async fn turn_off(&mut self) -> Result<CommandOutput> {
        if !self.config.allow_turn_off {
            return Err(ManagerError::TurnOffForbidden);
        }

        let output = self.run_action(keys::action::TURN_OFF, None).await?;

        if output.code > 0 {
            return Err(ManagerError::Execution(format!(
                "'{}' action returned exit code {}",
                keys::action::TURN_OFF,
                output.code
            )));
        }

        self.disconnect().await?;
        self.state.handle_turn_off();
        Ok(output)
    }

    async fn restart(&mut self) -> Result<CommandOutput> {
        let output = self.run_action(keys::action::RESTART, None).await?;

        if output.code > 0 {
            return Err(ManagerError::Execution(format!(
                "'{}' action returned exit code {}",
                keys::action::RESTART,
                output.code
            )));
        }

        self.disconnect().await?;
        self.state.handle_restart();
        Ok(output)
    }

    fn can_connect(&self) -> bool {
        self.state.online() && !(self.state.shutting_down() || self.state.error())
    }

    fn can_execute(&self) -> bool {
        self.state.connected() || (self.config.disconnect_mode && self.can_connect())
    }

    fn can_turn_off(&self) -> bool {
        self.can_execute()
            && self.config.allow_turn_off
            && self.collection.action_command(keys::action::TURN_OFF).is_some()
    }

    fn can_restart(&self) -> bool {
        self.can_execute()
            && self.collection.action_command(keys::action::RESTART).is_some()
    }
}
