use std::time::Duration;

use lazy_static::lazy_static;
use serde_json::Map;

use crate::collection::Collection;
use crate::error::{ManagerError, Result};
use crate::helpers::name_to_key;
use crate::renderer::Renderer;
use crate::sensor::{DynamicRow, Sensor};
use crate::template::{self, Namespace};
use crate::terminal::CommandOutput;

lazy_static! {
    /// No-op command used by `update(test: true)` to probe the session.
    pub(crate) static ref TEST_COMMAND: Command = Command::new("echo ''");
}

/// A shell command template.
///
/// The string may reference caller variables as `@{name}` and sensor
/// values as `&{name}`. The last output and error stick around until the
/// next run or a reset.
#[derive(Debug, Clone)]
pub struct Command {
    pub string: String,
    pub timeout: Option<Duration>,
    pub renderer: Option<Renderer>,
    /// Sensors polled after every run, even when not referenced by the
    /// template.
    pub linked_sensors: Vec<String>,

    pub last_output: Option<CommandOutput>,
    pub last_error: Option<ManagerError>,
}

impl Command {
    pub fn new(string: impl Into<String>) -> Self {
        Self {
            string: string.into(),
            timeout: None,
            renderer: None,
            linked_sensors: Vec::new(),
            last_output: None,
            last_error: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_linked_sensors(mut self, keys: &[&str]) -> Self {
        self.linked_sensors = keys.iter().map(|key| key.to_string()).collect();
        self
    }

    /// Variables the template needs, in order of first appearance.
    pub fn required_variables(&self) -> Vec<String> {
        template::identifiers(&self.string, Namespace::Variable)
    }

    /// Sensor values the template needs, in order of first appearance.
    pub fn required_sensors(&self) -> Vec<String> {
        template::identifiers(&self.string, Namespace::Sensor)
    }

    /// Required plus linked sensors; the keys the dependency walk follows.
    pub fn sub_sensors(&self) -> Vec<String> {
        let mut keys = self.required_sensors();
        for key in &self.linked_sensors {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    pub(crate) fn handle_success(&mut self, output: CommandOutput) {
        self.last_output = Some(output);
        self.last_error = None;
    }

    pub(crate) fn handle_error(&mut self, error: ManagerError) {
        self.last_output = None;
        self.last_error = Some(error);
    }

    pub(crate) fn reset(&mut self) {
        self.last_output = None;
        self.last_error = None;
    }

    pub(crate) fn clear_runtime(&mut self) {
        self.last_output = None;
        self.last_error = None;
    }

    /// The renderer must accept the raw template and produce a string.
    pub(crate) fn check_renderer(&self) -> Result<()> {
        if let Some(renderer) = &self.renderer {
            renderer.render(&self.string).map_err(|error| {
                ManagerError::Command(format!(
                    "renderer failed on '{}' ({})",
                    self.string, error
                ))
            })?;
        }
        Ok(())
    }
}

/// A one-shot command invoked by key to produce an effect on the host.
#[derive(Debug, Clone)]
pub struct ActionCommand {
    pub command: Command,
    pub name: Option<String>,
    pub key: String,
    pub attributes: Map<String, serde_json::Value>,
}

impl ActionCommand {
    /// Create an action command, deriving the key from the name.
    pub fn new(string: impl Into<String>, name: &str) -> Result<Self> {
        let key = name_to_key(name)?;
        Ok(Self::with_key(string, Some(name), &key))
    }

    pub fn with_key(string: impl Into<String>, name: Option<&str>, key: &str) -> Self {
        Self {
            command: Command::new(string),
            name: name.map(str::to_string),
            key: key.to_string(),
            attributes: Map::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub(crate) fn check(&self, collection: &Collection) -> Result<()> {
        self.command.check_renderer()?;
        collection.check_detached_loop(&self.command.sub_sensors())
    }
}

/// A command whose stdout is parsed into one or more sensors.
#[derive(Debug, Clone)]
pub struct SensorCommand {
    pub command: Command,
    /// Refresh period; unset means run once and only on demand after that.
    pub interval: Option<Duration>,
    /// Field separator for dynamic rows; unset splits on whitespace runs.
    pub separator: Option<String>,
    pub sensors: Vec<Sensor>,
}

impl SensorCommand {
    pub fn new(string: impl Into<String>, sensors: Vec<Sensor>) -> Self {
        Self {
            command: Command::new(string),
            interval: None,
            separator: None,
            sensors,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_separator(mut self, separator: &str) -> Self {
        self.separator = Some(separator.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.command.renderer = Some(renderer);
        self
    }

    pub fn with_linked_sensors(mut self, keys: &[&str]) -> Self {
        self.command.linked_sensors = keys.iter().map(|key| key.to_string()).collect();
        self
    }

    /// Whether `update()` should run this command now.
    ///
    /// A command that never produced output runs unless its last failure
    /// was a configuration error; one with output reruns only when its
    /// interval passed.
    pub fn should_update(&self, now: f64) -> bool {
        match &self.command.last_output {
            None => !matches!(self.command.last_error, Some(ManagerError::Command(_))),
            Some(output) => match self.interval {
                None => false,
                Some(interval) => now - output.timestamp > interval.as_secs_f64(),
            },
        }
    }

    /// All addressable sensors: non-placeholder sensors and their children.
    pub fn all_sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors
            .iter()
            .filter(|sensor| !sensor.is_placeholder())
            .flat_map(|sensor| std::iter::once(sensor).chain(sensor.child_sensors.iter()))
    }

    pub fn sensor(&self, key: &str) -> Option<&Sensor> {
        self.all_sensors().find(|sensor| sensor.key == key)
    }

    pub fn has_sensor(&self, key: &str) -> bool {
        self.sensor(key).is_some()
    }

    /// Linked sensors of the command plus whatever the sensors contribute.
    pub fn linked_sensor_keys(&self) -> Vec<String> {
        let mut keys = self.command.linked_sensors.clone();
        for sensor in self.sensors.iter().filter(|sensor| !sensor.is_placeholder()) {
            for key in sensor.linked_sensor_keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn sub_sensors(&self) -> Vec<String> {
        let mut keys = self.command.required_sensors();
        for key in self.linked_sensor_keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Replace the sensor with a placeholder, keeping positions intact.
    pub(crate) fn remove_sensor(&mut self, key: &str) {
        for sensor in &mut self.sensors {
            if sensor.key == key {
                *sensor = Sensor::placeholder();
            }
        }
    }

    pub(crate) fn handle_success(&mut self, output: CommandOutput) {
        self.command.handle_success(output.clone());
        self.update_sensors(Some(&output));
    }

    pub(crate) fn handle_error(&mut self, error: ManagerError) {
        self.command.handle_error(error);
        self.update_sensors(None);
    }

    pub(crate) fn reset(&mut self) {
        self.command.reset();
        self.update_sensors(None);
    }

    /// Distribute output lines to the sensors.
    ///
    /// Leading static sensors consume lines by position; from the first
    /// dynamic sensor on, the remaining lines are parsed as rows. A
    /// non-zero exit code counts as no data.
    pub(crate) fn update_sensors(&mut self, output: Option<&CommandOutput>) {
        let data: Option<&[String]> = match output {
            Some(output) if output.code == 0 => Some(&output.stdout),
            _ => None,
        };

        let dynamic_start = self.sensors.iter().position(|sensor| sensor.dynamic);
        let static_end = dynamic_start.unwrap_or(self.sensors.len());

        for index in 0..static_end {
            let line = data.and_then(|lines| lines.get(index)).map(String::as_str);
            self.sensors[index].update_value(line);
        }

        let start = match dynamic_start {
            Some(start) => start,
            None => return,
        };
        let dynamic_count = self.sensors.len() - start;

        let rows = data.map(|lines| {
            let remaining = lines.get(start..).unwrap_or_default();
            self.parse_rows(remaining, dynamic_count)
        });

        for offset in 0..dynamic_count {
            let sensor_rows: Option<Vec<DynamicRow>> = rows
                .as_ref()
                .map(|rows| {
                    rows.iter()
                        .map(|fields| DynamicRow {
                            id: fields[0].trim().to_string(),
                            name: if fields.len() > dynamic_count + 1 {
                                fields.last().map(|name| name.trim().to_string())
                            } else {
                                None
                            },
                            data: fields[offset + 1].clone(),
                        })
                        .collect::<Vec<_>>()
                })
                .filter(|rows: &Vec<DynamicRow>| !rows.is_empty());

            self.sensors[start + offset].update_rows(sensor_rows.as_deref());
        }
    }

    /// Split lines into field lists, discarding rows that are too short.
    fn parse_rows(&self, lines: &[String], dynamic_count: usize) -> Vec<Vec<String>> {
        lines
            .iter()
            .map(|line| match &self.separator {
                Some(separator) => line
                    .split(separator.as_str())
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                None => line.split_whitespace().map(str::to_string).collect(),
            })
            .filter(|fields| fields.len() >= dynamic_count + 1)
            .collect()
    }

    pub(crate) fn check(&self, collection: &Collection) -> Result<()> {
        let mut seen: Vec<&str> = Vec::new();
        let mut dynamic_seen = false;

        for sensor in &self.sensors {
            if sensor.is_placeholder() {
                continue;
            }
            if seen.contains(&sensor.key.as_str()) {
                return Err(ManagerError::Command(format!(
                    "duplicate sensor key '{}' in '{}'",
                    sensor.key, self.command.string
                )));
            }
            seen.push(&sensor.key);

            if sensor.dynamic {
                dynamic_seen = true;
            } else if dynamic_seen {
                return Err(ManagerError::Command(format!(
                    "static sensor '{}' after dynamic sensor in '{}'",
                    sensor.key, self.command.string
                )));
            }

            sensor.check(collection)?;
        }

        self.command.check_renderer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::timestamp;
    use crate::sensor::SensorKind;
    use crate::value::Value;

    fn output(stdout: &[&str], code: i32) -> CommandOutput {
        CommandOutput {
            command_string: "test".to_string(),
            timestamp: timestamp(),
            stdout: stdout.iter().map(|line| line.to_string()).collect(),
            stderr: Vec::new(),
            code,
        }
    }

    #[test]
    fn test_action_command_derives_key_from_name() {
        let command = ActionCommand::new("/sbin/shutdown -h now", "Turn off").unwrap();
        assert_eq!(command.key, "turn_off");
        assert_eq!(command.name.as_deref(), Some("Turn off"));
    }

    #[test]
    fn test_action_command_rejects_unsluggable_name() {
        assert_eq!(
            ActionCommand::new("true", "---").unwrap_err(),
            ManagerError::NameKey
        );
        assert_eq!(
            ActionCommand::new("true", "").unwrap_err(),
            ManagerError::NameKey
        );
    }

    #[test]
    fn test_required_identifiers() {
        let command = Command::new("cat /sys/class/net/&{interface}/address @{flag} &{interface}");
        assert_eq!(command.required_variables(), vec!["flag".to_string()]);
        assert_eq!(command.required_sensors(), vec!["interface".to_string()]);
    }

    #[test]
    fn test_sub_sensors_union() {
        let command =
            Command::new("echo &{first}").with_linked_sensors(&["second", "first"]);
        assert_eq!(
            command.sub_sensors(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn test_should_update_matrix() {
        let now = timestamp();
        let mut command = SensorCommand::new(
            "uname -n",
            vec![Sensor::with_key(SensorKind::text(), None, "hostname")],
        );

        // never ran
        assert!(command.should_update(now));

        // configuration error: don't retry
        command.handle_error(ManagerError::Command("unknown variable 'x'".into()));
        assert!(!command.should_update(now));

        // execution error: retry
        command.handle_error(ManagerError::Execution("boom".into()));
        assert!(command.should_update(now));

        // output without interval: done
        command.handle_success(output(&["myhost"], 0));
        assert!(!command.should_update(now));

        // interval elapsed
        command.interval = Some(Duration::from_secs(30));
        assert!(!command.should_update(now + 10.0));
        assert!(command.should_update(now + 31.0));
    }

    #[test]
    fn test_static_sensors_consume_lines_by_position() {
        let mut command = SensorCommand::new(
            "uname -a | awk '...'",
            vec![
                Sensor::with_key(SensorKind::text(), None, "os_name"),
                Sensor::with_key(SensorKind::text(), None, "hostname"),
                Sensor::with_key(SensorKind::text(), None, "os_version"),
            ],
        );

        command.handle_success(output(&["Linux", "myhost"], 0));

        assert_eq!(
            command.sensor("os_name").unwrap().value,
            Some(Value::Text("Linux".into()))
        );
        assert_eq!(
            command.sensor("hostname").unwrap().value,
            Some(Value::Text("myhost".into()))
        );
        assert_eq!(command.sensor("os_version").unwrap().value, None);
    }

    #[test]
    fn test_nonzero_exit_code_clears_values() {
        let mut command = SensorCommand::new(
            "uname -n",
            vec![Sensor::with_key(SensorKind::text(), None, "hostname")],
        );

        command.handle_success(output(&["myhost"], 0));
        command.handle_success(output(&["garbage"], 1));

        let sensor = command.sensor("hostname").unwrap();
        assert_eq!(sensor.value, None);
        assert_eq!(sensor.last_known_value, Some(Value::Text("myhost".into())));
    }

    #[test]
    fn test_dynamic_rows_with_separator() {
        let mut command = SensorCommand::new(
            "df -k | awk '...'",
            vec![
                Sensor::with_key(SensorKind::text(), None, "filesystem"),
                Sensor::with_key(SensorKind::number(), None, "free_disk_space").dynamic(),
            ],
        )
        .with_separator("|");

        command.handle_success(output(&["ext4", "/|1000", "/home|2000", "short"], 0));

        let dynamic = command.sensor("free_disk_space").unwrap();
        assert_eq!(dynamic.child_sensors.len(), 2);
        assert_eq!(
            command.sensor("free_disk_space_root").unwrap().value,
            Some(Value::Integer(1000))
        );
        assert_eq!(
            command.sensor("free_disk_space_home").unwrap().value,
            Some(Value::Integer(2000))
        );
    }

    #[test]
    fn test_dynamic_rows_whitespace_and_name_field() {
        let mut command = SensorCommand::new(
            "lsblk",
            vec![
                Sensor::with_key(SensorKind::number(), None, "used").dynamic(),
                Sensor::with_key(SensorKind::number(), None, "free").dynamic(),
            ],
        );

        command.handle_success(output(&["sda1 10 90 System", "sda2 20 80"], 0));

        let used = command.sensor("used").unwrap();
        assert_eq!(used.child_sensors.len(), 2);
        let child = command.sensor("used_sda1").unwrap();
        assert_eq!(child.value, Some(Value::Integer(10)));
        assert_eq!(child.name.as_deref(), Some("System"));
        assert_eq!(
            command.sensor("free_sda2").unwrap().value,
            Some(Value::Integer(80))
        );
    }

    #[test]
    fn test_remove_sensor_leaves_placeholder() {
        let mut command = SensorCommand::new(
            "uname -a",
            vec![
                Sensor::with_key(SensorKind::text(), None, "os_name"),
                Sensor::with_key(SensorKind::text(), None, "hostname"),
            ],
        );

        command.remove_sensor("os_name");

        assert_eq!(command.sensors.len(), 2);
        assert!(command.sensors[0].is_placeholder());
        assert!(command.has_sensor("hostname"));
        assert!(!command.has_sensor("os_name"));

        // positions preserved: hostname still receives the second line
        command.handle_success(output(&["Linux", "myhost"], 0));
        assert_eq!(
            command.sensor("hostname").unwrap().value,
            Some(Value::Text("myhost".into()))
        );
    }

    #[test]
    fn test_check_rejects_static_after_dynamic() {
        let collection = Collection::new("test");
        let command = SensorCommand::new(
            "df",
            vec![
                Sensor::with_key(SensorKind::number(), None, "free").dynamic(),
                Sensor::with_key(SensorKind::text(), None, "filesystem"),
            ],
        );

        assert!(command.check(&collection).is_err());
    }

    #[test]
    fn test_check_rejects_duplicate_keys() {
        let collection = Collection::new("test");
        let command = SensorCommand::new(
            "uname -a",
            vec![
                Sensor::with_key(SensorKind::text(), None, "hostname"),
                Sensor::with_key(SensorKind::text(), None, "hostname"),
            ],
        );

        assert!(command.check(&collection).is_err());
    }
}
