use log::debug;

use crate::command::{ActionCommand, SensorCommand};
use crate::error::{ManagerError, Result};
use crate::sensor::Sensor;

/// Catalog of action and sensor commands for one host type.
///
/// Keys are unique across the catalog: inserting a command whose key (or
/// whose sensors' keys) already exist evicts the previous occupant first.
/// Inserted commands get their runtime state cleared, so two catalogs
/// never share outputs or sensor readings.
#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub action_commands: Vec<ActionCommand>,
    pub sensor_commands: Vec<SensorCommand>,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action_commands: Vec::new(),
            sensor_commands: Vec::new(),
        }
    }

    pub fn with_commands(
        name: &str,
        action_commands: Vec<ActionCommand>,
        sensor_commands: Vec<SensorCommand>,
    ) -> Self {
        let mut collection = Self::new(name);
        for command in action_commands {
            collection.add_action_command(command);
        }
        for command in sensor_commands {
            collection.add_sensor_command(command);
        }
        collection
    }

    pub fn add_action_command(&mut self, command: ActionCommand) {
        let mut command = command;
        command.command.clear_runtime();

        if self.action_command(&command.key).is_some() {
            debug!("{}: replacing action command '{}'", self.name, command.key);
            self.action_commands.retain(|known| known.key != command.key);
        }

        self.action_commands.push(command);
    }

    pub fn add_sensor_command(&mut self, command: SensorCommand) {
        let mut command = command;
        command.command.clear_runtime();
        for sensor in &mut command.sensors {
            sensor.clear_runtime();
        }

        let keys: Vec<String> = command
            .sensors
            .iter()
            .filter(|sensor| !sensor.is_placeholder())
            .map(|sensor| sensor.key.clone())
            .collect();
        for key in keys {
            if self.has_sensor(&key) {
                debug!("{}: replacing sensor '{}'", self.name, key);
                let _ = self.remove_sensor(&key);
            }
        }

        self.sensor_commands.push(command);
    }

    pub fn action_command(&self, key: &str) -> Option<&ActionCommand> {
        self.action_commands.iter().find(|command| command.key == key)
    }

    pub(crate) fn action_command_index(&self, key: &str) -> Option<usize> {
        self.action_commands.iter().position(|command| command.key == key)
    }

    pub fn sensor(&self, key: &str) -> Option<&Sensor> {
        self.sensor_commands
            .iter()
            .find_map(|command| command.sensor(key))
    }

    pub fn has_sensor(&self, key: &str) -> bool {
        self.sensor(key).is_some()
    }

    pub fn sensor_command_for(&self, key: &str) -> Option<&SensorCommand> {
        self.sensor_command_index_for(key)
            .map(|index| &self.sensor_commands[index])
    }

    pub(crate) fn sensor_command_index_for(&self, key: &str) -> Option<usize> {
        self.sensor_commands
            .iter()
            .position(|command| command.has_sensor(key))
    }

    pub fn sensor_keys(&self) -> Vec<String> {
        self.sensor_commands
            .iter()
            .flat_map(|command| command.all_sensors())
            .map(|sensor| sensor.key.clone())
            .collect()
    }

    pub fn remove_action_command(&mut self, key: &str) -> Result<()> {
        if self.action_command(key).is_none() {
            return Err(ManagerError::UnknownKey(key.to_string()));
        }
        self.action_commands.retain(|command| command.key != key);
        Ok(())
    }

    /// Replace the sensor with a placeholder so the remaining sensors of
    /// its command keep their output positions; drop the command once it
    /// has no real sensors left.
    pub fn remove_sensor(&mut self, key: &str) -> Result<()> {
        let index = self
            .sensor_command_index_for(key)
            .ok_or_else(|| ManagerError::UnknownKey(key.to_string()))?;

        let command = &mut self.sensor_commands[index];
        command.remove_sensor(key);

        if command.all_sensors().next().is_none() {
            self.sensor_commands.remove(index);
        }

        Ok(())
    }

    /// Validate every command against the catalog: sensor ordering, key
    /// uniqueness inside commands, renderer sanity, version cross
    /// references and dependency loops.
    pub fn check(&self) -> Result<()> {
        for (index, command) in self.sensor_commands.iter().enumerate() {
            command.check(self)?;
            self.check_command_loop(index)?;
        }
        for command in &self.action_commands {
            command.check(self)?;
        }
        Ok(())
    }

    /// Walk the dependency graph of one catalog sensor command.
    pub(crate) fn check_command_loop(&self, index: usize) -> Result<()> {
        let mut chain = vec![index];
        let sub_sensors = self.sensor_commands[index].sub_sensors();
        self.walk(&sub_sensors, &mut chain)
    }

    /// Walk the dependency graph starting from a command outside the
    /// catalog (action or caller-owned).
    pub(crate) fn check_detached_loop(&self, sub_sensors: &[String]) -> Result<()> {
        let mut chain = Vec::new();
        self.walk(sub_sensors, &mut chain)
    }

    fn walk(&self, sub_sensors: &[String], chain: &mut Vec<usize>) -> Result<()> {
        for key in sub_sensors {
            // Keys without an owner are free variables here.
            let index = match self.sensor_command_index_for(key) {
                Some(index) => index,
                None => continue,
            };

            if chain.contains(&index) {
                return Err(ManagerError::Command(format!("loop detected: {}", key)));
            }

            chain.push(index);
            let sub_sensors = self.sensor_commands[index].sub_sensors();
            self.walk(&sub_sensors, chain)?;
            chain.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;
    use crate::value::Value;

    fn text_sensor(key: &str) -> Sensor {
        Sensor::with_key(SensorKind::text(), None, key)
    }

    fn single_sensor_command(string: &str, key: &str) -> SensorCommand {
        SensorCommand::new(string, vec![text_sensor(key)])
    }

    #[test]
    fn test_add_action_command_is_idempotent() {
        let mut collection = Collection::new("test");

        collection.add_action_command(ActionCommand::with_key(
            "/sbin/shutdown -h now",
            Some("Turn off"),
            "turn_off",
        ));
        collection.add_action_command(ActionCommand::with_key(
            "/sbin/shutdown -h now",
            Some("Turn off"),
            "turn_off",
        ));

        assert_eq!(collection.action_commands.len(), 1);
    }

    #[test]
    fn test_add_sensor_command_evicts_same_key() {
        let mut collection = Collection::new("test");

        collection.add_sensor_command(single_sensor_command("uname -n", "hostname"));
        collection.add_sensor_command(single_sensor_command("hostname", "hostname"));

        assert_eq!(collection.sensor_commands.len(), 1);
        assert_eq!(collection.sensor_commands[0].command.string, "hostname");
    }

    #[test]
    fn test_insertion_clears_runtime_state() {
        let mut source = single_sensor_command("uname -n", "hostname");
        source.sensors[0].value = Some(Value::Text("stale".into()));
        source.sensors[0].last_known_value = Some(Value::Text("stale".into()));

        let mut collection = Collection::new("test");
        collection.add_sensor_command(source);

        let sensor = collection.sensor("hostname").unwrap();
        assert_eq!(sensor.value, None);
        assert_eq!(sensor.last_known_value, None);
    }

    #[test]
    fn test_remove_sensor_drops_empty_command() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(single_sensor_command("uname -n", "hostname"));

        collection.remove_sensor("hostname").unwrap();

        assert!(collection.sensor_commands.is_empty());
        assert!(matches!(
            collection.remove_sensor("hostname"),
            Err(ManagerError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_remove_sensor_keeps_positions() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(SensorCommand::new(
            "uname -a",
            vec![text_sensor("os_name"), text_sensor("hostname")],
        ));

        collection.remove_sensor("os_name").unwrap();

        let command = collection.sensor_command_for("hostname").unwrap();
        assert_eq!(command.sensors.len(), 2);
        assert!(command.sensors[0].is_placeholder());
    }

    #[test]
    fn test_loop_detection_self_reference() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(single_sensor_command("echo &{a}", "a"));

        let error = collection.check().unwrap_err();
        assert_eq!(error, ManagerError::Command("loop detected: a".into()));
    }

    #[test]
    fn test_loop_detection_across_commands() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(single_sensor_command("echo &{b}", "a"));
        collection.add_sensor_command(single_sensor_command("echo &{a}", "b"));

        assert!(collection.check().is_err());
    }

    #[test]
    fn test_chain_without_loop_passes() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(single_sensor_command("ip route show default", "interface"));
        collection.add_sensor_command(single_sensor_command(
            "cat /sys/class/net/&{interface}/address",
            "mac_address",
        ));

        assert!(collection.check().is_ok());
    }

    #[test]
    fn test_missing_dependency_is_tolerated() {
        let mut collection = Collection::new("test");
        collection.add_sensor_command(single_sensor_command(
            "cat /sys/class/net/&{interface}/address",
            "mac_address",
        ));

        assert!(collection.check().is_ok());
    }

    #[test]
    fn test_version_latest_reference_must_be_plain() {
        use crate::sensor::{SensorKind, VersionConfig};

        let mut collection = Collection::new("test");
        collection.add_sensor_command(SensorCommand::new(
            "pkg version",
            vec![Sensor::with_key(
                SensorKind::Version(VersionConfig {
                    latest: Some("latest_version".to_string()),
                }),
                None,
                "installed_version",
            )],
        ));
        collection.add_sensor_command(SensorCommand::new(
            "pkg latest",
            vec![Sensor::with_key(
                SensorKind::Version(VersionConfig {
                    latest: Some("installed_version".to_string()),
                }),
                None,
                "latest_version",
            )],
        ));

        // the referenced sensor carries its own latest reference
        assert!(collection.check().is_err());
    }

    #[test]
    fn test_linked_sensors_participate_in_loop_detection() {
        let mut collection = Collection::new("test");
        let mut first = single_sensor_command("echo 1", "a");
        first.command.linked_sensors = vec!["b".to_string()];
        let mut second = single_sensor_command("echo 2", "b");
        second.command.linked_sensors = vec!["a".to_string()];

        collection.add_sensor_command(first);
        collection.add_sensor_command(second);

        assert!(collection.check().is_err());
    }
}
