use log::debug;
use regex::Regex;
use serde_json::Map;

use crate::collection::Collection;
use crate::command::Command;
use crate::error::{ManagerError, Result};
use crate::event::Event;
use crate::helpers::name_to_key;
use crate::renderer::Renderer;
use crate::value::Value;

/// Key of the sentinel left in a sensor command's sensor list after a
/// removal, so the remaining sensors keep their positions.
pub const PLACEHOLDER_KEY: &str = "_";

const TRUE_STRINGS: [&str; 5] = ["true", "enabled", "on", "active", "1"];
const FALSE_STRINGS: [&str; 5] = ["false", "disabled", "off", "inactive", "0"];

/// One parsed row of a dynamic sensor command's output.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicRow {
    pub id: String,
    pub name: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct TextConfig {
    /// Minimum length in characters.
    pub minimum: Option<usize>,
    /// Maximum length in characters.
    pub maximum: Option<usize>,
    /// Full-match pattern.
    pub pattern: Option<String>,
    /// Whitelist of accepted values.
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct NumberConfig {
    /// Float readings instead of integers.
    pub float: bool,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct BinaryConfig {
    pub command_on: Option<Command>,
    pub command_off: Option<Command>,
    pub payload_on: Option<String>,
    pub payload_off: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VersionConfig {
    /// Key of the version sensor holding the latest available version.
    pub latest: Option<String>,
}

/// Variant-specific configuration; shared state lives on [`Sensor`].
#[derive(Debug, Clone)]
pub enum SensorKind {
    Text(TextConfig),
    Number(NumberConfig),
    Binary(BinaryConfig),
    Version(VersionConfig),
}

impl SensorKind {
    pub fn text() -> Self {
        SensorKind::Text(TextConfig::default())
    }

    pub fn number() -> Self {
        SensorKind::Number(NumberConfig::default())
    }

    pub fn float_number() -> Self {
        SensorKind::Number(NumberConfig {
            float: true,
            ..NumberConfig::default()
        })
    }

    pub fn binary() -> Self {
        SensorKind::Binary(BinaryConfig::default())
    }

    pub fn version() -> Self {
        SensorKind::Version(VersionConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: Option<String>,
    pub key: String,
    pub kind: SensorKind,
    pub dynamic: bool,
    pub unit: Option<String>,
    pub renderer: Option<Renderer>,
    pub command_set: Option<Box<Command>>,
    pub linked_sensors: Vec<String>,
    pub attributes: Map<String, serde_json::Value>,

    /// Set on dynamic children only, from the row id.
    pub id: Option<String>,
    pub value: Option<Value>,
    /// Last non-null reading; never cleared by a null update.
    pub last_known_value: Option<Value>,
    pub child_sensors: Vec<Sensor>,

    pub on_update: Event<Sensor>,
    pub on_child_added: Event<Sensor>,
    pub on_child_removed: Event<Sensor>,
}

impl Sensor {
    /// Create a sensor, deriving the key from the name.
    pub fn new(kind: SensorKind, name: &str) -> Result<Self> {
        let key = name_to_key(name)?;
        Ok(Self::with_key(kind, Some(name), &key))
    }

    pub fn with_key(kind: SensorKind, name: Option<&str>, key: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            key: key.to_string(),
            kind,
            dynamic: false,
            unit: None,
            renderer: None,
            command_set: None,
            linked_sensors: Vec::new(),
            attributes: Map::new(),
            id: None,
            value: None,
            last_known_value: None,
            child_sensors: Vec::new(),
            on_update: Event::new(),
            on_child_added: Event::new(),
            on_child_removed: Event::new(),
        }
    }

    pub fn placeholder() -> Self {
        Self::with_key(SensorKind::text(), None, PLACEHOLDER_KEY)
    }

    pub fn is_placeholder(&self) -> bool {
        self.key == PLACEHOLDER_KEY
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_command_set(mut self, command: Command) -> Self {
        self.command_set = Some(Box::new(command));
        self
    }

    pub fn with_linked_sensors(mut self, keys: &[&str]) -> Self {
        self.linked_sensors = keys.iter().map(|key| key.to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn controllable(&self) -> bool {
        if let SensorKind::Binary(config) = &self.kind {
            if config.command_on.is_some() && config.command_off.is_some() {
                return true;
            }
        }
        self.command_set.is_some()
    }

    /// The command that sets `value` on the host, if any.
    pub fn control_command(&self, value: &Value) -> Option<Command> {
        if let SensorKind::Binary(config) = &self.kind {
            match value {
                Value::Bool(true) if config.command_on.is_some() => {
                    return config.command_on.clone();
                }
                Value::Bool(false) if config.command_off.is_some() => {
                    return config.command_off.clone();
                }
                _ => {}
            }
        }
        self.command_set.as_deref().cloned()
    }

    /// Keys to poll after the owning command ran, including the latest
    /// version reference of this sensor and of its children.
    pub fn linked_sensor_keys(&self) -> Vec<String> {
        let mut keys = self.linked_sensors.clone();
        if let SensorKind::Version(config) = &self.kind {
            if let Some(latest) = &config.latest {
                keys.push(latest.clone());
            }
        }
        for child in &self.child_sensors {
            for key in child.linked_sensor_keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn child_sensor(&self, key: &str) -> Option<&Sensor> {
        self.child_sensors.iter().find(|child| child.key == key)
    }

    fn rendered(&self, data: &str) -> Result<String> {
        let data = match &self.renderer {
            Some(renderer) => renderer.render(data)?,
            None => data.to_string(),
        };
        Ok(data.trim().to_string())
    }

    fn convert(&self, value_string: &str) -> Result<Value> {
        match &self.kind {
            SensorKind::Text(_) => Ok(Value::Text(value_string.to_string())),
            SensorKind::Version(_) => Ok(Value::Text(value_string.to_string())),
            SensorKind::Number(config) => {
                // Integers go through float first to tolerate "12.0".
                let number: f64 = value_string.parse().map_err(|_| {
                    ManagerError::sensor(
                        &self.key,
                        format!("can't generate number from '{}'", value_string),
                    )
                })?;
                if config.float {
                    Ok(Value::Float(number))
                } else {
                    Ok(Value::Integer(number as i64))
                }
            }
            SensorKind::Binary(config) => self.convert_binary(config, value_string),
        }
    }

    fn convert_binary(&self, config: &BinaryConfig, value_string: &str) -> Result<Value> {
        if let Some(payload_on) = &config.payload_on {
            if value_string == payload_on {
                return Ok(Value::Bool(true));
            }
            if config.payload_off.is_none() {
                return Ok(Value::Bool(false));
            }
        }

        if let Some(payload_off) = &config.payload_off {
            if value_string == payload_off {
                return Ok(Value::Bool(false));
            }
            if config.payload_on.is_none() {
                return Ok(Value::Bool(true));
            }
        }

        let lowered = value_string.to_lowercase();
        if TRUE_STRINGS.contains(&lowered.as_str()) {
            return Ok(Value::Bool(true));
        }
        if FALSE_STRINGS.contains(&lowered.as_str()) {
            return Ok(Value::Bool(false));
        }

        Err(ManagerError::sensor(
            &self.key,
            format!("can't generate bool from '{}'", value_string),
        ))
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        match &self.kind {
            SensorKind::Text(config) => self.validate_text(config, value),
            SensorKind::Number(config) => self.validate_number(config, value),
            SensorKind::Binary(_) => match value {
                Value::Bool(_) => Ok(()),
                other => Err(ManagerError::sensor(
                    &self.key,
                    format!("{} is {} and not bool", other, other.type_name()),
                )),
            },
            SensorKind::Version(_) => match value {
                Value::Text(text) if !text.is_empty() => Ok(()),
                other => Err(ManagerError::sensor(
                    &self.key,
                    format!("'{}' is not a version string", other),
                )),
            },
        }
    }

    fn validate_text(&self, config: &TextConfig, value: &Value) -> Result<()> {
        let text = value.as_text().ok_or_else(|| {
            ManagerError::sensor(
                &self.key,
                format!("{} is {} and not text", value, value.type_name()),
            )
        })?;

        if text.is_empty() {
            return Err(ManagerError::sensor(&self.key, "empty string"));
        }

        if let Some(minimum) = config.minimum {
            if text.chars().count() < minimum {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("'{}' is shorter than {}", text, minimum),
                ));
            }
        }

        if let Some(maximum) = config.maximum {
            if text.chars().count() > maximum {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("'{}' is longer than {}", text, maximum),
                ));
            }
        }

        if let Some(pattern) = &config.pattern {
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|error| {
                ManagerError::sensor(&self.key, format!("invalid pattern ({})", error))
            })?;
            if !regex.is_match(text) {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("'{}' doesn't match {}", text, pattern),
                ));
            }
        }

        if let Some(options) = &config.options {
            if !options.iter().any(|option| option == text) {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("'{}' is not in {:?}", text, options),
                ));
            }
        }

        Ok(())
    }

    fn validate_number(&self, config: &NumberConfig, value: &Value) -> Result<()> {
        match (config.float, value) {
            (true, Value::Float(_)) | (false, Value::Integer(_)) => {}
            (true, other) => {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("{} is {} and not float", other, other.type_name()),
                ))
            }
            (false, other) => {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("{} is {} and not integer", other, other.type_name()),
                ))
            }
        }

        let number = value.as_number().unwrap_or_default();

        if let Some(minimum) = config.minimum {
            if number < minimum {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("{} is smaller than {}", number, minimum),
                ));
            }
        }

        if let Some(maximum) = config.maximum {
            if number > maximum {
                return Err(ManagerError::sensor(
                    &self.key,
                    format!("{} is bigger than {}", number, maximum),
                ));
            }
        }

        Ok(())
    }

    /// Update a static sensor from one output line, `None` meaning no data.
    ///
    /// A failed render/convert/validate nulls `value` but never
    /// `last_known_value`.
    pub fn update_value(&mut self, data: Option<&str>) {
        self.child_sensors.clear();

        match data {
            None => {
                self.value = None;
                debug!("sensor {} => None", self.key);
            }
            Some(data) => {
                let converted = self
                    .rendered(data)
                    .and_then(|value_string| self.convert(&value_string))
                    .and_then(|value| {
                        self.validate(&value)?;
                        Ok(value)
                    });
                match converted {
                    Ok(value) => {
                        debug!("sensor {} => {}", self.key, value);
                        self.value = Some(value.clone());
                        self.last_known_value = Some(value);
                    }
                    Err(error) => {
                        debug!("sensor {} => None ({})", self.key, error);
                        self.value = None;
                    }
                }
            }
        }

        self.on_update.notify(self);
    }

    /// Update a dynamic sensor from its parsed rows, `None` meaning no data.
    ///
    /// Children are reconciled against the row set: new ids appear, known
    /// ids update, absent ids are dropped. On `None` the children remain
    /// with nulled values.
    pub fn update_rows(&mut self, rows: Option<&[DynamicRow]>) {
        self.value = None;
        self.last_known_value = None;

        match rows {
            None => {
                for child in &mut self.child_sensors {
                    child.update_value(None);
                }
            }
            Some(rows) => self.reconcile_children(rows),
        }

        self.on_update.notify(self);
    }

    fn reconcile_children(&mut self, rows: &[DynamicRow]) {
        let mut keyed: Vec<(String, &DynamicRow)> = Vec::with_capacity(rows.len());
        for row in rows {
            let slug = match name_to_key(&row.id) {
                Ok(slug) => slug,
                Err(_) => {
                    debug!("sensor {}: discarding row with id '{}'", self.key, row.id);
                    continue;
                }
            };
            let key = format!("{}_{}", self.key, slug);
            match keyed.iter_mut().find(|(known, _)| *known == key) {
                Some(slot) => slot.1 = row,
                None => keyed.push((key, row)),
            }
        }

        for (key, row) in &keyed {
            if self.child_sensor(key).is_none() {
                let child = self.make_child(key, row);
                self.child_sensors.push(child);
                if let Some(added) = self.child_sensors.last() {
                    self.on_child_added.notify(added);
                }
            }
        }

        let mut index = 0;
        while index < self.child_sensors.len() {
            let key = self.child_sensors[index].key.clone();
            match keyed.iter().find(|(known, _)| *known == key) {
                Some((_, row)) => {
                    self.child_sensors[index].update_value(Some(row.data.as_str()));
                    index += 1;
                }
                None => {
                    let removed = self.child_sensors.remove(index);
                    self.on_child_removed.notify(&removed);
                }
            }
        }
    }

    fn make_child(&self, key: &str, row: &DynamicRow) -> Sensor {
        let display = row.name.clone().unwrap_or_else(|| row.id.clone());
        let name = match &self.name {
            Some(parent) => format!("{} {}", parent, display),
            None => display,
        };

        let mut child = self.clone();
        child.name = Some(name);
        child.key = key.to_string();
        child.id = Some(row.id.clone());
        child.dynamic = false;
        child.value = None;
        child.last_known_value = None;
        child.child_sensors = Vec::new();

        if let SensorKind::Version(config) = &mut child.kind {
            if let (Some(latest), Ok(slug)) = (config.latest.clone(), name_to_key(&row.id)) {
                config.latest = Some(format!("{}_{}", latest, slug));
            }
        }

        child
    }

    /// Validate `value` and pick the control command for it.
    ///
    /// Returns `None` when there is nothing to do: no control command, or
    /// the sensor already reads the intended value.
    pub(crate) fn prepare_set(&self, value: &Value) -> Result<Option<Command>> {
        self.validate(value)?;

        let command = match self.control_command(value) {
            Some(command) => command,
            None => return Ok(None),
        };

        if self.value.as_ref() == Some(value) {
            return Ok(None);
        }

        Ok(Some(command))
    }

    pub(crate) fn clear_runtime(&mut self) {
        self.id = None;
        self.value = None;
        self.last_known_value = None;
        self.child_sensors = Vec::new();
    }

    pub(crate) fn check(&self, collection: &Collection) -> Result<()> {
        if let SensorKind::Text(config) = &self.kind {
            if let Some(pattern) = &config.pattern {
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|error| {
                    ManagerError::sensor(&self.key, format!("invalid pattern ({})", error))
                })?;
            }
        }

        if let SensorKind::Version(config) = &self.kind {
            if let Some(latest_key) = &config.latest {
                if let Some(latest) = collection.sensor(latest_key) {
                    match &latest.kind {
                        SensorKind::Version(latest_config) => {
                            if latest_config.latest.is_some() || latest.command_set.is_some() {
                                return Err(ManagerError::sensor(
                                    &self.key,
                                    format!("latest reference '{}' must be a plain version sensor", latest_key),
                                ));
                            }
                        }
                        _ => {
                            return Err(ManagerError::sensor(
                                &self.key,
                                format!("latest reference '{}' is not a version sensor", latest_key),
                            ))
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
