use std::time::Duration;

use super::keys::{action, sensor};
use crate::collection::Collection;
use crate::command::{ActionCommand, SensorCommand};
use crate::sensor::{BinaryConfig, NumberConfig, Sensor, SensorKind};

fn text(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::text(), Some(name), key)
}

fn number(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::number(), Some(name), key)
}

/// Stock catalog for Linux hosts.
pub fn linux() -> Collection {
    Collection::with_commands(
        "Linux",
        vec![
            ActionCommand::with_key("/sbin/shutdown -h now", Some("Turn off"), action::TURN_OFF),
            ActionCommand::with_key("/sbin/shutdown -r now", Some("Restart"), action::RESTART),
        ],
        vec![
            SensorCommand::new(
                "/sbin/route -n | awk '/^0.0.0.0/ {print $NF}'",
                vec![text("Network Interface", sensor::NETWORK_INTERFACE)],
            ),
            SensorCommand::new(
                "cat /sys/class/net/&{network_interface}/address",
                vec![text("MAC Address", sensor::MAC_ADDRESS)],
            ),
            SensorCommand::new(
                "file=/sys/class/net/&{network_interface}/device/power/wakeup; \
                 [ ! -f $file ] || cat $file",
                vec![Sensor::with_key(
                    SensorKind::Binary(BinaryConfig {
                        payload_on: Some("enabled".to_string()),
                        ..BinaryConfig::default()
                    }),
                    Some("Wake on LAN"),
                    sensor::WAKE_ON_LAN,
                )],
            ),
            SensorCommand::new(
                "uname -a | awk '{print $1; print $2; print $3; print $(NF-1)}'",
                vec![
                    text("OS Name", sensor::OS_NAME),
                    text("Hostname", sensor::HOSTNAME),
                    text("OS Version", sensor::OS_VERSION),
                    text("Machine Type", sensor::MACHINE_TYPE),
                ],
            ),
            SensorCommand::new(
                "uname -m",
                vec![text("OS Architecture", sensor::OS_ARCHITECTURE)],
            ),
            SensorCommand::new(
                "free -k | awk '/^Mem:/ {print $2}'",
                vec![number("Total Memory", sensor::TOTAL_MEMORY).with_unit("KiB")],
            ),
            SensorCommand::new(
                "free -k | awk '/^Mem:/ {print $4}'",
                vec![number("Free Memory", sensor::FREE_MEMORY).with_unit("KiB")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                r#"df -k | awk '/^\/dev\// {print $6 "|" $4}'"#,
                vec![number("Free Disk Space", sensor::FREE_DISK_SPACE)
                    .with_unit("KiB")
                    .dynamic()],
            )
            .with_interval(Duration::from_secs(300))
            .with_separator("|"),
            SensorCommand::new(
                "top -bn1 | awk 'NR<4 && tolower($0)~/cpu/ {print 100-$8}'",
                vec![number("CPU Load", sensor::CPU_LOAD).with_unit("%")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                "echo $(($(cat /sys/class/thermal/thermal_zone0/temp) / 1000))",
                vec![Sensor::with_key(
                    SensorKind::Number(NumberConfig {
                        float: true,
                        ..NumberConfig::default()
                    }),
                    Some("Temperature"),
                    sensor::TEMPERATURE,
                )
                .with_unit("°C")],
            )
            .with_interval(Duration::from_secs(60)),
            SensorCommand::new(
                "ps -e | awk 'END {print NR-1}'",
                vec![number("Processes", sensor::PROCESSES)],
            )
            .with_interval(Duration::from_secs(60)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_collection_is_valid() {
        let collection = linux();
        collection.check().unwrap();
        assert!(collection.action_command(action::TURN_OFF).is_some());
        assert!(collection.has_sensor(sensor::FREE_DISK_SPACE));
    }

    #[test]
    fn test_mac_address_depends_on_interface() {
        let collection = linux();
        let command = collection.sensor_command_for(sensor::MAC_ADDRESS).unwrap();
        assert_eq!(
            command.command.required_sensors(),
            vec![sensor::NETWORK_INTERFACE.to_string()]
        );
    }
}
