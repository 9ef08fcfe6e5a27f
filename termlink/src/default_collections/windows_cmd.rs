use std::time::Duration;

use super::keys::{action, sensor};
use crate::collection::Collection;
use crate::command::{ActionCommand, SensorCommand};
use crate::sensor::{Sensor, SensorKind};

fn text(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::text(), Some(name), key)
}

fn number(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::number(), Some(name), key)
}

/// Stock catalog for Windows hosts over cmd.exe.
pub fn windows_cmd() -> Collection {
    Collection::with_commands(
        "Windows",
        vec![
            ActionCommand::with_key("shutdown -t 0", Some("Turn off"), action::TURN_OFF),
            ActionCommand::with_key("shutdown -r -t 0", Some("Restart"), action::RESTART),
        ],
        vec![
            SensorCommand::new(
                "for /f %i in ('wmic path win32_ip4routetable \
                 where \"Destination='0.0.0.0'\" get InterfaceIndex ^| \
                 findstr /r \"\\<[0-9][0-9]*\\>\"') do \
                 @for /f \"skip=2 tokens=2,3 delims=,\" %j in ('wmic nic \
                 where \"InterfaceIndex=%i\" \
                 get MACAddress^,NetConnectionID /format:csv') do \
                 @echo %j & @echo %k",
                vec![
                    text("MAC Address", sensor::MAC_ADDRESS),
                    text("Network Interface", sensor::NETWORK_INTERFACE),
                ],
            ),
            SensorCommand::new("hostname", vec![text("Hostname", sensor::HOSTNAME)]),
            SensorCommand::new(
                "for /f \"skip=1 tokens=*\" %i in ('wmic ComputerSystem get SystemType') do @echo %i",
                vec![text("Machine Type", sensor::MACHINE_TYPE)],
            ),
            SensorCommand::new(
                "for /f \"skip=1 tokens=*\" %i in ('wmic OS get Caption') do @echo %i",
                vec![text("OS Name", sensor::OS_NAME)],
            ),
            SensorCommand::new(
                "for /f \"skip=1\" %i in ('wmic OS get Version') do @echo %i",
                vec![text("OS Version", sensor::OS_VERSION)],
            ),
            SensorCommand::new(
                "for /f \"skip=1\" %i in ('wmic OS get OSArchitecture') do @echo %i",
                vec![text("OS Architecture", sensor::OS_ARCHITECTURE)],
            ),
            SensorCommand::new(
                "for /f \"skip=1\" %i in ('wmic ComputerSystem get TotalPhysicalMemory') do @echo %i",
                vec![number("Total Memory", sensor::TOTAL_MEMORY).with_unit("B")],
            ),
            SensorCommand::new(
                "for /f \"skip=1\" %i in ('wmic OS get FreePhysicalMemory') do @echo %i",
                vec![number("Free Memory", sensor::FREE_MEMORY).with_unit("kB")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                "for /f \"tokens=1,2\" %i in ('wmic LogicalDisk get DeviceID^,FreeSpace ^| \
                 findstr \":\"') do @echo %i^|%j",
                vec![number("Free Disk Space", sensor::FREE_DISK_SPACE)
                    .with_unit("B")
                    .dynamic()],
            )
            .with_interval(Duration::from_secs(60))
            .with_separator("|"),
            SensorCommand::new(
                "for /f \"skip=1\" %i in ('wmic CPU get LoadPercentage') do @echo %i",
                vec![number("CPU Load", sensor::CPU_LOAD).with_unit("%")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                "for /f %i in ('wmic /namespace:\\\\root\\wmi \
                 path MSAcpi_ThermalZoneTemperature get CurrentTemperature ^| \
                 findstr /r \"\\<[0-9][0-9]*\\>\"') do \
                 @set /a x=(%i - 2732) / 10",
                vec![number("Temperature", sensor::TEMPERATURE).with_unit("°C")],
            )
            .with_interval(Duration::from_secs(60)),
            SensorCommand::new(
                "wmic process get processId | findstr /r \"\\<[0-9][0-9]*\\>\" | find /c /v \"\"",
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
    fn test_windows_cmd_collection_is_valid() {
        let collection = windows_cmd();
        collection.check().unwrap();
        assert!(collection.has_sensor(sensor::MAC_ADDRESS));
    }
}
