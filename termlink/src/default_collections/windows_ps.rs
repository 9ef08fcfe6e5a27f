use std::time::Duration;

use super::keys::{action, sensor};
use crate::collection::Collection;
use crate::command::{ActionCommand, SensorCommand};
use crate::sensor::{NumberConfig, Sensor, SensorKind};

fn text(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::text(), Some(name), key)
}

fn number(name: &str, key: &str) -> Sensor {
    Sensor::with_key(SensorKind::number(), Some(name), key)
}

/// Stock catalog for Windows hosts over PowerShell.
pub fn windows_ps() -> Collection {
    Collection::with_commands(
        "Windows (PowerShell)",
        vec![
            ActionCommand::with_key("Stop-Computer -Force", Some("Turn off"), action::TURN_OFF),
            ActionCommand::with_key("Restart-Computer -Force", Some("Restart"), action::RESTART),
        ],
        vec![
            SensorCommand::new(
                "$x = Get-CimInstance Win32_ComputerSystem | Select Name, SystemType;\
                 $x.Name;$x.SystemType;",
                vec![
                    text("Hostname", sensor::HOSTNAME),
                    text("Machine Type", sensor::MACHINE_TYPE),
                ],
            ),
            SensorCommand::new(
                "$x = Get-CimInstance Win32_OperatingSystem | \
                 Select Caption, Version, OSArchitecture;\
                 $x.Caption;$x.Version;$x.OSArchitecture;",
                vec![
                    text("OS Name", sensor::OS_NAME),
                    text("OS Version", sensor::OS_VERSION),
                    text("OS Architecture", sensor::OS_ARCHITECTURE),
                ],
            ),
            SensorCommand::new(
                "$x = Get-CimInstance Win32_ComputerSystem | Select TotalPhysicalMemory;\
                 $x.TotalPhysicalMemory;",
                vec![number("Total Memory", sensor::TOTAL_MEMORY).with_unit("B")],
            ),
            SensorCommand::new(
                "$x = Get-CimInstance Win32_OperatingSystem | Select FreePhysicalMemory;\
                 $x.FreePhysicalMemory;",
                vec![number("Free Memory", sensor::FREE_MEMORY).with_unit("kB")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                r#"Get-CimInstance Win32_LogicalDisk | Select DeviceID, FreeSpace | ForEach-Object {$_.DeviceID + "|" + $_.FreeSpace}"#,
                vec![number("Free Disk Space", sensor::FREE_DISK_SPACE)
                    .with_unit("B")
                    .dynamic()],
            )
            .with_interval(Duration::from_secs(300))
            .with_separator("|"),
            SensorCommand::new(
                "$x = Get-CimInstance Win32_Processor | Select LoadPercentage;\
                 $x.LoadPercentage;",
                vec![number("CPU Load", sensor::CPU_LOAD).with_unit("%")],
            )
            .with_interval(Duration::from_secs(30)),
            SensorCommand::new(
                "$x = Get-CimInstance msacpi_thermalzonetemperature -namespace \"root/wmi\" | \
                 Select CurrentTemperature;($x.CurrentTemperature - 2732) / 10;",
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
                "(Get-Process).Count",
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
    fn test_windows_ps_collection_is_valid() {
        let collection = windows_ps();
        collection.check().unwrap();
        assert!(collection.has_sensor(sensor::TEMPERATURE));
    }
}
