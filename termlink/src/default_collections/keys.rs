//! Canonical keys shared by the stock collections.

pub mod action {
    pub const TURN_OFF: &str = "turn_off";
    pub const RESTART: &str = "restart";
}

pub mod sensor {
    pub const NETWORK_INTERFACE: &str = "network_interface";
    pub const MAC_ADDRESS: &str = "mac_address";
    pub const WAKE_ON_LAN: &str = "wake_on_lan";
    pub const MACHINE_TYPE: &str = "machine_type";
    pub const HOSTNAME: &str = "hostname";
    pub const OS_NAME: &str = "os_name";
    pub const OS_VERSION: &str = "os_version";
    pub const OS_ARCHITECTURE: &str = "os_architecture";
    pub const TOTAL_MEMORY: &str = "total_memory";
    pub const FREE_MEMORY: &str = "free_memory";
    pub const CPU_LOAD: &str = "cpu_load";
    pub const FREE_DISK_SPACE: &str = "free_disk_space";
    pub const TEMPERATURE: &str = "temperature";
    pub const PROCESSES: &str = "processes";
}
