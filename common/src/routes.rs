pub const PATH_HEATER: &str = "/heater";
pub const PATH_HEATER_ON: &str = "/heater/on";
pub const PATH_HEATER_OFF: &str = "/heater/off";
pub const PATH_DEBUG: &str = "/debug";

pub const REPORT_FIELD_TEMPERATURE: &str = "office_temperature";
