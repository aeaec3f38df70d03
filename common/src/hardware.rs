pub const LED_GPIO: i32 = 10;
pub const RELAY_GPIO: i32 = 13;
pub const I2C_SDA_GPIO: i32 = 12;
pub const I2C_SCL_GPIO: i32 = 14;

pub const MCP9808_ADDR: u8 = 0x1F;
