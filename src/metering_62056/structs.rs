use crate::models::RegisterMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentification {
    pub manufacturer: String,
    pub baud_rate_id: char,
    pub identification: String,
}

#[derive(Debug, Clone)]
pub struct D0Telegram {
    pub identification: Option<DeviceIdentification>,
    pub registers: RegisterMap,
}
