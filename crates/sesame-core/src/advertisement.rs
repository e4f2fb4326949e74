//! 广播数据与 BLE 地址
//!
//! 厂商数据格式: `[5a 05][model][00][flags][uuid16]`，
//! OS2 设备的 UUID 放在设备名中 (去掉填充的 base64)。

use base64::{Engine as _, engine::general_purpose};
use uuid::Uuid;

use crate::crypto::{CryptoError, aes_cmac};
use crate::protocol::{COMPANY_ID, Model, OsVersion};

const MIN_MANUFACTURER_DATA_SIZE: usize = 5;
const UUID_OFFSET: usize = 5;
const NAME_SIZE: usize = 22;
const WIFI_MODULE_UUID_HEAD: [u8; 10] = [0x00, 0x00, 0x00, 0x00, 0x05, 0x5a, 0xfd, 0x81, 0x00, 0x01];
const ADDRESS_SALT: &[u8] = b"candy";

#[derive(Debug, thiserror::Error)]
pub enum AdvertisementError {
    #[error("Unexpected manufacturer id")]
    ForeignManufacturer,
    #[error("Manufacturer data too short: {0} bytes")]
    TooShort(usize),
    #[error("Unknown model code: {0}")]
    UnknownModel(u8),
    #[error("Unexpected device name: {0:?}")]
    BadName(String),
}

/// 解析后的广播
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub model: Model,
    pub flags: u8,
    pub uuid: Uuid,
}

impl Advertisement {
    pub fn is_registered(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// 用于发出广播的数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub manufacturer_data: Vec<u8>,
    pub local_name: String,
}

pub fn parse_advertisement(
    manufacturer_data: &[u8],
    name: &str,
) -> Result<Advertisement, AdvertisementError> {
    if manufacturer_data.len() < MIN_MANUFACTURER_DATA_SIZE {
        return Err(AdvertisementError::TooShort(manufacturer_data.len()));
    }
    if manufacturer_data[..2] != COMPANY_ID.to_le_bytes() {
        return Err(AdvertisementError::ForeignManufacturer);
    }
    let code = manufacturer_data[2];
    let model = Model::from_code(code as i8).ok_or(AdvertisementError::UnknownModel(code))?;
    let flags = manufacturer_data[4];

    let uuid = if model == Model::Wifi2 {
        let tail = manufacturer_data
            .get(UUID_OFFSET..UUID_OFFSET + 6)
            .ok_or(AdvertisementError::TooShort(manufacturer_data.len()))?;
        let mut bytes = [0u8; 16];
        bytes[..10].copy_from_slice(&WIFI_MODULE_UUID_HEAD);
        bytes[10..].copy_from_slice(tail);
        Uuid::from_bytes(bytes)
    } else {
        match model.os_version() {
            OsVersion::Os2 => uuid_from_name(name)?,
            OsVersion::Os3 => {
                let raw = manufacturer_data
                    .get(UUID_OFFSET..UUID_OFFSET + 16)
                    .ok_or(AdvertisementError::TooShort(manufacturer_data.len()))?;
                Uuid::from_slice(raw).map_err(|_| AdvertisementError::TooShort(raw.len()))?
            }
            OsVersion::Unknown => return Err(AdvertisementError::UnknownModel(code)),
        }
    };
    Ok(Advertisement { model, flags, uuid })
}

fn uuid_from_name(name: &str) -> Result<Uuid, AdvertisementError> {
    if name.len() != NAME_SIZE {
        return Err(AdvertisementError::BadName(name.to_string()));
    }
    let padded = format!("{name}==");
    general_purpose::STANDARD
        .decode(padded)
        .ok()
        .and_then(|bytes| Uuid::from_slice(&bytes).ok())
        .ok_or_else(|| AdvertisementError::BadName(name.to_string()))
}

/// OS3 设备的广播数据，设备名为 UUID 的 base64 前 22 字符
pub fn build_advertisement_os3(model: Model, registered: bool, uuid: &Uuid) -> AdvertisementData {
    let mut manufacturer_data = Vec::with_capacity(UUID_OFFSET + 16);
    manufacturer_data.extend_from_slice(&COMPANY_ID.to_le_bytes());
    manufacturer_data.push(model.code() as u8);
    manufacturer_data.push(0);
    manufacturer_data.push(u8::from(registered));
    manufacturer_data.extend_from_slice(uuid.as_bytes());

    let mut local_name = general_purpose::STANDARD.encode(uuid.as_bytes());
    local_name.truncate(NAME_SIZE);
    AdvertisementData {
        manufacturer_data,
        local_name,
    }
}

/// 由 UUID 推导 BLE 地址 (SESAME 5 及之后)
///
/// 最高两位固定为 1，即 random static 地址。
pub fn uuid_to_ble_address(uuid: &Uuid) -> Result<[u8; 6], CryptoError> {
    let mac = aes_cmac(uuid.as_bytes(), &[ADDRESS_SALT])?;
    Ok([mac[5] | 0xc0, mac[4], mac[3], mac[2], mac[1], mac[0]])
}

pub fn format_ble_address(addr: &[u8; 6]) -> String {
    addr.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
