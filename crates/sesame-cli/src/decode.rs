//! OS3 抓包解密
//!
//! 会话密钥为 `CMAC(secret, nonce)`。central 解密设备发来的报文，
//! peripheral 解密手机发来的报文，两个方向的 IV 计数器各自推进。

use anyhow::{Context, Result};
use sesame_core::crypto::{CryptSession, Role, aes_cmac};
use sesame_core::util::hex_to_array;
use sesame_core::{DecodeResult, OsVersion, Transport};

struct Side {
    crypt: CryptSession,
    transport: Transport,
}

impl Side {
    fn new(role: Role, key: &[u8; 16], local: &[u8; 4], remote: &[u8; 4]) -> Result<Self> {
        let mut crypt = CryptSession::new(OsVersion::Os3, role);
        crypt.set_session_key(key, local, remote)?;
        Ok(Self {
            crypt,
            transport: Transport::new(),
        })
    }
}

pub fn run(secret: &str, nonce: &str, peripheral: bool, fragments: &[String]) -> Result<()> {
    let secret: [u8; 16] = hex_to_array(secret).context("secret must be 32 hex characters")?;
    let nonce: [u8; 4] = hex_to_array(nonce).context("nonce must be 8 hex characters")?;
    let key = aes_cmac(&secret, &[nonce.as_slice()])?;
    println!("session key={}", hex::encode(key));

    let mut central = Side::new(Role::Central, &key, &[0; 4], &nonce)?;
    let mut device = Side::new(Role::Peripheral, &key, &nonce, &[0; 4])?;
    let mut as_peripheral = peripheral;

    for input in fragments {
        let input = input.trim();
        if input.eq_ignore_ascii_case("c") {
            println!("AS central");
            as_peripheral = false;
            continue;
        }
        if input.eq_ignore_ascii_case("p") {
            println!("AS peripheral");
            as_peripheral = true;
            continue;
        }
        let Ok(data) = hex::decode(input) else {
            println!("{input}: invalid input");
            continue;
        };
        let side = if as_peripheral {
            &mut device
        } else {
            &mut central
        };
        match side.transport.decode(&data, &mut side.crypt) {
            DecodeResult::Received => {
                let msg = side.transport.data();
                println!("decoded({}) {}", msg.len(), hex::encode(msg));
            }
            DecodeResult::RequireMore => println!(">> ({} bytes)", data.len()),
            DecodeResult::Skipping | DecodeResult::Dropped => {
                log::debug!("fragment {input} discarded");
                println!("decode failed");
            }
        }
    }
    Ok(())
}
