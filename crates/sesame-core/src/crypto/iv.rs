//! 方向 IV 策略
//!
//! IV 共 13 字节: 前 5 字节为小端计数器，后 8 字节为握手时确定的 nonce 材料。
//! 每次 AEAD 操作后对应方向的计数器加一。

use crate::protocol::TOKEN_SIZE;

pub const IV_SIZE: usize = 13;
const COUNTER_SIZE: usize = 5;

const OS2_COUNTER_MASK: u64 = 0x7f_ffff_ffff;
const OS2_C2P_BIT: u64 = 0x80_0000_0000;

pub type Iv = [u8; IV_SIZE];

/// 会话中本端的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 手机 / 网关
    Central,
    /// 锁本体
    Peripheral,
}

fn write_counter(iv: &mut Iv, count: u64) {
    iv[..COUNTER_SIZE].copy_from_slice(&count.to_le_bytes()[..COUNTER_SIZE]);
}

/// OS2: 单计数器，最高位区分方向
///
/// central→peripheral 方向最高位恒为 1，反方向恒为 0。
#[derive(Debug, Clone, Default)]
pub struct Os2Iv {
    c2p_count: u64,
    p2c_count: u64,
}

/// OS3: 两个方向各自独立计数
#[derive(Debug, Clone, Default)]
pub struct Os3Iv {
    c2p_count: u64,
    p2c_count: u64,
}

#[derive(Debug, Clone)]
pub enum IvPolicy {
    Os2(Os2Iv),
    Os3(Os3Iv),
}

impl IvPolicy {
    pub fn os2() -> Self {
        IvPolicy::Os2(Os2Iv::default())
    }

    pub fn os3() -> Self {
        IvPolicy::Os3(Os3Iv::default())
    }

    /// 计数器归零并写入 nonce 材料
    ///
    /// OS2 为 `[count][central nonce][peripheral nonce]`，
    /// OS3 只使用外设 nonce，位于偏移 9。
    pub fn init_ivs(
        &mut self,
        central_nonce: &[u8; TOKEN_SIZE],
        peripheral_nonce: &[u8; TOKEN_SIZE],
        c2p: &mut Iv,
        p2c: &mut Iv,
    ) {
        *c2p = [0u8; IV_SIZE];
        *p2c = [0u8; IV_SIZE];
        match self {
            IvPolicy::Os2(s) => {
                p2c[COUNTER_SIZE..COUNTER_SIZE + TOKEN_SIZE].copy_from_slice(central_nonce);
                p2c[COUNTER_SIZE + TOKEN_SIZE..].copy_from_slice(peripheral_nonce);
                *c2p = *p2c;
                s.p2c_count = 0;
                s.c2p_count = OS2_C2P_BIT;
                write_counter(c2p, s.c2p_count);
            }
            IvPolicy::Os3(s) => {
                p2c[COUNTER_SIZE + TOKEN_SIZE..].copy_from_slice(peripheral_nonce);
                *c2p = *p2c;
                s.c2p_count = 0;
                s.p2c_count = 0;
            }
        }
    }

    pub fn advance_c2p(&mut self, iv: &mut Iv) {
        match self {
            IvPolicy::Os2(s) => {
                s.c2p_count = ((s.c2p_count + 1) & OS2_COUNTER_MASK) | OS2_C2P_BIT;
                write_counter(iv, s.c2p_count);
            }
            IvPolicy::Os3(s) => {
                s.c2p_count += 1;
                write_counter(iv, s.c2p_count);
            }
        }
    }

    pub fn advance_p2c(&mut self, iv: &mut Iv) {
        match self {
            IvPolicy::Os2(s) => {
                s.p2c_count = (s.p2c_count + 1) & OS2_COUNTER_MASK;
                write_counter(iv, s.p2c_count);
            }
            IvPolicy::Os3(s) => {
                s.p2c_count += 1;
                write_counter(iv, s.p2c_count);
            }
        }
    }

    /// (c2p, p2c) 当前计数值
    pub fn counters(&self) -> (u64, u64) {
        match self {
            IvPolicy::Os2(s) => (s.c2p_count, s.p2c_count),
            IvPolicy::Os3(s) => (s.c2p_count, s.p2c_count),
        }
    }
}
