//! 字符串与十六进制工具
//!
//! 标签 (tag) 需要按 UTF-8 边界截断；十六进制密钥需要严格长度校验。

pub use hex::FromHexError as KeyParseError;

/// 截断到不超过 `limit` 字节，且不拆分多字节字符
pub fn truncate_utf8(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// 取出设备发来的标签中有效的 UTF-8 前缀
///
/// 遇到 NUL、截断的多字节序列或非法字节即停止。
pub fn cleanup_tail_utf8(bytes: &[u8]) -> &str {
    let bytes = match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        // valid_up_to 之前的部分保证是合法 UTF-8
        Err(e) => std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    }
}

/// 十六进制字符串解码为定长数组，长度必须完全一致
pub fn hex_to_array<const N: usize>(s: &str) -> Result<[u8; N], KeyParseError> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s.trim(), &mut out)?;
    Ok(out)
}
