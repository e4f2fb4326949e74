//! 操作历史记录解码

use super::{
    HistoryType, MAX_HISTORY_TAG_SIZE_OS2, MAX_HISTORY_TAG_SIZE_OS3, ResultCode, TriggerType,
    parse_trigger_tag,
};
use crate::util::cleanup_tail_utf8;

/// OS2 历史头: op2, result, record_id, type, timestamp(ms)
const OS2_HEADER_SIZE: usize = 15;
/// OS2 头与标签之间的未知字段
const OS2_SKIP_SIZE: usize = 18;
/// OS3 历史头: result, record_id, type, timestamp(s), mech status
const OS3_HEADER_SIZE: usize = 17;

/// 一条历史记录
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct History {
    pub result: ResultCode,
    pub history_type: HistoryType,
    pub trigger_type: Option<TriggerType>,
    pub record_id: i32,
    /// Unix 秒
    pub time: i64,
    pub tag: String,
}

impl History {
    fn failed(result: ResultCode) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    /// 解码 OS2 的 `response/history` 消息体 (含首字节 op)
    ///
    /// 过短的消息体仍然产出一条空记录。
    pub fn decode_os2(body: &[u8]) -> Self {
        if body.len() < 2 {
            log::debug!("{}: Unexpected size of history", body.len());
            return Self::default();
        }
        let result = ResultCode::from_u8(body[1]);
        if result != ResultCode::Success {
            log::debug!("{result:?}: Failure response to request history");
            return Self::failed(result);
        }
        if body.len() < OS2_HEADER_SIZE {
            log::debug!("{}: Unexpected size of history", body.len());
            return Self::failed(result);
        }
        let record_id = i32::from_le_bytes([body[2], body[3], body[4], body[5]]);
        let raw_type = body[6];
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&body[7..15]);
        let time = i64::from_le_bytes(ts) / 1000;

        let mut history_type = HistoryType::try_from(raw_type).unwrap_or_default();
        if raw_type > HistoryType::WebUnlock as u8 && history_type != HistoryType::DriveClicked {
            history_type = HistoryType::None;
        }
        let mut history = Self {
            result,
            history_type,
            record_id,
            time,
            ..Self::default()
        };
        if let Some(tag_data) = body.get(OS2_HEADER_SIZE + OS2_SKIP_SIZE..) {
            history.apply_tag(tag_data, MAX_HISTORY_TAG_SIZE_OS2);
        }
        history
    }

    /// 解码 OS3 的 `response/history` 消息体 (首字节为 result)
    ///
    /// 空消息体返回 `None`，调用方应忽略。
    pub fn decode_os3(body: &[u8]) -> Option<Self> {
        let &first = body.first()?;
        let result = ResultCode::from_u8(first);
        if result != ResultCode::Success || body.len() < OS3_HEADER_SIZE {
            log::debug!("{result:?}: Empty history");
            return Some(Self::failed(result));
        }
        let record_id = i32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        let history_type = HistoryType::try_from(body[5]).unwrap_or_default();
        let time = i64::from(u32::from_le_bytes([body[6], body[7], body[8], body[9]]));
        let mut history = Self {
            result,
            history_type,
            record_id,
            time,
            ..Self::default()
        };
        let tag_data = &body[OS3_HEADER_SIZE..];
        match parse_trigger_tag(tag_data) {
            Some((trigger, tag)) => {
                history.trigger_type = trigger;
                history.tag = tag;
            }
            None => history.apply_tag(tag_data, MAX_HISTORY_TAG_SIZE_OS3),
        }
        Some(history)
    }

    /// `[tag_len][tag...]`
    fn apply_tag(&mut self, tag_data: &[u8], max_len: usize) {
        let Some((&len_byte, rest)) = tag_data.split_first() else {
            return;
        };
        let mut tag_len = usize::from(len_byte);
        if matches!(
            self.history_type,
            HistoryType::BleLock | HistoryType::BleUnlock
        ) {
            let lock = self.history_type == HistoryType::BleLock;
            if tag_len >= 60 {
                self.history_type = if lock {
                    HistoryType::WebLock
                } else {
                    HistoryType::WebUnlock
                };
                tag_len %= 30;
            } else if tag_len >= 30 {
                self.history_type = if lock {
                    HistoryType::Wm2Lock
                } else {
                    HistoryType::Wm2Unlock
                };
                tag_len %= 30;
            }
        }
        let tag_len = tag_len.min(max_len).min(rest.len());
        self.tag = cleanup_tail_utf8(&rest[..tag_len]).to_owned();
    }
}
