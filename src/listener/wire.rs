//! Decoded wire payloads and the command dispatch table
//!
//! Connections hand over `(cmd, body)` pairs. `classify` looks the command
//! up in `COMMAND_TABLE` and turns the body into a canonical record. Bodies
//! missing expected fields are reported as `Malformed` and dropped by the
//! caller; they are never fatal.

use super::types::{EventKind, RaffleEvent};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Accept a number or a numeric string
pub fn de_num<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .to_string()
            .parse()
            .map_err(|_| de::Error::custom(format!("number out of range: {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("not a number: {:?}", s))),
        other => Err(de::Error::custom(format!("expected number, got {}", other))),
    }
}

fn de_opt_num<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => de_num(value).map(Some).map_err(de::Error::custom),
    }
}

/// System broadcast pointing at a (possibly different) room
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub kind: EventKind,
    pub target_room_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Giveaway(RaffleEvent),
    Broadcast(Broadcast),
}

/// Result of dispatching one wire payload
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Recognized(Classified),
    /// Known command that carries nothing of interest (e.g. a storm ending)
    Ignored,
    /// Known command with missing or mistyped fields
    Malformed(String),
    /// Command not in the table
    Unrecognized,
}

type Classifier = fn(u64, &Value, i64) -> Result<Option<Classified>, String>;

/// Wire command -> classifier
pub const COMMAND_TABLE: &[(&str, Classifier)] = &[
    ("TV_START", raffle_start),
    ("RAFFLE_START", raffle_start),
    ("LOTTERY_START", lottery_start),
    ("GUARD_LOTTERY_START", lottery_start),
    ("PK_LOTTERY_START", pk_lottery_start),
    ("SPECIAL_GIFT", special_gift),
    ("SYS_MSG", sys_msg),
    ("SYS_GIFT", sys_gift),
];

/// Classify one decoded payload from `room_id`, observed at `now_ms`
pub fn classify(cmd: &str, room_id: u64, body: &Value, now_ms: i64) -> Dispatch {
    let Some((_, classifier)) = COMMAND_TABLE.iter().find(|(name, _)| *name == cmd) else {
        return Dispatch::Unrecognized;
    };
    match classifier(room_id, body, now_ms) {
        Ok(Some(classified)) => Dispatch::Recognized(classified),
        Ok(None) => Dispatch::Ignored,
        Err(reason) => Dispatch::Malformed(reason),
    }
}

fn data_of<T: DeserializeOwned>(body: &Value) -> Result<T, String> {
    let data = body.get("data").ok_or_else(|| "missing data".to_string())?;
    T::deserialize(data).map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize)]
struct RaffleStart {
    #[serde(rename = "raffleId", deserialize_with = "de_num")]
    raffle_id: u64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
    #[serde(default, deserialize_with = "de_opt_num")]
    max_time: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_num")]
    time_wait: Option<i64>,
}

fn raffle_start(room_id: u64, body: &Value, _now_ms: i64) -> Result<Option<Classified>, String> {
    let data: RaffleStart = data_of(body)?;
    let kind = if data.kind == "small_tv" {
        EventKind::InstantGiveaway
    } else {
        EventKind::ScheduledGiveaway
    };
    Ok(Some(Classified::Giveaway(RaffleEvent {
        kind,
        room_id,
        id: data.raffle_id,
        subtype: data.kind,
        title: data.title,
        time: data.time,
        max_time: data.max_time,
        time_wait: data.time_wait,
        num: None,
        observed_at_ms: None,
    })))
}

#[derive(Debug, Deserialize)]
struct LotteryStart {
    #[serde(deserialize_with = "de_num")]
    id: u64,
    #[serde(rename = "type", default)]
    kind: String,
    lottery: LotteryTiming,
}

#[derive(Debug, Deserialize)]
struct LotteryTiming {
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
}

fn lottery_start(room_id: u64, body: &Value, _now_ms: i64) -> Result<Option<Classified>, String> {
    let data: LotteryStart = data_of(body)?;
    Ok(Some(Classified::Giveaway(RaffleEvent {
        kind: EventKind::FleetGiveaway,
        room_id,
        id: data.id,
        subtype: data.kind,
        title: "Fleet Lottery".to_string(),
        time: data.lottery.time,
        max_time: None,
        time_wait: None,
        num: None,
        observed_at_ms: None,
    })))
}

#[derive(Debug, Deserialize)]
struct PkLotteryStart {
    #[serde(deserialize_with = "de_num")]
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
}

fn pk_lottery_start(room_id: u64, body: &Value, _now_ms: i64) -> Result<Option<Classified>, String> {
    let data: PkLotteryStart = data_of(body)?;
    Ok(Some(Classified::Giveaway(RaffleEvent {
        kind: EventKind::PkGiveaway,
        room_id,
        id: data.id,
        subtype: "pk".to_string(),
        title: data.title,
        time: data.time,
        max_time: None,
        time_wait: None,
        num: None,
        observed_at_ms: None,
    })))
}

/// Special gift id carrying beat storms
const BEAT_STORM_GIFT: &str = "39";

#[derive(Debug, Deserialize)]
struct BeatStorm {
    #[serde(default)]
    action: String,
    #[serde(deserialize_with = "de_num")]
    id: u64,
    #[serde(default, deserialize_with = "de_opt_num")]
    num: Option<u64>,
}

fn special_gift(room_id: u64, body: &Value, now_ms: i64) -> Result<Option<Classified>, String> {
    let gifts: HashMap<String, Value> = data_of(body)?;
    let Some(storm) = gifts.get(BEAT_STORM_GIFT) else {
        return Ok(None);
    };
    let storm = BeatStorm::deserialize(storm).map_err(|e| e.to_string())?;
    if storm.action != "start" {
        return Ok(None);
    }
    // No start time on the wire; stamp local observation time
    Ok(Some(Classified::Giveaway(RaffleEvent {
        kind: EventKind::StormGiveaway,
        room_id,
        id: storm.id,
        subtype: "beatStorm".to_string(),
        title: "Beat Storm".to_string(),
        time: 0,
        max_time: None,
        time_wait: None,
        num: storm.num,
        observed_at_ms: Some(now_ms),
    })))
}

#[derive(Debug, Deserialize)]
struct SystemMessage {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    msg_text: String,
    #[serde(default, deserialize_with = "de_opt_num")]
    real_roomid: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_num")]
    roomid: Option<u64>,
}

fn broadcast(kind: EventKind, body: &Value) -> Result<Option<Classified>, String> {
    let message = SystemMessage::deserialize(body).map_err(|e| e.to_string())?;
    let target = message
        .real_roomid
        .or(message.roomid)
        .filter(|&id| id > 0)
        .ok_or_else(|| "missing target room".to_string())?;
    let text = if message.msg.is_empty() {
        message.msg_text
    } else {
        message.msg
    };
    if text.is_empty() {
        return Err("missing message text".to_string());
    }
    Ok(Some(Classified::Broadcast(Broadcast {
        kind,
        target_room_id: target,
        text,
    })))
}

fn sys_msg(_room_id: u64, body: &Value, _now_ms: i64) -> Result<Option<Classified>, String> {
    broadcast(EventKind::SystemBroadcast, body)
}

fn sys_gift(_room_id: u64, body: &Value, _now_ms: i64) -> Result<Option<Classified>, String> {
    broadcast(EventKind::SystemGiftBroadcast, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn giveaway(dispatch: Dispatch) -> RaffleEvent {
        match dispatch {
            Dispatch::Recognized(Classified::Giveaway(event)) => event,
            other => panic!("expected giveaway, got {:?}", other),
        }
    }

    #[test]
    fn test_raffle_start_small_tv_is_instant() {
        let body = json!({
            "cmd": "TV_START",
            "data": {"raffleId": "500", "type": "small_tv", "title": "Small TV", "time": 180, "max_time": 180, "time_wait": 120}
        });

        let event = giveaway(classify("TV_START", 1001, &body, 0));

        assert_eq!(event.kind, EventKind::InstantGiveaway);
        assert_eq!(event.id, 500);
        assert_eq!(event.room_id, 1001);
        assert_eq!(event.time_wait, Some(120));
    }

    #[test]
    fn test_raffle_start_other_type_is_scheduled() {
        let body = json!({"data": {"raffleId": 501, "type": "GIFT_30035", "title": "Lantern", "time": 60}});
        let event = giveaway(classify("RAFFLE_START", 1, &body, 0));
        assert_eq!(event.kind, EventKind::ScheduledGiveaway);
        assert_eq!(event.max_time, None);
    }

    #[test]
    fn test_guard_lottery() {
        let body = json!({"data": {"id": 8801, "type": "guard", "lottery": {"time": 1200}}});
        let event = giveaway(classify("GUARD_LOTTERY_START", 7, &body, 0));
        assert_eq!(event.kind, EventKind::FleetGiveaway);
        assert_eq!(event.title, "Fleet Lottery");
        assert_eq!(event.time, 1200);
    }

    #[test]
    fn test_pk_lottery() {
        let body = json!({"data": {"id": 12, "title": "PK Battle", "time": 60}});
        let event = giveaway(classify("PK_LOTTERY_START", 7, &body, 0));
        assert_eq!(event.kind, EventKind::PkGiveaway);
        assert_eq!(event.subtype, "pk");
    }

    #[test]
    fn test_beat_storm_start_is_stamped() {
        let body = json!({"data": {"39": {"action": "start", "id": "100000001000", "num": 100, "content": "go"}}});
        let event = giveaway(classify("SPECIAL_GIFT", 3, &body, 1_700_000_000_000));
        assert_eq!(event.kind, EventKind::StormGiveaway);
        assert_eq!(event.id, 100000001000);
        assert_eq!(event.num, Some(100));
        assert_eq!(event.observed_at_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn test_beat_storm_end_and_other_gifts_ignored() {
        let end = json!({"data": {"39": {"action": "end", "id": 1}}});
        assert_eq!(classify("SPECIAL_GIFT", 3, &end, 0), Dispatch::Ignored);

        let other = json!({"data": {"40": {"action": "start"}}});
        assert_eq!(classify("SPECIAL_GIFT", 3, &other, 0), Dispatch::Ignored);
    }

    #[test]
    fn test_sys_msg_targets_real_room() {
        let body = json!({"cmd": "SYS_MSG", "msg": "someone sent a small TV", "real_roomid": 5555, "roomid": 55});
        match classify("SYS_MSG", 1, &body, 0) {
            Dispatch::Recognized(Classified::Broadcast(b)) => {
                assert_eq!(b.kind, EventKind::SystemBroadcast);
                assert_eq!(b.target_room_id, 5555);
                assert_eq!(b.text, "someone sent a small TV");
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn test_sys_gift_falls_back_to_roomid_and_msg_text() {
        let body = json!({"cmd": "SYS_GIFT", "msg_text": "gift!", "roomid": "88"});
        match classify("SYS_GIFT", 1, &body, 0) {
            Dispatch::Recognized(Classified::Broadcast(b)) => {
                assert_eq!(b.kind, EventKind::SystemGiftBroadcast);
                assert_eq!(b.target_room_id, 88);
                assert_eq!(b.text, "gift!");
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        assert!(matches!(classify("RAFFLE_START", 1, &json!({}), 0), Dispatch::Malformed(_)));
        assert!(matches!(
            classify("LOTTERY_START", 1, &json!({"data": {"id": 1}}), 0),
            Dispatch::Malformed(_)
        ));
        assert!(matches!(classify("SYS_MSG", 1, &json!({"msg": "x"}), 0), Dispatch::Malformed(_)));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(classify("DANMU_MSG", 1, &json!({}), 0), Dispatch::Unrecognized);
    }
}
