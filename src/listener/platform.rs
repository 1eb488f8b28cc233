//! Live-platform HTTP API
//!
//! Endpoints used (relative to `API_LIVE_ORIGIN`):
//! - `/room/v1/Area/getLiveRoomCountByAreaID?areaId=0` - number of live rooms
//! - `/room/v1/Area/getListByAreaID?page={n}&pageSize={s}` - one page of live rooms
//! - `/room/v1/Room/mobileRoomInit?id={room}` - room owner lookup
//! - `/xlive/lottery-interface/v1/lottery/Check?roomid={room}` - active giveaways
//!
//! Every response is wrapped in `{ code, message, data }`; a non-zero `code`
//! is an application-level failure even on HTTP 200.

use super::config::ListenerConfig;
use super::types::{EventKind, RaffleEvent, RoomTarget};
use super::wire::de_num;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug)]
pub enum PlatformError {
    Http(reqwest::Error),
    Status(u16),
    Api { code: i64, message: String },
    Timeout,
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PlatformError::Timeout
        } else {
            PlatformError::Http(err)
        }
    }
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformError::Http(e) => write!(f, "HTTP error: {}", e),
            PlatformError::Status(code) => write!(f, "Unexpected HTTP status: {}", code),
            PlatformError::Api { code, message } => write!(f, "API error {}: {}", code, message),
            PlatformError::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Platform endpoints the listener consumes
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Number of rooms currently live platform-wide
    async fn live_room_count(&self) -> Result<u64, PlatformError>;

    /// One page (1-based) of currently live rooms
    async fn live_room_page(&self, page: u64, page_size: u64) -> Result<Vec<RoomTarget>, PlatformError>;

    /// Owner id of a room
    async fn owner_id(&self, room_id: u64) -> Result<u64, PlatformError>;

    /// Giveaways currently active in a room, as canonical events
    async fn room_raffles(&self, room_id: u64) -> Result<Vec<RaffleEvent>, PlatformError>;
}

/// Resolve a room's owner id, 0 when the lookup fails
pub async fn owner_id_or_zero(platform: &dyn PlatformApi, room_id: u64) -> u64 {
    match platform.owner_id(room_id).await {
        Ok(owner) => owner,
        Err(e) => {
            log::debug!("⚠️  Owner lookup failed for room {}: {}", room_id, e);
            0
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, PlatformError> {
        match (self.code, self.data) {
            (0, Some(data)) => Ok(data),
            (code, _) => Err(PlatformError::Api {
                code,
                message: self.message,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LiveRoomCount {
    #[serde(deserialize_with = "de_num")]
    num: u64,
}

#[derive(Debug, Deserialize)]
struct LiveRoom {
    #[serde(deserialize_with = "de_num")]
    roomid: u64,
    #[serde(default, deserialize_with = "de_num")]
    uid: u64,
}

#[derive(Debug, Deserialize)]
struct RoomInit {
    #[serde(deserialize_with = "de_num")]
    uid: u64,
}

#[derive(Debug, Default, Deserialize)]
struct LotteryCheck {
    #[serde(default)]
    gift: Vec<GiftRaffle>,
    #[serde(default)]
    guard: Vec<GuardLottery>,
    #[serde(default)]
    pk: Vec<PkLottery>,
}

#[derive(Debug, Deserialize)]
struct GiftRaffle {
    #[serde(rename = "raffleId", deserialize_with = "de_num")]
    raffle_id: u64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
    #[serde(default, deserialize_with = "de_num")]
    max_time: i64,
    #[serde(default, deserialize_with = "de_num")]
    time_wait: i64,
}

#[derive(Debug, Deserialize)]
struct GuardLottery {
    #[serde(deserialize_with = "de_num")]
    id: u64,
    #[serde(default = "guard_type")]
    keyword: String,
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
}

fn guard_type() -> String {
    "guard".to_string()
}

#[derive(Debug, Deserialize)]
struct PkLottery {
    #[serde(deserialize_with = "de_num")]
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "de_num")]
    time: i64,
}

impl LotteryCheck {
    fn into_events(self, room_id: u64) -> Vec<RaffleEvent> {
        let gifts = self.gift.into_iter().map(|g| RaffleEvent {
            kind: if g.kind == "small_tv" {
                EventKind::InstantGiveaway
            } else {
                EventKind::ScheduledGiveaway
            },
            room_id,
            id: g.raffle_id,
            subtype: g.kind,
            title: g.title,
            time: g.time,
            max_time: Some(g.max_time),
            time_wait: Some(g.time_wait),
            num: None,
            observed_at_ms: None,
        });
        let guards = self.guard.into_iter().map(|g| RaffleEvent {
            kind: EventKind::FleetGiveaway,
            room_id,
            id: g.id,
            subtype: g.keyword,
            title: "Fleet Lottery".to_string(),
            time: g.time,
            max_time: None,
            time_wait: None,
            num: None,
            observed_at_ms: None,
        });
        let pks = self.pk.into_iter().map(|p| RaffleEvent {
            kind: EventKind::PkGiveaway,
            room_id,
            id: p.id,
            subtype: "pk".to_string(),
            title: p.title,
            time: p.time,
            max_time: None,
            time_wait: None,
            num: None,
            observed_at_ms: None,
        });
        gifts.chain(guards).chain(pks).collect()
    }
}

/// `PlatformApi` over HTTP with a bounded request timeout
pub struct HttpPlatformApi {
    client: reqwest::Client,
    origin: String,
}

impl HttpPlatformApi {
    pub fn new(origin: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Linux; Android 10) raffle-listener")
            .build()?;

        Ok(Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
        })
    }

    /// Client for `API_LIVE_ORIGIN` with `REQUEST_TIMEOUT_MS` per request
    pub fn from_config(config: &ListenerConfig) -> Result<Self, PlatformError> {
        Self::new(&config.api_live_origin, config.request_timeout())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let url = format!("{}{}", self.origin, path);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(PlatformError::Status(response.status().as_u16()));
        }

        let envelope: Envelope<T> = response.json().await?;
        envelope.into_data()
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformApi {
    async fn live_room_count(&self) -> Result<u64, PlatformError> {
        let count: LiveRoomCount = self
            .get("/room/v1/Area/getLiveRoomCountByAreaID?areaId=0")
            .await?;
        Ok(count.num)
    }

    async fn live_room_page(&self, page: u64, page_size: u64) -> Result<Vec<RoomTarget>, PlatformError> {
        let rooms: Vec<LiveRoom> = self
            .get(&format!("/room/v1/Area/getListByAreaID?page={}&pageSize={}", page, page_size))
            .await?;
        Ok(rooms
            .into_iter()
            .map(|room| RoomTarget::new(room.roomid, room.uid))
            .collect())
    }

    async fn owner_id(&self, room_id: u64) -> Result<u64, PlatformError> {
        let init: RoomInit = self
            .get(&format!("/room/v1/Room/mobileRoomInit?id={}", room_id))
            .await?;
        Ok(init.uid)
    }

    async fn room_raffles(&self, room_id: u64) -> Result<Vec<RaffleEvent>, PlatformError> {
        let check: LotteryCheck = self
            .get(&format!("/xlive/lottery-interface/v1/lottery/Check?roomid={}", room_id))
            .await?;
        Ok(check.into_events(room_id))
    }
}
